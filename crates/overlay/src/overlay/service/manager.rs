use std::{
    collections::{HashMap, HashSet},
    marker::PhantomData,
    sync::Arc,
    task::Poll,
    time::Duration,
};

use discv5::enr::NodeId;
use futures::future;
use parking_lot::{Mutex, RwLock};
use portal_api::{
    generate_random_node_id,
    types::{
        distance::Distance,
        enr::Enr,
        portal_wire::{Message, Request, Response},
    },
    utils::bytes::hex_encode_compact,
    OverlayContentKey,
};
use portal_storage::ContentStore;
use rand::Rng;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info, trace, warn};

use super::OverlayService;
use crate::{
    accept_queue::TransferringKeys,
    find::{
        iterators::query::Query,
        query_info::QueryInfo,
        query_pool::{QueryId, QueryPool, QueryPoolState},
    },
    overlay::{
        command::OverlayCommand,
        config::OverlayConfig,
        errors::OverlayRequestError,
        request::{
            ActiveOutgoingRequest, OverlayRequest, OverlayRequestId, OverlayResponse,
            RequestDirection,
        },
    },
    stream::{rate_limiter::OfferRateLimiter, StreamController},
    transport::RequestTransport,
    types::kbucket::{FailureOutcome, SharedRoutingTable, NUM_BUCKETS},
    versions::VersionsCache,
};

/// Maximum number of ENRs in response to FindNodes.
pub const FIND_NODES_MAX_NODES: usize = 32;

/// Maximum number of ENRs in response to FindContent.
pub const FIND_CONTENT_MAX_NODES: usize = 32;

/// With even distribution assumptions, 2**17 is enough to put each node (estimating 100k nodes,
/// which is more than 10x the ethereum mainnet node count) into a unique bucket by the 17th
/// bucket index.
const EXPECTED_NON_EMPTY_BUCKETS: usize = 17;

/// Bucket refresh lookup interval in seconds
const BUCKET_REFRESH_INTERVAL_SECS: u64 = 60;

/// An event generated by a poll of a query pool.
pub enum QueryEvent<TQuery, TContentKey> {
    /// The query is waiting on a request to the given peer.
    Waiting(QueryId, NodeId, Request),
    /// The query issuer went away; the query should be dropped.
    Cancelled(QueryId),
    /// The query finished.
    Finished(QueryId, QueryInfo<TContentKey>, TQuery),
    /// The query timed out.
    TimedOut(QueryId, QueryInfo<TContentKey>, TQuery),
}

impl<TContentKey, TStore> OverlayService<TContentKey, TStore>
where
    TContentKey: OverlayContentKey,
    TStore: ContentStore<Key = TContentKey> + Send + 'static,
{
    /// Spawns the overlay network service.
    ///
    /// The state of the overlay network largely consists of its routing table. The routing
    /// table is updated according to incoming requests and responses as well as autonomous
    /// maintenance processes.
    pub fn spawn(
        config: OverlayConfig,
        transport: Arc<dyn RequestTransport>,
        store: Arc<Mutex<TStore>>,
        kbuckets: SharedRoutingTable,
        versions: Arc<VersionsCache>,
        stream_controller: Arc<StreamController>,
    ) -> UnboundedSender<OverlayCommand<TContentKey>> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let internal_command_tx = command_tx.clone();

        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let offer_rate_limiter = Arc::new(OfferRateLimiter::new(
            config.offer_rate_capacity,
            config.offer_rate_per_sec,
        ));

        tokio::spawn(async move {
            let mut service = Self {
                transport,
                store,
                kbuckets,
                versions,
                command_rx,
                command_tx: internal_command_tx,
                active_outgoing_requests: Arc::new(RwLock::new(HashMap::new())),
                find_node_query_pool: QueryPool::new(config.query_timeout),
                find_content_query_pool: QueryPool::new(config.query_timeout),
                query_peer_timeout: config.query_peer_timeout,
                query_parallelism: config.query_parallelism,
                query_num_results: config.query_num_results,
                findnodes_query_distances_per_peer: config.findnodes_query_distances_per_peer,
                response_rx,
                response_tx,
                stream_controller,
                offer_rate_limiter,
                transferring_keys: Arc::new(RwLock::new(TransferringKeys::default())),
                inflight_pings: HashSet::new(),
                revalidation_interval: config.revalidation_interval,
                ping_timeout: config.ping_timeout,
                request_timeout: config.request_timeout,
                disable_poke: config.disable_poke,
                _phantom_content_key: PhantomData,
            };

            info!("Starting overlay service");
            service.initialize_routing_table(config.bootnode_enrs);
            service.start().await;
        });

        command_tx
    }

    /// Inserts the seed ENRs into the routing table and queues a liveness check for each.
    fn add_bootnodes(&mut self, bootnode_enrs: Vec<Enr>) {
        let result = self.kbuckets.insert_or_update_discovered_nodes(bootnode_enrs);
        for node_id in result.inserted_nodes {
            debug!(bootnode = %node_id, "Inserted bootnode into routing table");
            if let Some(node) = self.kbuckets.entry(node_id) {
                self.ping_node(node);
            }
        }
    }

    /// Begins the initial FINDNODES queries to populate the routing table.
    fn initialize_routing_table(&mut self, bootnodes: Vec<Enr>) {
        self.add_bootnodes(bootnodes);
        let local_node_id = self.local_enr().node_id();

        // Begin request for our local node ID.
        self.init_find_nodes_query(&local_node_id, None);

        for bucket_index in (255 - EXPECTED_NON_EMPTY_BUCKETS as u8)..255 {
            let target_node_id = generate_random_node_id(bucket_index, local_node_id);
            self.init_find_nodes_query(&target_node_id, None);
        }
    }

    /// The main loop for the overlay service. The loop selects over different possible tasks to
    /// perform.
    ///
    /// Process request: Process an incoming or outgoing request through the overlay.
    ///
    /// Process response: Process a response to an outgoing request from the local node. Try to
    /// match this response to an active request, and send the response or error over the
    /// associated response channel. Update node state based on result of response.
    ///
    /// Revalidation: Ping the least-recently seen node of a random bucket to perform a liveness
    /// check.
    ///
    /// Bucket refresh: Run a FINDNODES query towards a random target in a far bucket to keep
    /// the routing table populated.
    async fn start(&mut self) {
        let mut revalidation_interval = tokio::time::interval(self.revalidation_interval);
        let mut bucket_refresh_interval =
            tokio::time::interval(Duration::from_secs(BUCKET_REFRESH_INTERVAL_SECS));
        // The first tick of an interval fires immediately; skip past it so startup queries have
        // a chance to populate the table first.
        revalidation_interval.reset();
        bucket_refresh_interval.reset();

        loop {
            tokio::select! {
                Some(command) = self.command_rx.recv() => {
                    match command {
                        OverlayCommand::Request(request) => self.process_request(request),
                        OverlayCommand::FindContentQuery { target, callback } => {
                            self.init_find_content_query(target, callback);
                        }
                        OverlayCommand::FindNodeQuery { target, callback } => {
                            self.init_find_nodes_query(&target, Some(callback));
                        }
                    }
                }
                Some(response) = self.response_rx.recv() => {
                    // Look up active request that corresponds to the response.
                    let active_request = self.active_outgoing_requests.write().remove(&response.request_id);
                    if let Some(request) = active_request {
                        // Send response to responder if present.
                        if let Some(responder) = request.responder {
                            let _ = responder.send(response.response.clone());
                        }

                        // Perform background processing.
                        match response.response {
                            Ok(response) => self.process_response(
                                response,
                                request.destination,
                                request.request,
                                request.query_id,
                                request.request_permit,
                            ),
                            Err(error) => self.process_request_failure(
                                response.request_id,
                                request.destination,
                                error,
                            ),
                        }
                    } else {
                        warn!(
                            request.id = %hex_encode_compact(response.request_id.to_be_bytes()),
                            "No request found for response",
                        );
                    }
                }
                _ = revalidation_interval.tick() => {
                    self.revalidate_node();
                }
                _ = bucket_refresh_interval.tick() => {
                    trace!("Routing table bucket refresh");
                    self.bucket_refresh_lookup();
                }
                query_event = Self::query_event_poll(&mut self.find_node_query_pool) => {
                    self.handle_find_nodes_query_event(query_event);
                }
                query_event = Self::query_event_poll(&mut self.find_content_query_pool) => {
                    self.handle_find_content_query_event(query_event);
                }
            }
        }
    }

    /// Pings the least-recently seen live entry of a random bucket, skipping peers with a ping
    /// already in flight. The network round trip happens outside any table lock.
    fn revalidate_node(&mut self) {
        let Some(node) = self.kbuckets.revalidation_candidate() else {
            return;
        };
        if self.inflight_pings.contains(&node.enr.node_id()) {
            return;
        }
        self.ping_node(node);
    }

    /// Main bucket refresh lookup logic.
    fn bucket_refresh_lookup(&mut self) {
        // Only the furthest buckets are expected to be non-empty; the closest ~239 bits of
        // buckets are going to be empty-ish.
        let target_node_id = {
            let bucket =
                rand::rng().random_range(NUM_BUCKETS - EXPECTED_NON_EMPTY_BUCKETS..NUM_BUCKETS);

            trace!(bucket = %bucket, "Refreshing routing table bucket");
            match u8::try_from(bucket) {
                Ok(idx) => generate_random_node_id(idx, self.local_enr().node_id()),
                Err(err) => {
                    error!(error = %err, "Error downcasting bucket index");
                    return;
                }
            }
        };

        self.init_find_nodes_query(&target_node_id, None);
    }

    /// Returns the local ENR of the node.
    pub(super) fn local_enr(&self) -> Enr {
        self.transport.local_enr()
    }

    /// Returns the data radius of the node.
    pub(super) fn data_radius(&self) -> Distance {
        self.store.lock().radius()
    }

    /// Maintains the query pool.
    ///
    /// Returns a `QueryEvent` when the `QueryPoolState` updates. This happens when a query
    /// needs to send a request to a node, when a query has completed or timed out, or when a
    /// query issuer has gone away.
    async fn query_event_poll<TQuery: Query>(
        queries: &mut QueryPool<TQuery, TContentKey>,
    ) -> QueryEvent<TQuery, TContentKey> {
        future::poll_fn(move |_cx| match queries.poll() {
            QueryPoolState::Finished(query_id, query_info, query) => {
                Poll::Ready(QueryEvent::Finished(query_id, query_info, query))
            }
            QueryPoolState::Timeout(query_id, query_info, query) => {
                warn!(query.id = %query_id, "Query timed out");
                Poll::Ready(QueryEvent::TimedOut(query_id, query_info, query))
            }
            QueryPoolState::Waiting(Some((query_id, query_info, query, return_peer))) => {
                // A dropped callback receiver cancels the lookup; no further requests are
                // issued on its behalf.
                if query_info.is_cancelled() {
                    return Poll::Ready(QueryEvent::Cancelled(query_id));
                }

                let node_id = return_peer;

                let request_body = match query_info.rpc_request(return_peer) {
                    Ok(request_body) => request_body,
                    Err(_) => {
                        query.on_failure(&node_id);
                        return Poll::Pending;
                    }
                };

                Poll::Ready(QueryEvent::Waiting(query_id, node_id, request_body))
            }

            QueryPoolState::Waiting(None) | QueryPoolState::Idle => Poll::Pending,
        })
        .await
    }

    /// Processes an overlay request.
    pub(super) fn process_request(&mut self, request: OverlayRequest) {
        // For incoming requests, handle the request, possibly send the response over the
        // channel, and then process the request.
        //
        // For outgoing requests, send the request via the transport, send the response over the
        // channel, and then process the response. There may not be a response channel if the
        // request was initiated internally (e.g. for maintenance).
        match request.direction {
            RequestDirection::Incoming { source } => {
                self.register_node_activity(source);

                let response = self.handle_request(request.request.clone(), &source);
                // Send response to responder if present.
                if let Some(responder) = request.responder {
                    let _ = responder.send(response);
                }
                // Perform background processing.
                self.process_incoming_request(request.request, source);
            }
            RequestDirection::Outgoing { destination } => {
                self.active_outgoing_requests.write().insert(
                    request.id,
                    ActiveOutgoingRequest {
                        destination: destination.clone(),
                        responder: request.responder,
                        request: request.request.clone(),
                        query_id: request.query_id,
                        request_permit: request.request_permit,
                    },
                );
                self.send_request(request.request, request.id, destination);
            }
        }
    }

    /// Attempts to build a response for a request.
    fn handle_request(
        &mut self,
        request: Request,
        source: &NodeId,
    ) -> Result<Response, OverlayRequestError> {
        match request {
            Request::Ping(ping) => Ok(Response::Pong(self.handle_ping(ping, source))),
            Request::FindNodes(find_nodes) => {
                Ok(Response::Nodes(self.handle_find_nodes(find_nodes, source)))
            }
            Request::FindContent(find_content) => Ok(Response::Content(
                self.handle_find_content(find_content, source)?,
            )),
            Request::Offer(offer) => Ok(Response::Accept(self.handle_offer(offer, source)?)),
            Request::PopulatedOffer(_) | Request::PopulatedOfferWithResult(_) => {
                Err(OverlayRequestError::InvalidRequest(
                    "An offer with content attached is not a valid network message to receive"
                        .to_owned(),
                ))
            }
        }
    }

    /// Sends a request via the transport to some destination node.
    ///
    /// The call is spawned onto its own task so the main loop never waits on a network round
    /// trip; the response arrives back over the response channel.
    fn send_request(&self, request: Request, request_id: OverlayRequestId, destination: Enr) {
        let transport = Arc::clone(&self.transport);
        let response_tx = self.response_tx.clone();
        let timeout = self.timeout_for(&request);

        tokio::spawn(async move {
            let payload: Vec<u8> = Message::from(request).into();
            let response =
                match tokio::time::timeout(timeout, transport.send_request(&destination, payload))
                    .await
                {
                    Ok(Ok(frame)) => match Message::try_from(frame) {
                        Ok(message) => match Response::try_from(message) {
                            Ok(response) => Ok(response),
                            Err(_) => Err(OverlayRequestError::InvalidResponse),
                        },
                        Err(_) => Err(OverlayRequestError::DecodeError),
                    },
                    Ok(Err(error)) => Err(error.into()),
                    Err(_) => Err(OverlayRequestError::Timeout),
                };

            let _ = response_tx.send(OverlayResponse {
                request_id,
                response,
            });
        });
    }

    /// The per-request deadline: liveness checks are quick, content requests may stream.
    fn timeout_for(&self, request: &Request) -> Duration {
        match request {
            Request::Ping(_) => self.ping_timeout,
            _ => self.request_timeout,
        }
    }

    /// Processes an incoming request from some source node, after the response has been sent.
    fn process_incoming_request(&mut self, request: Request, source: NodeId) {
        if let Request::Ping(ping) = request {
            self.process_ping(ping, source);
        }
    }

    /// Register source NodeId activity in overlay routing table.
    fn register_node_activity(&mut self, source: NodeId) {
        // If the node is known in the routing table, record the direct observation. If it is
        // not, then we cannot construct an entry from the node ID alone; look for the node's
        // ENR in the transport's cache and insert it when found.
        match self.kbuckets.entry(source) {
            Some(node) => {
                self.kbuckets.seen(node.enr, None);
            }
            None => {
                if let Some(enr) = self.transport.cached_enr(&source) {
                    self.kbuckets.seen(enr, None);
                }
            }
        }
    }

    /// Processes a failed request intended for some destination node.
    fn process_request_failure(
        &mut self,
        request_id: OverlayRequestId,
        destination: Enr,
        error: OverlayRequestError,
    ) {
        let node_id = destination.node_id();
        debug!(
            request.id = %hex_encode_compact(request_id.to_be_bytes()),
            request.dest = %node_id,
            error = %error,
            "Request failed",
        );

        self.inflight_pings.remove(&node_id);
        if let FailureOutcome::Evicted { promoted } = self.kbuckets.record_failure(node_id) {
            self.versions.invalidate(node_id);
            if let Some(promoted) = promoted {
                // The promoted replacement has not proven liveness yet.
                if let Some(node) = self.kbuckets.entry(promoted) {
                    self.ping_node(node);
                }
            }
        }
    }

    /// Processes a response to an outgoing request from some source node.
    fn process_response(
        &mut self,
        response: Response,
        source: Enr,
        request: Request,
        query_id: Option<QueryId>,
        request_permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) {
        // Any response is direct evidence of the peer's liveness.
        let node_id = source.node_id();
        self.inflight_pings.remove(&node_id);
        self.kbuckets.seen(source.clone(), None);

        match response {
            Response::Pong(pong) => self.process_pong(pong, source),
            Response::Nodes(nodes) => self.process_nodes(nodes, source, query_id),
            Response::Content(content) => self.process_content(content, source, query_id),
            Response::Accept(accept) => {
                if let Err(err) = self.process_accept(accept, source, request, request_permit) {
                    error!(response.error = %err, "Error processing ACCEPT message")
                }
            }
        }
    }

    /// Processes a collection of discovered nodes: insert new ones and ping them to establish
    /// liveness.
    pub(super) fn process_discovered_enrs(&mut self, enrs: Vec<Enr>) {
        let local_node_id = self.local_enr().node_id();

        // Ignore ourself.
        let enrs = enrs
            .into_iter()
            .filter(|enr| enr.node_id() != local_node_id);

        let result = self.kbuckets.insert_or_update_discovered_nodes(enrs);
        for node_id in result.inserted_nodes {
            if let Some(node) = self.kbuckets.entry(node_id) {
                self.ping_node(node);
            }
        }
    }

    /// Looks up the ENR for a node id, first in the routing table, then in the untrusted ENRs
    /// of active queries, and finally in the transport's cache.
    pub(super) fn find_enr(&self, node_id: &NodeId) -> Option<Enr> {
        if let Some(node) = self.kbuckets.entry(*node_id) {
            return Some(node.enr);
        }
        let check_pool = |query_info: &QueryInfo<TContentKey>| {
            query_info
                .untrusted_enrs
                .iter()
                .find(|enr| &enr.node_id() == node_id)
                .cloned()
        };
        for (query_info, _) in self.find_node_query_pool.iter() {
            if let Some(enr) = check_pool(query_info) {
                return Some(enr);
            }
        }
        for (query_info, _) in self.find_content_query_pool.iter() {
            if let Some(enr) = check_pool(query_info) {
                return Some(enr);
            }
        }
        self.transport.cached_enr(node_id)
    }
}
