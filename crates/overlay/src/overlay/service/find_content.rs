use std::sync::Arc;

use bytes::Bytes;
use discv5::enr::NodeId;
use futures::channel::oneshot;
use portal_api::{
    types::{
        distance::{Metric, XorMetric},
        enr::{Enr, SszEnr},
        portal_wire::{
            Content, FindContent, PopulatedOffer, Request, Response,
            MAX_PORTAL_CONTENT_PAYLOAD_SIZE,
        },
    },
    utils::bytes::hex_encode_compact,
    OverlayContentKey, RawContentValue,
};
use portal_storage::{ContentStore, ShouldWeStoreContent};
use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use super::{
    manager::{QueryEvent, FIND_CONTENT_MAX_NODES},
    offer::TransferProcessing,
    utils::pop_while_ssz_bytes_len_gt,
    OverlayService,
};
use crate::{
    find::{
        iterators::{
            findcontent::{FindContentQuery, FindContentQueryResponse, FindContentQueryResult},
            query::{Query, QueryConfig},
        },
        query_info::{QueryInfo, QueryType, RecursiveFindContentResult},
        query_pool::QueryId,
    },
    gossip::propagate_gossip_cross_thread,
    overlay::{
        command::OverlayCommand,
        errors::OverlayRequestError,
        request::{OverlayRequest, RequestDirection},
    },
    stream::{decode_find_content_payload, encode_find_content_payload},
    transport::ConnectionId,
};

impl<TContentKey, TStore> OverlayService<TContentKey, TStore>
where
    TContentKey: OverlayContentKey,
    TStore: ContentStore<Key = TContentKey> + Send + 'static,
{
    /// Attempts to build a `Content` response for a `FindContent` request.
    pub(super) fn handle_find_content(
        &mut self,
        request: FindContent,
        source: &NodeId,
    ) -> Result<Content, OverlayRequestError> {
        trace!(
            request.source = %source,
            "Handling FindContent message",
        );
        let content_key = TContentKey::try_from_bytes(&request.content_key)
            .map_err(|_| OverlayRequestError::InvalidRequest("Invalid content key".to_string()))?;

        match (
            self.store.lock().get(&content_key),
            self.stream_controller.get_outbound_semaphore(),
        ) {
            (Ok(Some(content)), Some(permit)) => {
                if content.len() <= MAX_PORTAL_CONTENT_PAYLOAD_SIZE {
                    Ok(Content::Content(content))
                } else {
                    // The content does not fit into one frame: negotiate a stream addressed by
                    // a fresh connection id and push the payload over it.
                    let enr = self.find_enr(source).ok_or_else(|| {
                        OverlayRequestError::AcceptError(
                            "handle_find_content: unable to find ENR for NodeId".to_string(),
                        )
                    })?;
                    let version = self.versions.highest_common(&enr)?;
                    let payload = encode_find_content_payload(version, &content)
                        .map_err(|err| OverlayRequestError::StreamError(err.to_string()))?;

                    let cid = self.stream_controller.cid();
                    let cid_send = cid.send;

                    // Wait for an incoming stream with the given connection id, then write the
                    // data over it.
                    let stream_controller = Arc::clone(&self.stream_controller);
                    tokio::spawn(async move {
                        stream_controller
                            .accept_outbound_stream(cid, enr, &payload)
                            .await;
                        drop(permit);
                    });

                    // Connection id is sent as BE because stream header values are also BE.
                    Ok(Content::ConnectionId(cid_send.to_be()))
                }
            }
            // If we can't obtain a permit or don't have data to send back, send the requester a
            // list of closer ENRs.
            (Ok(_), None) | (Ok(None), _) => {
                let mut enrs: Vec<SszEnr> = self
                    .kbuckets
                    .closest_to_content_id(&content_key.content_id(), FIND_CONTENT_MAX_NODES)
                    .into_iter()
                    .map(|node| node.enr)
                    .filter(|enr| &enr.node_id() != source)
                    .map(SszEnr)
                    .collect();
                pop_while_ssz_bytes_len_gt(&mut enrs, MAX_PORTAL_CONTENT_PAYLOAD_SIZE);
                Ok(Content::Enrs(enrs))
            }
            (Err(msg), _) => Err(OverlayRequestError::Failure(format!(
                "Unable to respond to FindContent: {msg}",
            ))),
        }
    }

    /// Processes a Content response.
    pub(super) fn process_content(
        &mut self,
        content: Content,
        source: Enr,
        query_id: Option<QueryId>,
    ) {
        trace!(
            response.source = %source.node_id(),
            "Processing Content message",
        );
        match content {
            Content::ConnectionId(id) => {
                if let Some(query_id) = query_id {
                    let id = u16::from_be(id);
                    self.advance_find_content_query_with_connection_id(&query_id, source, id);
                }
            }
            Content::Content(content) => {
                if let Some(query_id) = query_id {
                    self.advance_find_content_query_with_content(&query_id, source, content);
                }
            }
            Content::Enrs(enrs) => {
                let enrs: Vec<Enr> = enrs.into_iter().map(|ssz_enr| ssz_enr.into()).collect();
                self.process_discovered_enrs(enrs.clone());
                if let Some(query_id) = query_id {
                    self.advance_find_content_query_with_enrs(&query_id, source, enrs);
                }
            }
        }
    }

    /// Advances a find content query (if one exists for `query_id`) with ENRs close to content.
    fn advance_find_content_query_with_enrs(
        &mut self,
        query_id: &QueryId,
        source: Enr,
        enrs: Vec<Enr>,
    ) {
        let local_node_id = self.local_enr().node_id();
        if let Some((query_info, query)) = self.find_content_query_pool.get_mut(*query_id) {
            // If an ENR is not present in the query's untrusted ENRs, then add the ENR.
            // Ignore the local node's ENR.
            for enr_ref in enrs.iter().filter(|enr| enr.node_id() != local_node_id) {
                if !query_info
                    .untrusted_enrs
                    .iter()
                    .any(|enr| enr.node_id() == enr_ref.node_id())
                {
                    query_info.untrusted_enrs.push(enr_ref.clone());
                }
            }
            let closest_nodes: Vec<NodeId> = enrs
                .iter()
                .filter(|enr| enr.node_id() != local_node_id)
                .map(|enr| enr.node_id())
                .collect();

            // Mark the query successful for the source of the response with the closest ENRs.
            query.on_success(
                &source.node_id(),
                FindContentQueryResponse::ClosestNodes(closest_nodes),
            );
        }
    }

    /// Advances a find content query (if one exists for `query_id`) with a connection id.
    fn advance_find_content_query_with_connection_id(
        &mut self,
        query_id: &QueryId,
        source: Enr,
        connection_id: u16,
    ) {
        if let Some((_, query)) = self.find_content_query_pool.get_mut(*query_id) {
            // Mark the query successful for the source of the response with the connection id.
            query.on_success(
                &source.node_id(),
                FindContentQueryResponse::ConnectionId(connection_id),
            );
        }
    }

    /// Advances a find content query (if one exists for `query_id`) with content.
    fn advance_find_content_query_with_content(
        &mut self,
        query_id: &QueryId,
        source: Enr,
        content: RawContentValue,
    ) {
        if let Some((_, query)) = self.find_content_query_pool.get_mut(*query_id) {
            // Mark the query successful for the source of the response with the content.
            query.on_success(
                &source.node_id(),
                FindContentQueryResponse::Content(content),
            );
        }
    }

    /// Starts a `FindContentQuery` for a target content key.
    pub(super) fn init_find_content_query(
        &mut self,
        target: TContentKey,
        callback: oneshot::Sender<RecursiveFindContentResult>,
    ) {
        debug!("Starting query for content key: {}", target);

        // Lookup content locally before querying the network.
        match self.store.lock().get(&target) {
            Ok(Some(content)) => {
                let _ = callback.send(Ok((content, false)));
                return;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "Error reading store for content query");
            }
        }

        let closest_nodes = self
            .kbuckets
            .closest_to_content_id(&target.content_id(), self.query_num_results);
        if closest_nodes.is_empty() {
            // If there are no nodes in the routing table the query cannot proceed.
            warn!("No nodes in routing table, find content query cannot proceed.");
            let _ = callback.send(Err(OverlayRequestError::ContentNotFound {
                message:
                    "Unable to locate content on the network: no nodes in the routing table"
                        .to_string(),
                utp: false,
            }));
            return;
        }

        let query_config = QueryConfig {
            parallelism: self.query_parallelism,
            num_results: self.query_num_results,
            peer_timeout: self.query_peer_timeout,
        };

        let query_info = QueryInfo {
            query_type: QueryType::FindContent { target, callback },
            untrusted_enrs: SmallVec::from_vec(
                closest_nodes.iter().map(|node| node.enr()).collect(),
            ),
        };

        let known_closest_peers: Vec<NodeId> = closest_nodes
            .iter()
            .map(|node| node.enr.node_id())
            .collect();

        let query = FindContentQuery::with_config(
            query_config,
            query_info.target_node_id(),
            known_closest_peers,
        );
        let query_id = self.find_content_query_pool.add_query(query_info, query);
        trace!(
            query.id = %query_id,
            "FindContent query initialized",
        );
    }

    /// Handles a `QueryEvent` from a poll on the find content query pool.
    pub(super) fn handle_find_content_query_event(
        &mut self,
        query_event: QueryEvent<FindContentQuery, TContentKey>,
    ) {
        match query_event {
            QueryEvent::Waiting(query_id, node_id, request) => {
                if let Some(enr) = self.find_enr(&node_id) {
                    // If we find the node's ENR, then send the request on behalf of the query.
                    // No callback channel is necessary for the request, because the response
                    // will be incorporated into the query.
                    let request = OverlayRequest::new(
                        request,
                        RequestDirection::Outgoing { destination: enr },
                        None,
                        Some(query_id),
                        None,
                    );
                    let _ = self.command_tx.send(OverlayCommand::Request(request));
                } else {
                    // If we cannot find the node's ENR, then we cannot contact the node, so
                    // fail the query for this node.
                    error!(
                        peer = %node_id,
                        query.id = %query_id,
                        "Cannot query peer with unknown ENR"
                    );
                    if let Some((_, query)) = self.find_content_query_pool.get_mut(query_id) {
                        query.on_failure(&node_id);
                    }
                }
            }
            QueryEvent::Cancelled(query_id) => {
                trace!(query.id = %query_id, "FindContent query cancelled by issuer");
                let _ = self.find_content_query_pool.remove(query_id);
            }
            QueryEvent::Finished(query_id, query_info, query)
            | QueryEvent::TimedOut(query_id, query_info, query) => {
                let QueryType::FindContent { target, callback } = query_info.query_type else {
                    error!(
                        query.id = %query_id,
                        "Received wrong QueryType when handling a FindContent result",
                    );
                    return;
                };
                match query.into_result() {
                    FindContentQueryResult::Content {
                        content,
                        nodes_to_poke,
                        peer,
                    } => {
                        debug!(
                            query.id = %query_id,
                            peer = %peer,
                            "Content found inline",
                        );
                        let processing = TransferProcessing::from(&*self);
                        tokio::spawn(async move {
                            Self::process_found_content(
                                processing,
                                target,
                                content,
                                false,
                                nodes_to_poke,
                                callback,
                            )
                            .await;
                        });
                    }
                    FindContentQueryResult::Utp {
                        connection_id,
                        nodes_to_poke,
                        peer,
                    } => {
                        let Some(enr) = self.find_enr(&peer) else {
                            debug!(peer = %peer, "Received stream offer from unknown peer");
                            let _ = callback.send(Err(OverlayRequestError::ContentNotFound {
                                message: "Unable to resolve the peer holding the content"
                                    .to_string(),
                                utp: true,
                            }));
                            return;
                        };
                        let processing = TransferProcessing::from(&*self);
                        tokio::spawn(async move {
                            let cid = ConnectionId::from_wire(connection_id);
                            let version = match processing.versions.highest_common(&enr) {
                                Ok(version) => version,
                                Err(err) => {
                                    let _ = callback.send(Err(err.into()));
                                    return;
                                }
                            };
                            let payload = match processing
                                .stream_controller
                                .connect_inbound_stream(cid, enr)
                                .await
                            {
                                Ok(payload) => payload,
                                Err(err) => {
                                    debug!(%err, "Failed to read content from stream");
                                    let _ =
                                        callback.send(Err(OverlayRequestError::ContentNotFound {
                                            message:
                                                "Unable to locate content on the network: the \
                                                 stream transfer failed"
                                                    .to_string(),
                                            utp: true,
                                        }));
                                    return;
                                }
                            };
                            // A broken frame aborts only this transfer.
                            let content = match decode_find_content_payload(version, payload) {
                                Ok(content) => content.to_vec(),
                                Err(err) => {
                                    debug!(%err, "Malformed streamed content payload");
                                    let _ =
                                        callback.send(Err(OverlayRequestError::StreamError(
                                            err.to_string(),
                                        )));
                                    return;
                                }
                            };
                            Self::process_found_content(
                                processing,
                                target,
                                content,
                                true,
                                nodes_to_poke,
                                callback,
                            )
                            .await;
                        });
                    }
                    FindContentQueryResult::ClosestNodes(_) => {
                        let _ = callback.send(Err(OverlayRequestError::ContentNotFound {
                            message: "Unable to locate content on the network before timeout"
                                .to_string(),
                            utp: false,
                        }));
                    }
                }
            }
        }
    }

    /// Completes a successful content lookup: stores the value when it belongs here, answers
    /// the issuer, and re-advertises the content to the closest peer that went looking for it
    /// without having it.
    async fn process_found_content(
        processing: TransferProcessing<TContentKey, TStore>,
        content_key: TContentKey,
        content: RawContentValue,
        utp_transfer: bool,
        nodes_to_poke: Vec<NodeId>,
        callback: oneshot::Sender<RecursiveFindContentResult>,
    ) {
        let should_store = processing
            .store
            .lock()
            .should_we_store(&content_key)
            .map_or_else(
                |err| {
                    error!(error = %err, "Unable to read store");
                    false
                },
                |decision| matches!(decision, ShouldWeStoreContent::Store),
            );
        if should_store {
            match processing
                .store
                .lock()
                .put(content_key.clone(), &content)
            {
                Ok(dropped_content) => {
                    if !dropped_content.is_empty() {
                        debug!(
                            count = dropped_content.len(),
                            "Dropped content while storing, propagating it back into the network",
                        );
                        propagate_gossip_cross_thread(
                            dropped_content,
                            &processing.kbuckets,
                            processing.command_tx.clone(),
                            Some(Arc::clone(&processing.stream_controller)),
                        );
                    }
                }
                Err(err) => warn!(
                    error = %err,
                    content.key = %content_key,
                    "Error storing looked-up content"
                ),
            }
        }

        if callback.send(Ok((content.clone(), utp_transfer))).is_err() {
            warn!("The content query has exited before the result could be delivered");
        }

        if !processing.disable_poke {
            Self::poke_content(&processing, content_key, content, nodes_to_poke);
        }
    }

    /// Offers `content` to the closest peer among `nodes_to_poke` whose radius contains the
    /// content id. This is the incentive mechanism for locality: the content travels one step
    /// towards the peers that will be asked for it next.
    fn poke_content(
        processing: &TransferProcessing<TContentKey, TStore>,
        content_key: TContentKey,
        content: RawContentValue,
        nodes_to_poke: Vec<NodeId>,
    ) {
        let content_id = content_key.content_id();
        let raw_content_key = content_key.to_bytes();

        // `nodes_to_poke` is sorted by distance to the content; the first peer within radius is
        // the closest one that missed the content.
        for node_id in nodes_to_poke {
            let Some(node) = processing.kbuckets.entry(node_id) else {
                continue;
            };
            let within_radius =
                XorMetric::distance(&node_id.raw(), &content_id) <= node.data_radius;
            if !within_radius {
                continue;
            }

            let Some(permit) = processing.stream_controller.get_outbound_semaphore() else {
                trace!("Permit for poke not acquired; skipping");
                return;
            };

            let offer_request = Request::PopulatedOffer(PopulatedOffer {
                content_items: vec![(raw_content_key.clone(), content.clone())],
            });
            let request = OverlayRequest::new(
                offer_request,
                RequestDirection::Outgoing {
                    destination: node.enr(),
                },
                None,
                None,
                Some(permit),
            );
            match processing
                .command_tx
                .send(OverlayCommand::Request(request))
            {
                Ok(_) => {
                    trace!(
                        content.id = %hex_encode_compact(content_id),
                        peer.node_id = %node_id,
                        "Content poked"
                    );
                }
                Err(err) => {
                    warn!(
                        content.id = %hex_encode_compact(content_id),
                        peer.node_id = %node_id,
                        %err,
                        "Failed to poke content to peer"
                    );
                }
            }
            return;
        }
    }

    /// Attempts a single FINDCONTENT request to a fallback peer recorded for a content key
    /// whose transfer failed, then stores the value.
    pub(super) async fn fallback_find_content(
        content_key: TContentKey,
        processing: TransferProcessing<TContentKey, TStore>,
    ) -> anyhow::Result<()> {
        let fallback_peer = match processing
            .transferring_keys
            .write()
            .process_failed_key(&content_key)
        {
            Some(peer) => peer,
            None => {
                debug!("No fallback peer found for content key");
                return Ok(());
            }
        };
        let request = Request::FindContent(FindContent {
            content_key: content_key.to_bytes(),
        });
        let direction = RequestDirection::Outgoing {
            destination: fallback_peer.clone(),
        };
        let (tx, rx) = oneshot::channel();
        processing
            .command_tx
            .send(OverlayCommand::Request(OverlayRequest::new(
                request, direction, Some(tx), None, None,
            )))
            .map_err(|err| anyhow::anyhow!("Unable to send fallback request: {err}"))?;
        let data: RawContentValue = match rx.await? {
            Ok(Response::Content(found_content)) => {
                match found_content {
                    Content::Content(content) => content,
                    Content::Enrs(_) => return Err(anyhow::anyhow!("expected content, got ENRs")),
                    // Open a stream if a connection id is received.
                    Content::ConnectionId(conn_id) => {
                        let conn_id = u16::from_be(conn_id);
                        let cid = ConnectionId::from_wire(conn_id);
                        let version = processing.versions.highest_common(&fallback_peer)?;
                        let payload: Bytes = processing
                            .stream_controller
                            .connect_inbound_stream(cid, fallback_peer.clone())
                            .await
                            .map_err(|err| anyhow::anyhow!("fallback stream failed: {err}"))?;
                        decode_find_content_payload(version, payload)?.to_vec()
                    }
                }
            }
            _ => return Err(anyhow::anyhow!("invalid response")),
        };

        let should_store = matches!(
            processing.store.lock().should_we_store(&content_key),
            Ok(ShouldWeStoreContent::Store)
        );
        if should_store {
            processing
                .store
                .lock()
                .put(content_key.clone(), &data)
                .map_err(|err| anyhow::anyhow!("Unable to store fallback content: {err}"))?;
            propagate_gossip_cross_thread(
                vec![(content_key, data)],
                &processing.kbuckets,
                processing.command_tx.clone(),
                Some(Arc::clone(&processing.stream_controller)),
            );
        }
        Ok(())
    }
}
