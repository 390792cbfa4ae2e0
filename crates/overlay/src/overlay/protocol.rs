use std::{marker::PhantomData, sync::Arc};

use discv5::enr::NodeId;
use futures::channel::oneshot;
use parking_lot::Mutex;
use portal_api::{
    types::{
        distance::Distance,
        enr::Enr,
        portal_wire::{
            Accept, Content, CustomPayload, FindContent, FindNodes, Message, Nodes, OfferTrace,
            Ping, Pong, PopulatedOffer, PopulatedOfferWithResult, Request, Response,
        },
    },
    OverlayContentKey, RawContentKey, RawContentValue,
};
use portal_storage::{ContentStore, ShouldWeStoreContent};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use super::service::OverlayService;
use crate::{
    find::query_info::FindContentResult,
    gossip::propagate_gossip_cross_thread,
    overlay::{
        command::OverlayCommand,
        config::OverlayConfig,
        errors::OverlayRequestError,
        request::{OverlayRequest, RequestDirection},
    },
    stream::{decode_find_content_payload, StreamController},
    transport::{ConnectionId, RequestTransport, StreamTransport},
    types::kbucket::SharedRoutingTable,
    versions::VersionsCache,
};

/// The result of locally submitting content to the overlay.
#[derive(Debug, Clone, Copy)]
pub struct PutContentInfo {
    /// The number of peers the content was offered to.
    pub peer_count: usize,
    /// Whether the content was stored locally.
    pub stored_locally: bool,
}

/// The overlay protocol: a handle to one overlay network.
///
/// The handle encapsulates the protocol logic for a single content-addressed overlay running on
/// top of a shared discovery transport. All network activity runs inside the spawned
/// [`OverlayService`]; the handle communicates with it over a command channel.
#[derive(Clone)]
pub struct OverlayProtocol<TContentKey, TStore> {
    /// The request transport below the overlay.
    pub transport: Arc<dyn RequestTransport>,
    /// The data store.
    pub store: Arc<Mutex<TStore>>,
    /// The overlay routing table of the local node.
    kbuckets: SharedRoutingTable,
    /// Per-peer negotiated protocol versions.
    versions: Arc<VersionsCache>,
    /// A sender to send commands to the OverlayService.
    pub command_tx: UnboundedSender<OverlayCommand<TContentKey>>,
    /// Stream transfers.
    stream_controller: Arc<StreamController>,
    /// Declare the allowed content key types for this overlay network.
    _phantom_content_key: PhantomData<TContentKey>,
}

impl<TContentKey, TStore> OverlayProtocol<TContentKey, TStore>
where
    TContentKey: OverlayContentKey,
    TStore: ContentStore<Key = TContentKey> + Send + 'static,
{
    pub fn new(
        config: OverlayConfig,
        transport: Arc<dyn RequestTransport>,
        stream_transport: Arc<dyn StreamTransport>,
        store: Arc<Mutex<TStore>>,
    ) -> Self {
        let local_node_id = transport.local_enr().node_id();
        let kbuckets = SharedRoutingTable::new(local_node_id);
        let versions = Arc::new(VersionsCache::new(config.supported_versions.clone()));
        let stream_controller = Arc::new(StreamController::new(
            config.transfer_limit,
            stream_transport,
        ));

        let command_tx = OverlayService::<TContentKey, TStore>::spawn(
            config,
            Arc::clone(&transport),
            Arc::clone(&store),
            kbuckets.clone(),
            Arc::clone(&versions),
            Arc::clone(&stream_controller),
        );

        Self {
            transport,
            store,
            kbuckets,
            versions,
            command_tx,
            stream_controller,
            _phantom_content_key: PhantomData,
        }
    }

    /// Returns the ENR of the local node.
    pub fn local_enr(&self) -> Enr {
        self.transport.local_enr()
    }

    /// Returns the data radius of the local node.
    pub fn data_radius(&self) -> Distance {
        self.store.lock().radius()
    }

    /// Processes a single inbound request frame and returns the response to send back.
    pub async fn process_one_request(
        &self,
        source: NodeId,
        payload: Vec<u8>,
    ) -> Result<Response, OverlayRequestError> {
        let request = match Message::try_from(payload) {
            Ok(message) => match Request::try_from(message) {
                Ok(request) => request,
                Err(err) => return Err(OverlayRequestError::InvalidRequest(err.to_string())),
            },
            // A malformed frame is dropped without counting against the peer.
            Err(_) => return Err(OverlayRequestError::DecodeError),
        };
        let direction = RequestDirection::Incoming { source };

        // Send the request and wait on the response.
        self.send_overlay_request(request, direction).await
    }

    /// Sends a `Ping` request to the designated node and returns the response.
    pub async fn send_ping(&self, enr: Enr) -> Result<Pong, OverlayRequestError> {
        let ping = Request::Ping(Ping {
            enr_seq: self.local_enr().seq(),
            custom_payload: CustomPayload::from_radius(self.data_radius()),
        });
        let direction = RequestDirection::Outgoing { destination: enr };

        match self.send_overlay_request(ping, direction).await? {
            Response::Pong(pong) => Ok(pong),
            _ => Err(OverlayRequestError::InvalidResponse),
        }
    }

    /// Sends a `FindNodes` request to the designated node and returns the response.
    pub async fn send_find_nodes(
        &self,
        enr: Enr,
        distances: Vec<u16>,
    ) -> Result<Nodes, OverlayRequestError> {
        let request = Request::FindNodes(FindNodes { distances });
        let direction = RequestDirection::Outgoing { destination: enr };

        match self.send_overlay_request(request, direction).await? {
            Response::Nodes(nodes) => Ok(nodes),
            _ => Err(OverlayRequestError::InvalidResponse),
        }
    }

    /// Sends a `FindContent` request for `content_key` to the designated node.
    ///
    /// A `connection_id` response is resolved by opening the stream and reading the payload, so
    /// the caller only ever sees content or ENRs.
    pub async fn send_find_content(
        &self,
        enr: Enr,
        content_key: RawContentKey,
    ) -> Result<FindContentResult, OverlayRequestError> {
        let request = Request::FindContent(FindContent { content_key });
        let direction = RequestDirection::Outgoing {
            destination: enr.clone(),
        };

        match self.send_overlay_request(request, direction).await? {
            Response::Content(found_content) => match found_content {
                Content::Content(_) => Ok((found_content, false)),
                Content::Enrs(_) => Ok((found_content, false)),
                // Init stream if `connection_id` is received
                Content::ConnectionId(conn_id) => {
                    let conn_id = u16::from_be(conn_id);
                    let cid = ConnectionId::from_wire(conn_id);
                    let version = self.versions.highest_common(&enr)?;
                    let payload = self
                        .stream_controller
                        .connect_inbound_stream(cid, enr)
                        .await
                        .map_err(|err| OverlayRequestError::StreamError(err.to_string()))?;
                    let content = decode_find_content_payload(version, payload)
                        .map_err(|err| OverlayRequestError::StreamError(err.to_string()))?;
                    Ok((Content::Content(content.to_vec()), true))
                }
            },
            _ => Err(OverlayRequestError::InvalidResponse),
        }
    }

    /// Offers the given keyed content to the designated peer and returns the raw ACCEPT
    /// response. The stream transfer of accepted values proceeds in the background.
    pub async fn send_offer(
        &self,
        enr: Enr,
        content_items: Vec<(RawContentKey, RawContentValue)>,
    ) -> Result<Accept, OverlayRequestError> {
        let request = Request::PopulatedOffer(PopulatedOffer { content_items });
        let direction = RequestDirection::Outgoing {
            destination: enr.clone(),
        };

        match self.send_overlay_request(request, direction).await? {
            Response::Accept(accept) => Ok(accept),
            _ => Err(OverlayRequestError::InvalidResponse),
        }
    }

    /// Offers a single piece of content to the designated peer, and reports the outcome of the
    /// whole exchange including the stream transfer.
    pub async fn send_offer_with_result(
        &self,
        enr: Enr,
        content_key: RawContentKey,
        content_value: RawContentValue,
    ) -> Result<OfferTrace, OverlayRequestError> {
        let (result_tx, mut result_rx) = tokio::sync::mpsc::unbounded_channel();
        let request = Request::PopulatedOfferWithResult(PopulatedOfferWithResult {
            content_item: (content_key, content_value),
            result_tx,
        });
        let direction = RequestDirection::Outgoing {
            destination: enr.clone(),
        };

        self.send_overlay_request(request, direction).await?;
        match result_rx.recv().await {
            Some(trace) => Ok(trace),
            None => Err(OverlayRequestError::ChannelFailure(
                "Offer result channel closed".to_string(),
            )),
        }
    }

    /// Performs a recursive lookup for the nodes closest to `target`.
    pub async fn lookup_node(&self, target: NodeId) -> Result<Vec<Enr>, OverlayRequestError> {
        let (callback, callback_rx) = oneshot::channel();
        self.command_tx
            .send(OverlayCommand::FindNodeQuery { target, callback })
            .map_err(|err| OverlayRequestError::ChannelFailure(err.to_string()))?;
        callback_rx
            .await
            .map_err(|err| OverlayRequestError::ChannelFailure(err.to_string()))
    }

    /// Performs a recursive lookup for `target` content. Returns the value and whether it
    /// arrived over a stream.
    pub async fn lookup_content(
        &self,
        target: TContentKey,
    ) -> Result<(RawContentValue, bool), OverlayRequestError> {
        let (callback, callback_rx) = oneshot::channel();
        self.command_tx
            .send(OverlayCommand::FindContentQuery { target, callback })
            .map_err(|err| OverlayRequestError::ChannelFailure(err.to_string()))?;
        callback_rx
            .await
            .map_err(|err| OverlayRequestError::ChannelFailure(err.to_string()))?
    }

    /// Stores content locally when it belongs here and offers it to the closest interested
    /// peers.
    pub fn put_content(
        &self,
        content_key: TContentKey,
        content_value: RawContentValue,
    ) -> PutContentInfo {
        let should_we_store = match self.store.lock().should_we_store(&content_key) {
            Ok(decision) => matches!(decision, ShouldWeStoreContent::Store),
            Err(err) => {
                warn!(
                    error = %err,
                    "Error checking if content key is within radius and unavailable",
                );
                false
            }
        };

        if should_we_store {
            let _ = self
                .store
                .lock()
                .put(content_key.clone(), &content_value);
        }

        PutContentInfo {
            peer_count: propagate_gossip_cross_thread(
                vec![(content_key, content_value)],
                &self.kbuckets,
                self.command_tx.clone(),
                Some(Arc::clone(&self.stream_controller)),
            ),
            stored_locally: should_we_store,
        }
    }

    /// Returns the ENRs of all live routing table entries.
    pub fn table_entries_enr(&self) -> Vec<Enr> {
        self.kbuckets.enrs()
    }

    /// Sends a request through the overlay service and awaits the response.
    async fn send_overlay_request(
        &self,
        request: Request,
        direction: RequestDirection,
    ) -> Result<Response, OverlayRequestError> {
        let (tx, rx) = oneshot::channel();
        let overlay_request = OverlayRequest::new(request, direction, Some(tx), None, None);
        self.command_tx
            .send(OverlayCommand::Request(overlay_request))
            .map_err(|err| {
                OverlayRequestError::ChannelFailure(format!(
                    "Error submitting request to service: {err}"
                ))
            })?;

        rx.await.map_err(|err| {
            OverlayRequestError::ChannelFailure(format!(
                "Error receiving response from service: {err}"
            ))
        })?
    }
}
