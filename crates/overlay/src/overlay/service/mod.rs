pub mod find_content;
pub mod find_nodes;
pub mod manager;
pub mod offer;
pub mod ping;
pub mod utils;

use std::{collections::{HashMap, HashSet}, marker::PhantomData, sync::Arc, time::Duration};

use discv5::enr::NodeId;
use parking_lot::{Mutex, RwLock};
use portal_api::OverlayContentKey;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{
    accept_queue::TransferringKeys,
    find::{
        iterators::{findcontent::FindContentQuery, findnodes::FindNodeQuery},
        query_pool::QueryPool,
    },
    overlay::{
        command::OverlayCommand,
        request::{ActiveOutgoingRequest, OverlayRequestId, OverlayResponse},
    },
    stream::{rate_limiter::OfferRateLimiter, StreamController},
    transport::RequestTransport,
    types::kbucket::SharedRoutingTable,
    versions::VersionsCache,
};

/// The overlay service.
///
/// A single task owns all mutable protocol state and is driven by a command channel; every
/// other component interacts with the overlay through that channel.
pub struct OverlayService<TContentKey, TStore>
where
    TContentKey: OverlayContentKey,
{
    /// The underlying request transport.
    transport: Arc<dyn RequestTransport>,
    /// The content database of the local node.
    store: Arc<Mutex<TStore>>,
    /// The routing table of the local node.
    kbuckets: SharedRoutingTable,
    /// Per-peer negotiated protocol versions.
    versions: Arc<VersionsCache>,
    /// The receiver half of the service command channel.
    command_rx: UnboundedReceiver<OverlayCommand<TContentKey>>,
    /// The sender half of the service command channel.
    /// This is used internally to submit requests (e.g. maintenance ping requests).
    command_tx: UnboundedSender<OverlayCommand<TContentKey>>,
    /// A map of active outgoing requests.
    active_outgoing_requests: Arc<RwLock<HashMap<OverlayRequestId, ActiveOutgoingRequest>>>,
    /// A query pool that manages find node queries.
    find_node_query_pool: QueryPool<FindNodeQuery, TContentKey>,
    /// A query pool that manages find content queries.
    find_content_query_pool: QueryPool<FindContentQuery, TContentKey>,
    /// Timeout after which a peer in an ongoing query is marked unresponsive.
    query_peer_timeout: Duration,
    /// Number of peers to request data from in parallel for a single query.
    query_parallelism: usize,
    /// Number of new peers to discover before considering a query complete.
    query_num_results: usize,
    /// The number of buckets we simultaneously request from each peer in a FINDNODES query.
    findnodes_query_distances_per_peer: usize,
    /// The receiver half of a channel for responses to outgoing requests.
    response_rx: UnboundedReceiver<OverlayResponse>,
    /// The sender half of a channel for responses to outgoing requests.
    response_tx: UnboundedSender<OverlayResponse>,
    /// Stream transfers.
    stream_controller: Arc<StreamController>,
    /// Per-peer inbound offer budget.
    offer_rate_limiter: Arc<OfferRateLimiter>,
    /// Content keys with a transfer currently inbound.
    transferring_keys: Arc<RwLock<TransferringKeys<TContentKey>>>,
    /// Peers with a liveness PING currently in flight. At most one per peer.
    inflight_pings: HashSet<NodeId>,
    /// Period of the revalidation loop.
    revalidation_interval: Duration,
    /// Deadline for a single outgoing PING.
    ping_timeout: Duration,
    /// Deadline for any other single outgoing request.
    request_timeout: Duration,
    /// Disable the re-advertisement of looked-up content.
    disable_poke: bool,
    /// Phantom content key.
    _phantom_content_key: PhantomData<TContentKey>,
}
