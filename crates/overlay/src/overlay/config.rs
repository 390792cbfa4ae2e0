use std::time::Duration;

use portal_api::types::{
    enr::Enr,
    protocol_versions::{ProtocolVersion, ProtocolVersionList},
};

use crate::constants::{
    DEFAULT_OFFER_RATE_CAPACITY, DEFAULT_OFFER_RATE_PER_SEC, DEFAULT_PING_TIMEOUT,
    DEFAULT_QUERY_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_REVALIDATION_INTERVAL,
    DEFAULT_TRANSFER_LIMIT,
};

/// Configuration parameters for the overlay network.
#[derive(Clone)]
pub struct OverlayConfig {
    /// Seed ENRs contacted at startup to populate the routing table.
    pub bootnode_enrs: Vec<Enr>,
    /// Protocol versions the local node speaks, sorted ascending.
    pub supported_versions: ProtocolVersionList,
    /// Period of the routing table liveness revalidation loop.
    pub revalidation_interval: Duration,
    /// Number of peers to request data from in parallel for a single query.
    pub query_parallelism: usize,
    /// Deadline for a complete recursive query.
    pub query_timeout: Duration,
    /// Timeout after which a peer in an ongoing query is marked unresponsive.
    pub query_peer_timeout: Duration,
    /// Number of results before a recursive query is considered complete.
    pub query_num_results: usize,
    /// The number of buckets we simultaneously request from each peer in a FINDNODES query.
    pub findnodes_query_distances_per_peer: usize,
    /// Deadline for a single outgoing PING.
    pub ping_timeout: Duration,
    /// Deadline for any other single outgoing request.
    pub request_timeout: Duration,
    /// Disable re-advertisement of looked-up content to the closest peer that missed it.
    pub disable_poke: bool,
    /// Cap on concurrent stream transfers per direction.
    pub transfer_limit: usize,
    /// Per-peer inbound offer token bucket capacity.
    pub offer_rate_capacity: f64,
    /// Per-peer inbound offer token bucket refill rate, per second.
    pub offer_rate_per_sec: f64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            bootnode_enrs: vec![],
            supported_versions: ProtocolVersionList::new(vec![
                ProtocolVersion::V0,
                ProtocolVersion::V1,
            ]),
            revalidation_interval: DEFAULT_REVALIDATION_INTERVAL,
            query_parallelism: 3, // (recommended α from kademlia paper)
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            query_peer_timeout: Duration::from_secs(2),
            query_num_results: crate::types::kbucket::MAX_NODES_PER_BUCKET,
            findnodes_query_distances_per_peer: 3,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            disable_poke: false,
            transfer_limit: DEFAULT_TRANSFER_LIMIT,
            offer_rate_capacity: DEFAULT_OFFER_RATE_CAPACITY,
            offer_rate_per_sec: DEFAULT_OFFER_RATE_PER_SEC,
        }
    }
}
