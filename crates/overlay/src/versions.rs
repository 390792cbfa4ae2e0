use std::collections::HashMap;

use discv5::enr::NodeId;
use parking_lot::RwLock;
use portal_api::types::{
    enr::Enr,
    protocol_versions::{
        ProtocolVersion, ProtocolVersionError, ProtocolVersionList, ENR_PROTOCOL_VERSION_KEY,
    },
};

struct CachedVersion {
    enr_seq: u64,
    version: ProtocolVersion,
}

/// A cache of the highest protocol version shared with each peer.
///
/// Negotiation reads the peer's `pv` ENR entry. A missing entry means the peer predates
/// versioning and is treated as supporting only the lowest local version. The cached value is
/// keyed by the ENR sequence it was computed from, so a fresher record invalidates it, and a
/// failed negotiation is never cached.
pub struct VersionsCache {
    local_versions: ProtocolVersionList,
    cache: RwLock<HashMap<NodeId, CachedVersion>>,
}

impl VersionsCache {
    pub fn new(local_versions: ProtocolVersionList) -> Self {
        debug_assert!(!local_versions.is_empty());
        debug_assert!(local_versions.is_strictly_sorted_and_specified());
        Self {
            local_versions,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The versions the local node speaks, sorted ascending.
    pub fn local_versions(&self) -> &ProtocolVersionList {
        &self.local_versions
    }

    /// Returns the highest protocol version in common with the peer.
    pub fn highest_common(&self, enr: &Enr) -> Result<ProtocolVersion, ProtocolVersionError> {
        let node_id = enr.node_id();
        if let Some(cached) = self.cache.read().get(&node_id) {
            if cached.enr_seq >= enr.seq() {
                return Ok(cached.version);
            }
        }

        let version = self.negotiate(enr);
        match version {
            Ok(version) => {
                self.cache.write().insert(
                    node_id,
                    CachedVersion {
                        enr_seq: enr.seq(),
                        version,
                    },
                );
                Ok(version)
            }
            Err(err) => {
                self.cache.write().remove(&node_id);
                Err(err)
            }
        }
    }

    fn negotiate(&self, enr: &Enr) -> Result<ProtocolVersion, ProtocolVersionError> {
        match enr.get_decodable::<ProtocolVersionList>(ENR_PROTOCOL_VERSION_KEY) {
            // Key is not set: the peer only speaks the lowest version we support.
            None => Ok(self.local_versions[0]),
            Some(Err(_)) => Err(ProtocolVersionError::FailedToDecode),
            Some(Ok(peer_versions)) => self.local_versions.highest_common(&peer_versions),
        }
    }

    /// Drops the cached version for a peer, e.g. when it is evicted from the routing table.
    pub fn invalidate(&self, node_id: NodeId) {
        self.cache.write().remove(&node_id);
    }
}
