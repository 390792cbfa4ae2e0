use delay_map::HashMapDelay;
use futures::prelude::*;
use portal_api::{types::enr::Enr, OverlayContentKey};
use rand::seq::SliceRandom;
use tokio::time::Duration;
use tracing::{debug, warn};

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

/// A record of peers that have offered a content key.
struct SeenPeers {
    /// The peer whose offer was accepted.
    origin: Enr,
    /// Subsequent peers that offered the same key while the transfer was inbound.
    fallback: Vec<Enr>,
}

/// The set of content keys currently inbound on a stream.
///
/// A key enters when its offer is accepted and leaves when the transfer completes. It is
/// possible for keys to evade removal through the entire processing cycle, due to error
/// handling inside the service or panicking tasks, so entries also expire on a timeout rather
/// than blocking the key forever.
pub struct TransferringKeys<TContentKey>
where
    TContentKey: OverlayContentKey,
{
    // a map of content keys actively being transferred, pointing to the peers that have
    // offered them
    content_key_map: HashMapDelay<TContentKey, SeenPeers>,
}

impl<TContentKey> Default for TransferringKeys<TContentKey>
where
    TContentKey: OverlayContentKey,
{
    fn default() -> Self {
        Self {
            content_key_map: HashMapDelay::new(TRANSFER_TIMEOUT),
        }
    }
}

impl<TContentKey> TransferringKeys<TContentKey>
where
    TContentKey: OverlayContentKey,
{
    /// Tries to claim a content key for an inbound transfer from `peer`.
    ///
    /// Returns true if the key was free and is now claimed. If a transfer of the key is
    /// already inbound, the peer is remembered as a fallback source and false is returned.
    /// Also polls for expired items, which removes them from the queue.
    pub fn try_claim(&mut self, content_key: &TContentKey, peer: &Enr) -> bool {
        // poll for expired items, which will remove them from the queue
        let _ = future::poll_fn(|cx| self.content_key_map.poll_expired(cx)).now_or_never();
        if let Some(mut seen_peers) = self.content_key_map.remove(content_key) {
            if seen_peers.origin == *peer || seen_peers.fallback.contains(peer) {
                debug!(
                    "Received multiple offers containing the same content key: {content_key} from peer: {peer}"
                );
            } else {
                debug!(
                    "Content key: {content_key} already transferring, adding peer to fallback list: {peer}"
                );
                seen_peers.fallback.push(peer.clone());
            }
            self.content_key_map.insert(content_key.clone(), seen_peers);
            return false;
        }
        self.content_key_map.insert(
            content_key.clone(),
            SeenPeers {
                origin: peer.clone(),
                fallback: vec![],
            },
        );
        true
    }

    /// Returns true if a transfer of `content_key` is currently inbound.
    pub fn is_transferring(&self, content_key: &TContentKey) -> bool {
        self.content_key_map.get(content_key).is_some()
    }

    /// Releases a content key once its transfer completed.
    pub fn remove_key(&mut self, content_key: &TContentKey) {
        self.content_key_map.remove(content_key);
    }

    /// Releases a failed content key, and returns a randomly selected fallback peer to ask for
    /// the content instead. Returns None if no other peer offered the key.
    pub fn process_failed_key(&mut self, content_key: &TContentKey) -> Option<Enr> {
        if let Some(mut seen_peers) = self.content_key_map.remove(content_key) {
            if seen_peers.fallback.is_empty() {
                debug!("Failed to process content key: {content_key}, no fallback peers found.");
                return None;
            }
            seen_peers.fallback.shuffle(&mut rand::rng());
            Some(seen_peers.fallback.remove(0))
        } else {
            warn!(
                "Failed to process content key: {content_key}, but no transfer record was found"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use portal_api::{generate_random_remote_enr, IdentityContentKey};

    use super::*;

    #[tokio::test]
    async fn test_remove_key() {
        let mut transfers = TransferringKeys::default();
        let content_key = IdentityContentKey::random();
        let (_, peer) = generate_random_remote_enr();
        assert!(transfers.try_claim(&content_key, &peer));
        assert!(transfers.is_transferring(&content_key));
        assert!(!transfers.try_claim(&content_key, &peer));
        transfers.remove_key(&content_key);
        assert!(!transfers.is_transferring(&content_key));
        assert!(transfers.try_claim(&content_key, &peer));
    }

    #[tokio::test]
    async fn test_multiple_peers() {
        let mut transfers = TransferringKeys::default();
        let content_key = IdentityContentKey::random();
        let (_, peer1) = generate_random_remote_enr();
        let (_, peer2) = generate_random_remote_enr();
        assert!(transfers.try_claim(&content_key, &peer1));
        assert!(!transfers.try_claim(&content_key, &peer2));
        assert!(!transfers.try_claim(&content_key, &peer1));
        transfers.remove_key(&content_key);
        assert!(transfers.try_claim(&content_key, &peer1));
    }

    #[tokio::test]
    async fn test_record_survives_duplicate_offers_from_same_peer() {
        let mut transfers = TransferringKeys::default();
        let content_key = IdentityContentKey::random();
        let (_, peer1) = generate_random_remote_enr();
        let (_, peer2) = generate_random_remote_enr();
        assert!(transfers.try_claim(&content_key, &peer1));
        assert!(!transfers.try_claim(&content_key, &peer2));
        // peer1 offers the same content key again
        assert!(!transfers.try_claim(&content_key, &peer1));
        let actual_fallback = transfers.process_failed_key(&content_key);
        assert_eq!(actual_fallback, Some(peer2));
    }

    #[tokio::test]
    async fn test_process_failed_key() {
        let mut transfers = TransferringKeys::default();
        let content_key = IdentityContentKey::random();
        let (_, original_peer) = generate_random_remote_enr();
        let (_, fallback_peer) = generate_random_remote_enr();
        assert!(transfers.try_claim(&content_key, &original_peer));
        assert!(!transfers.try_claim(&content_key, &fallback_peer));
        let actual_fallback = transfers.process_failed_key(&content_key);
        assert_eq!(actual_fallback, Some(fallback_peer));
        // the failed key is released
        assert!(!transfers.is_transferring(&content_key));
    }

    #[tokio::test]
    async fn test_claim_expires() {
        let mut transfers = TransferringKeys::<IdentityContentKey> {
            content_key_map: HashMapDelay::new(Duration::from_millis(100)),
        };
        let content_key = IdentityContentKey::random();
        let (_, peer) = generate_random_remote_enr();
        assert!(transfers.try_claim(&content_key, &peer));
        tokio::time::sleep(Duration::from_millis(300)).await;
        // validate that the content key has been released
        assert!(transfers.try_claim(&content_key, &peer));
    }
}
