use std::io;

use async_trait::async_trait;
use discv5::enr::NodeId;
use portal_api::types::enr::Enr;
use thiserror::Error;

/// An error from the request transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The peer did not answer within the transport's deadline.
    #[error("The request timed out")]
    Timeout,

    /// The frame could not be delivered or the peer answered garbage.
    #[error("Transport failure: {0}")]
    Failure(String),
}

/// The request/response half of the discovery layer, as consumed by the overlay.
///
/// Implementations deliver authenticated, size-limited frames to an ENR-identified peer and
/// hand back the peer's reply frame. The overlay correlates frames with its own nonces and
/// applies its own per-request deadlines on top of whatever the transport enforces.
#[async_trait]
pub trait RequestTransport: Send + Sync + 'static {
    /// Returns the local node's signed record.
    fn local_enr(&self) -> Enr;

    /// Looks up a peer's record outside the routing table, e.g. in the transport's session
    /// cache. Used to resolve senders of inbound requests.
    fn cached_enr(&self, node_id: &NodeId) -> Option<Enr>;

    /// Delivers a request frame to `destination` and awaits the reply frame.
    async fn send_request(
        &self,
        destination: &Enr,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError>;
}

/// A pair of connection ids addressing one reliable stream.
///
/// The accepting side generates the pair; the id it advertises on the wire is its `send` id,
/// which becomes the initiator's `recv` id. `send` and `recv` always differ by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub send: u16,
    pub recv: u16,
}

impl ConnectionId {
    /// Generates a fresh pair for the side that will wait for the peer to initiate.
    pub fn random_accepting() -> Self {
        let send: u16 = rand::random();
        Self {
            send,
            recv: send.wrapping_add(1),
        }
    }

    /// Builds the initiating side's pair from a connection id received on the wire.
    pub fn from_wire(connection_id: u16) -> Self {
        Self {
            recv: connection_id,
            send: connection_id.wrapping_add(1),
        }
    }
}

/// A reliable byte stream carrying one content payload.
#[async_trait]
pub trait ContentStream: Send {
    /// Reads the entire payload until the peer closes its end.
    async fn read_to_eof(&mut self) -> io::Result<Vec<u8>>;

    /// Writes the entire payload.
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Closes the local end, signalling end of payload to the peer.
    async fn close(&mut self) -> io::Result<()>;
}

/// The reliable-stream half of the transport, as consumed by the overlay.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Initiates a stream towards `peer` with the given connection id pair.
    async fn connect_with_cid(
        &self,
        cid: ConnectionId,
        peer: Enr,
    ) -> io::Result<Box<dyn ContentStream>>;

    /// Waits for `peer` to initiate a stream with the given connection id pair.
    async fn accept_with_cid(
        &self,
        cid: ConnectionId,
        peer: Enr,
    ) -> io::Result<Box<dyn ContentStream>>;
}
