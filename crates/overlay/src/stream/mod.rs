pub mod rate_limiter;

use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use portal_api::types::{enr::Enr, protocol_versions::ProtocolVersion};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::{
    transport::{ConnectionId, StreamTransport},
    utils::portal_wire,
};

/// Owns everything related to moving content payloads over reliable streams: transfer caps in
/// both directions, connection id allocation, and the version-dependent framing of single
/// find-content payloads.
pub struct StreamController {
    inbound_transfer_semaphore: Arc<Semaphore>,
    outbound_transfer_semaphore: Arc<Semaphore>,
    transport: Arc<dyn StreamTransport>,
}

/// An enum for deciding to initiate the stream as connecting or accepting. The selection is
/// specified in the wire protocol, depending upon whether the data is being transferred inbound
/// or outbound.
enum StreamSide {
    Connect,
    Accept,
}

impl StreamController {
    pub fn new(transfer_limit: usize, transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            inbound_transfer_semaphore: Arc::new(Semaphore::new(transfer_limit)),
            outbound_transfer_semaphore: Arc::new(Semaphore::new(transfer_limit)),
            transport,
        }
    }

    /// Allocates a connection id pair for a transfer this node will wait on.
    pub fn cid(&self) -> ConnectionId {
        ConnectionId::random_accepting()
    }

    /// Non-blocking attempt to acquire a permit for an outbound transfer. Returns `None`
    /// immediately when the cap is reached.
    pub fn get_outbound_semaphore(&self) -> Option<OwnedSemaphorePermit> {
        self.outbound_transfer_semaphore
            .clone()
            .try_acquire_owned()
            .ok()
    }

    /// Non-blocking attempt to acquire a permit for an inbound transfer. Returns `None`
    /// immediately when the cap is reached.
    pub fn get_inbound_semaphore(&self) -> Option<OwnedSemaphorePermit> {
        self.inbound_transfer_semaphore
            .clone()
            .try_acquire_owned()
            .ok()
    }

    pub async fn connect_inbound_stream(
        &self,
        cid: ConnectionId,
        peer: Enr,
    ) -> anyhow::Result<Bytes> {
        self.inbound_stream(cid, peer, StreamSide::Connect).await
    }

    pub async fn accept_inbound_stream(
        &self,
        cid: ConnectionId,
        peer: Enr,
    ) -> anyhow::Result<Bytes> {
        self.inbound_stream(cid, peer, StreamSide::Accept).await
    }

    pub async fn connect_outbound_stream(
        &self,
        cid: ConnectionId,
        peer: Enr,
        data: &[u8],
    ) -> bool {
        self.outbound_stream(cid, peer, data, StreamSide::Connect)
            .await
    }

    pub async fn accept_outbound_stream(
        &self,
        cid: ConnectionId,
        peer: Enr,
        data: &[u8],
    ) -> bool {
        self.outbound_stream(cid, peer, data, StreamSide::Accept)
            .await
    }

    async fn inbound_stream(
        &self,
        cid: ConnectionId,
        peer: Enr,
        side: StreamSide,
    ) -> anyhow::Result<Bytes> {
        let (stream, message) = match side {
            StreamSide::Connect => (
                self.transport.connect_with_cid(cid, peer.clone()).await,
                "connect inbound stream",
            ),
            StreamSide::Accept => (
                self.transport.accept_with_cid(cid, peer.clone()).await,
                "accept inbound stream",
            ),
        };
        let mut stream = stream.map_err(|err| {
            debug!(%err, cid.send, cid.recv, peer = %peer.node_id(), "unable to {message}");
            anyhow!("unable to {message}")
        })?;

        let data = stream.read_to_eof().await.map_err(|err| {
            debug!(%err, cid.send, cid.recv, peer = %peer.node_id(), "error reading data from {message}");
            anyhow!("error reading data from {message}")
        })?;

        Ok(Bytes::from(data))
    }

    async fn outbound_stream(
        &self,
        cid: ConnectionId,
        peer: Enr,
        data: &[u8],
        side: StreamSide,
    ) -> bool {
        let (stream, message) = match side {
            StreamSide::Connect => (
                self.transport.connect_with_cid(cid, peer.clone()).await,
                "outbound connect with cid",
            ),
            StreamSide::Accept => (
                self.transport.accept_with_cid(cid, peer.clone()).await,
                "outbound accept with cid",
            ),
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                debug!(
                    %err,
                    cid.send,
                    cid.recv,
                    peer = %peer.node_id(),
                    "Unable to establish stream based on {message}",
                );
                return false;
            }
        };

        if let Err(err) = stream.write_all(data).await {
            debug!(
                %err,
                cid.send,
                cid.recv,
                peer = %peer.node_id(),
                "Error writing content to outbound stream",
            );
            return false;
        }

        if let Err(err) = stream.close().await {
            debug!(
                %err,
                cid.send,
                cid.recv,
                peer = %peer.node_id(),
                "Error closing outbound stream",
            );
            return false;
        }
        true
    }
}

/// Encodes a single find-content payload for transfer to a peer negotiated at
/// `protocol_version`. Version 1 wraps the value in a varint length frame; version 0 sends the
/// bare blob.
pub fn encode_find_content_payload(
    protocol_version: ProtocolVersion,
    data: &[u8],
) -> anyhow::Result<Bytes> {
    if protocol_version.is_v1_enabled() {
        Ok(portal_wire::encode_single_content_payload(data)?.freeze())
    } else {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Decodes a single find-content payload received from a peer negotiated at
/// `protocol_version`. At version 1 trailing bytes after the framed value fail the transfer.
pub fn decode_find_content_payload(
    protocol_version: ProtocolVersion,
    data: Bytes,
) -> anyhow::Result<Bytes> {
    if protocol_version.is_v1_enabled() {
        Ok(portal_wire::decode_single_content_payload(data)?)
    } else {
        Ok(data)
    }
}
