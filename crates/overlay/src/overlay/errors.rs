use portal_api::types::protocol_versions::ProtocolVersionError;
use thiserror::Error;

use crate::transport::TransportError;

/// An overlay request error.
#[derive(Clone, Error, Debug)]
pub enum OverlayRequestError {
    /// A failure to transmit or receive a message on a channel.
    #[error("Channel failure: {0}")]
    ChannelFailure(String),

    /// An invalid request was received.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An invalid response was received.
    #[error("Invalid response")]
    InvalidResponse,

    #[error("The request returned an empty response")]
    EmptyResponse,

    /// A failure to decode a message.
    #[error("The message was unable to be decoded")]
    DecodeError,

    /// The request timed out.
    #[error("The request timed out")]
    Timeout,

    /// The request was unable to be served.
    #[error("Failure to serve request: {0}")]
    Failure(String),

    /// The underlying transport failed to deliver the request.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// No protocol version in common with the peer.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(ProtocolVersionError),

    /// Error types resulting from building ACCEPT message.
    #[error("Error while building accept message: {0}")]
    AcceptError(String),

    /// Error types resulting from sending OFFER message.
    #[error("Error while sending offer message: {0}")]
    OfferError(String),

    /// Stream transfer error.
    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Content wasn't found on the network: {message}")]
    ContentNotFound {
        message: String,
        utp: bool,
    },
}

impl From<TransportError> for OverlayRequestError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout,
            TransportError::Failure(message) => Self::TransportError(message),
        }
    }
}

impl From<ProtocolVersionError> for OverlayRequestError {
    fn from(err: ProtocolVersionError) -> Self {
        Self::UnsupportedVersion(err)
    }
}
