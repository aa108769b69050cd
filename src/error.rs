use crate::codec::PacketKind;
use crate::common::{ConnectionState, PeerId};

/// Why an outgoing message ended up `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no transport session; start discovery first")]
    NoSession,
    #[error("no connected peers to send to")]
    NoPeers,
    #[error("transport rejected the send: {0}")]
    TransmitFailure(#[from] TransportError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("{kind} payload does not match its schema: {source}")]
    Payload {
        kind: PacketKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("timestamp {0} is out of range")]
    Timestamp(f64),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to encode packet: {0}")]
pub struct EncodeError(#[from] pub serde_json::Error);

/// Failures reported by a transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("none of the recipients is reachable")]
    NoRecipients,
    #[error("send rejected: {0}")]
    Rejected(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("peer {peer} cannot move from {from} to {to}")]
    InvalidTransition {
        peer: PeerId,
        from: ConnectionState,
        to: ConnectionState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "invalid service type `{0}`: use 1-15 lowercase letters, digits or single hyphens, not at either end"
    )]
    InvalidServiceType(String),
    #[error("display name must not be empty")]
    EmptyDisplayName,
    #[error("invalid listen address `{address}`: {reason}")]
    InvalidListenAddr { address: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("chat service has shut down")]
    Stopped,
}
