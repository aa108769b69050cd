//! Local-network peer-to-peer chat core.
//!
//! Devices on the same segment find each other, join a session and exchange
//! chat messages and typing presence. [`ChatService`] is the entry point; the
//! radio underneath is any [`Transport`].

pub mod codec;
pub mod common;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod network;
pub mod service;
pub mod session;
pub mod transport;
pub mod typing;

pub use codec::{Packet, PacketKind, WireEnvelope};
pub use common::{
    ChatMessage, ConnectionState, DeliveryStatus, Direction, PeerId, PeerRecord, TypingKind,
    TypingSignal,
};
pub use config::{ChatConfig, ServiceType, load_config};
pub use dispatcher::SendOutcome;
pub use error::{
    ConfigError, DecodeError, EncodeError, SendError, ServiceError, SessionError, TransportError,
};
pub use hub::{EventHub, Subscription};
pub use network::{Libp2pTransport, MemoryNetwork, MemoryTransport};
pub use service::ChatService;
pub use transport::{DiscoveryObserver, Observers, SessionObserver, Transport};
