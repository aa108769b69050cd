pub mod commands;
pub mod events;
pub mod types;

pub use commands::ServiceCommand;
pub use events::{DiscoveryRole, InvitationResponder, TransportEvent};
pub use types::{
    ChatMessage, ConnectionState, DeliveryStatus, Direction, PeerId, PeerRecord, TypingKind,
    TypingSignal,
};
