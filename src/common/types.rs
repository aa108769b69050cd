use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport-assigned identifier of a remote device.
///
/// Stable for the lifetime of the local process only; the display name is the
/// sole identity that means anything to another device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Connection status of a nearby device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Whether `next` is a legal edge out of `self`.
    ///
    /// The cycle is NotConnected -> Connecting -> Connected -> NotConnected.
    /// Connecting -> NotConnected is the aborted handshake (declined
    /// invitation, failed dial).
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (NotConnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, NotConnected)
                | (Connected, NotConnected)
        )
    }

    pub fn is_active(self) -> bool {
        !matches!(self, ConnectionState::NotConnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::NotConnected => "not connected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// A device seen on the local segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: PeerId,
    pub display_name: String,
    pub connection_state: ConnectionState,
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn new(id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            connection_state: ConnectionState::NotConnected,
            last_seen: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    /// Sending settles exactly once, into Sent or Failed.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        matches!(
            (self, next),
            (DeliveryStatus::Sending, DeliveryStatus::Sent)
                | (DeliveryStatus::Sending, DeliveryStatus::Failed)
        )
    }
}

/// Domain model of a single chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub text: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
}

impl ChatMessage {
    /// A locally composed message, not yet handed to the transport.
    pub fn outgoing(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            direction: Direction::Outgoing,
            timestamp: now(),
            delivery_status: DeliveryStatus::Sending,
        }
    }

    /// A message received from a peer. There is no local transmission to
    /// track, so it starts out settled.
    pub fn incoming(id: Uuid, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            text: text.into(),
            direction: Direction::Incoming,
            timestamp,
            delivery_status: DeliveryStatus::Sent,
        }
    }

    pub fn mark_sent(&mut self) -> bool {
        self.advance(DeliveryStatus::Sent)
    }

    pub fn mark_failed(&mut self) -> bool {
        self.advance(DeliveryStatus::Failed)
    }

    fn advance(&mut self, next: DeliveryStatus) -> bool {
        if !self.delivery_status.can_advance_to(next) {
            log::warn!(
                "Ignoring delivery status change {:?} -> {:?} for message {}",
                self.delivery_status,
                next,
                self.id
            );
            return false;
        }
        self.delivery_status = next;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingKind {
    Start,
    Stop,
}

/// Transient "peer is typing" notification. Relayed, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub kind: TypingKind,
    pub peer_display_name: String,
    pub timestamp: DateTime<Utc>,
}

impl TypingSignal {
    pub fn new(kind: TypingKind, peer_display_name: impl Into<String>) -> Self {
        Self {
            kind,
            peer_display_name: peer_display_name.into(),
            timestamp: now(),
        }
    }
}

/// Wall-clock time at the precision the wire format carries.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn connection_state_edges() {
        use ConnectionState::*;
        assert!(NotConnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(NotConnected));
        assert!(Connecting.can_transition_to(NotConnected));

        assert!(!NotConnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Connected));
    }

    #[test]
    fn delivery_status_settles_once() {
        let mut message = ChatMessage::outgoing("hello");
        assert_eq!(message.delivery_status, DeliveryStatus::Sending);
        assert!(message.mark_sent());
        assert!(!message.mark_failed());
        assert_eq!(message.delivery_status, DeliveryStatus::Sent);

        let mut message = ChatMessage::outgoing("hello");
        assert!(message.mark_failed());
        assert!(!message.mark_sent());
        assert_eq!(message.delivery_status, DeliveryStatus::Failed);
    }

    #[test]
    fn incoming_messages_start_settled() {
        let message = ChatMessage::incoming(Uuid::new_v4(), "hi", now());
        assert_eq!(message.direction, Direction::Incoming);
        assert_eq!(message.delivery_status, DeliveryStatus::Sent);
    }

    proptest! {
        #[test]
        fn delivery_status_settles_at_most_once(
            marks in prop::collection::vec(any::<bool>(), 0..16),
        ) {
            let mut message = ChatMessage::outgoing("hello");
            let mut settled = Vec::new();
            for sent in &marks {
                let moved = if *sent { message.mark_sent() } else { message.mark_failed() };
                if moved {
                    settled.push(*sent);
                }
            }
            match marks.first() {
                None => {
                    prop_assert!(settled.is_empty());
                    prop_assert_eq!(message.delivery_status, DeliveryStatus::Sending);
                }
                Some(&first) => {
                    prop_assert_eq!(settled, vec![first]);
                    let expected = if first { DeliveryStatus::Sent } else { DeliveryStatus::Failed };
                    prop_assert_eq!(message.delivery_status, expected);
                }
            }
        }
    }
}
