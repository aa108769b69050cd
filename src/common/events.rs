use std::fmt;

use super::types::{ConnectionState, PeerId};

/// Which half of discovery an event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryRole {
    Advertise,
    Browse,
}

impl fmt::Display for DiscoveryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryRole::Advertise => f.write_str("advertiser"),
            DiscoveryRole::Browse => f.write_str("browser"),
        }
    }
}

/// Accept/reject callback handed over with an inbound invitation.
pub struct InvitationResponder(Box<dyn FnOnce(bool) + Send>);

impl InvitationResponder {
    pub fn new(respond: impl FnOnce(bool) + Send + 'static) -> Self {
        Self(Box::new(respond))
    }

    pub fn respond(self, accept: bool) {
        (self.0)(accept)
    }

    pub fn accept(self) {
        self.respond(true)
    }

    pub fn reject(self) {
        self.respond(false)
    }
}

impl fmt::Debug for InvitationResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InvitationResponder")
    }
}

/// Transport callbacks, queued for the owner task.
#[derive(Debug)]
pub enum TransportEvent {
    PeerFound {
        peer: PeerId,
        display_name: String,
    },
    PeerLost {
        peer: PeerId,
    },
    Invitation {
        peer: PeerId,
        display_name: String,
        responder: InvitationResponder,
    },
    DiscoveryFailed {
        role: DiscoveryRole,
        reason: String,
    },
    SessionStateChanged {
        peer: PeerId,
        state: ConnectionState,
    },
    DataReceived {
        peer: PeerId,
        bytes: Vec<u8>,
    },
}
