//! Seams between the core and whatever moves bytes between devices.
//!
//! A transport implements [`Transport`] and reports what happens on the air
//! through the two observer interfaces. The core's observers only enqueue;
//! every callback is handled later on the owner task, so transports may call
//! them from any thread and while holding their own locks.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::common::{
    ConnectionState, DiscoveryRole, InvitationResponder, PeerId, TransportEvent,
};
use crate::config::ServiceType;
use crate::error::TransportError;

pub trait DiscoveryObserver: Send + Sync {
    fn peer_found(&self, peer: PeerId, display_name: String);
    fn peer_lost(&self, peer: PeerId);
    fn invitation_received(&self, peer: PeerId, display_name: String, responder: InvitationResponder);
    /// Advertising or browsing could not start. The device stays usable, just
    /// less visible.
    fn discovery_failed(&self, role: DiscoveryRole, reason: String);
}

pub trait SessionObserver: Send + Sync {
    fn session_state_changed(&self, peer: PeerId, state: ConnectionState);
    fn data_received(&self, peer: PeerId, bytes: Vec<u8>);
}

#[derive(Clone)]
pub struct Observers {
    pub discovery: Arc<dyn DiscoveryObserver>,
    pub session: Arc<dyn SessionObserver>,
}

/// How this device presents itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeer {
    pub display_name: String,
    pub service: ServiceType,
}

pub trait Transport: Send {
    /// Called once before anything else.
    fn bind(&mut self, local: &LocalPeer, observers: Observers);
    fn start_advertising(&mut self) -> Result<(), TransportError>;
    fn stop_advertising(&mut self);
    fn start_browsing(&mut self) -> Result<(), TransportError>;
    fn stop_browsing(&mut self);
    fn invite(&mut self, peer: &PeerId) -> Result<(), TransportError>;
    fn disconnect(&mut self, peer: &PeerId);
    /// Best-effort broadcast to `peers`. The transmission is queued before
    /// this returns, so consecutive sends keep their order; the future only
    /// reports the outcome.
    fn send(&mut self, peers: &[PeerId], bytes: Vec<u8>)
    -> BoxFuture<'static, Result<(), TransportError>>;
}

/// Observer implementation used by the core: forwards every callback onto the
/// owner's queue.
#[derive(Clone)]
pub struct EventSink {
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { events }
    }

    pub fn observers(self) -> Observers {
        let sink = Arc::new(self);
        Observers {
            discovery: sink.clone(),
            session: sink,
        }
    }

    fn forward(&self, event: TransportEvent) {
        if let Err(err) = self.events.send(event) {
            log::debug!("Dropping transport event after shutdown: {:?}", err.0);
        }
    }
}

impl DiscoveryObserver for EventSink {
    fn peer_found(&self, peer: PeerId, display_name: String) {
        self.forward(TransportEvent::PeerFound { peer, display_name });
    }

    fn peer_lost(&self, peer: PeerId) {
        self.forward(TransportEvent::PeerLost { peer });
    }

    fn invitation_received(&self, peer: PeerId, display_name: String, responder: InvitationResponder) {
        self.forward(TransportEvent::Invitation {
            peer,
            display_name,
            responder,
        });
    }

    fn discovery_failed(&self, role: DiscoveryRole, reason: String) {
        self.forward(TransportEvent::DiscoveryFailed { role, reason });
    }
}

impl SessionObserver for EventSink {
    fn session_state_changed(&self, peer: PeerId, state: ConnectionState) {
        self.forward(TransportEvent::SessionStateChanged { peer, state });
    }

    fn data_received(&self, peer: PeerId, bytes: Vec<u8>) {
        self.forward(TransportEvent::DataReceived { peer, bytes });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use futures::FutureExt;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        StartAdvertising,
        StopAdvertising,
        StartBrowsing,
        StopBrowsing,
        Invite(PeerId),
        Disconnect(PeerId),
        Send(Vec<PeerId>, Vec<u8>),
    }

    /// Records every call; sends succeed unless told otherwise.
    #[derive(Clone, Default)]
    pub struct RecordingTransport {
        pub calls: Arc<Mutex<Vec<Call>>>,
        pub send_result: Arc<Mutex<Option<TransportError>>>,
        pub fail_advertising: bool,
    }

    impl RecordingTransport {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn sends(&self) -> Vec<(Vec<PeerId>, Vec<u8>)> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Send(peers, bytes) => Some((peers, bytes)),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Transport for RecordingTransport {
        fn bind(&mut self, _local: &LocalPeer, _observers: Observers) {}

        fn start_advertising(&mut self) -> Result<(), TransportError> {
            self.record(Call::StartAdvertising);
            if self.fail_advertising {
                return Err(TransportError::Unavailable("no radio".into()));
            }
            Ok(())
        }

        fn stop_advertising(&mut self) {
            self.record(Call::StopAdvertising);
        }

        fn start_browsing(&mut self) -> Result<(), TransportError> {
            self.record(Call::StartBrowsing);
            Ok(())
        }

        fn stop_browsing(&mut self) {
            self.record(Call::StopBrowsing);
        }

        fn invite(&mut self, peer: &PeerId) -> Result<(), TransportError> {
            self.record(Call::Invite(peer.clone()));
            Ok(())
        }

        fn disconnect(&mut self, peer: &PeerId) {
            self.record(Call::Disconnect(peer.clone()));
        }

        fn send(
            &mut self,
            peers: &[PeerId],
            bytes: Vec<u8>,
        ) -> BoxFuture<'static, Result<(), TransportError>> {
            self.record(Call::Send(peers.to_vec(), bytes));
            let result = match self.send_result.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            futures::future::ready(result).boxed()
        }
    }
}
