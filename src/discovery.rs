//! Advertise + browse, and the trust policy applied to what they turn up.
//!
//! Both roles always run together: every device found is invited straight
//! away and every invitation is accepted, unless the policy says otherwise.

use crate::common::{ConnectionState, DiscoveryRole, InvitationResponder, PeerId};
use crate::config::ServiceType;
use crate::session::SessionManager;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    pub auto_invite: bool,
    pub auto_accept: bool,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            auto_invite: true,
            auto_accept: true,
        }
    }
}

pub struct DiscoveryEngine {
    service: ServiceType,
    policy: DiscoveryPolicy,
    running: bool,
}

impl DiscoveryEngine {
    pub fn new(service: ServiceType, policy: DiscoveryPolicy) -> Self {
        Self {
            service,
            policy,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Start advertising and browsing. Restarts both roles if already
    /// running. A role that fails to start is logged and left off.
    pub fn start(&mut self, transport: &mut dyn Transport) {
        if self.running {
            transport.stop_advertising();
            transport.stop_browsing();
        }
        self.running = true;

        if let Err(err) = transport.start_advertising() {
            self.on_role_failed(DiscoveryRole::Advertise, &err.to_string());
        }
        if let Err(err) = transport.start_browsing() {
            self.on_role_failed(DiscoveryRole::Browse, &err.to_string());
        }
        log::info!("Discovery started for service '{}'", self.service);
    }

    /// Release both roles and disconnect every active peer. Returns the peers
    /// that were disconnected; calling it again returns nothing.
    pub fn stop(
        &mut self,
        session: &mut SessionManager,
        transport: &mut dyn Transport,
    ) -> Vec<PeerId> {
        if !self.running {
            return Vec::new();
        }
        self.running = false;
        transport.stop_advertising();
        transport.stop_browsing();

        let active = session.active_peers();
        for peer in &active {
            transport.disconnect(peer);
            if let Err(err) = session.record_state_change(peer, ConnectionState::NotConnected) {
                log::warn!("Failed to mark {peer} disconnected: {err}");
            }
        }
        log::info!("Discovery stopped ({} peers disconnected)", active.len());
        active
    }

    pub fn on_peer_found(
        &mut self,
        session: &mut SessionManager,
        transport: &mut dyn Transport,
        peer: PeerId,
        display_name: String,
    ) {
        session.record_discovered(peer.clone(), display_name);
        if !self.policy.auto_invite {
            return;
        }
        if session.state_of(&peer) != Some(ConnectionState::NotConnected) {
            return;
        }
        match transport.invite(&peer) {
            Ok(()) => {
                log::debug!("Invited {peer}");
                if let Err(err) = session.record_state_change(&peer, ConnectionState::Connecting) {
                    log::warn!("Invite bookkeeping failed: {err}");
                }
            }
            Err(err) => log::warn!("Failed to invite {peer}: {err}"),
        }
    }

    /// Returns true when the peer was known and has been forgotten.
    pub fn on_peer_lost(
        &mut self,
        session: &mut SessionManager,
        transport: &mut dyn Transport,
        peer: &PeerId,
    ) -> bool {
        let Some(record) = session.record_lost(peer) else {
            return false;
        };
        if record.connection_state.is_active() {
            transport.disconnect(peer);
        }
        true
    }

    pub fn on_invitation(
        &mut self,
        session: &mut SessionManager,
        peer: PeerId,
        display_name: String,
        responder: InvitationResponder,
    ) {
        log::info!("Received invite from '{display_name}' ({peer})");
        if !self.running || !self.policy.auto_accept {
            log::info!("Declining invite from '{display_name}'");
            responder.reject();
            return;
        }
        // An invitation proves presence even if the browser has not reported
        // the peer yet.
        session.record_discovered(peer.clone(), display_name);
        if session.state_of(&peer) == Some(ConnectionState::NotConnected) {
            if let Err(err) = session.record_state_change(&peer, ConnectionState::Connecting) {
                log::warn!("Invite bookkeeping failed: {err}");
            }
        }
        responder.accept();
    }

    /// Returns true when the peer map changed.
    ///
    /// A handshake only begins from a fresh sighting or an invitation, so a
    /// transport reporting Connecting for an idle peer is ignored.
    pub fn on_state_changed(
        &mut self,
        session: &mut SessionManager,
        peer: &PeerId,
        state: ConnectionState,
    ) -> bool {
        if state == ConnectionState::Connecting
            && session.state_of(peer) == Some(ConnectionState::NotConnected)
        {
            log::warn!("Ignoring Connecting report for idle peer {peer}");
            return false;
        }
        match session.record_state_change(peer, state) {
            Ok(change) => change != crate::session::StateChange::Unchanged,
            Err(err) => {
                log::warn!("Ignoring session update: {err}");
                false
            }
        }
    }

    pub fn on_role_failed(&self, role: DiscoveryRole, reason: &str) {
        log::warn!("Discovery {role} failed to start: {reason}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;

    use super::*;
    use crate::transport::testing::{Call, RecordingTransport};

    fn engine(policy: DiscoveryPolicy) -> (DiscoveryEngine, SessionManager, RecordingTransport) {
        (
            DiscoveryEngine::new(ServiceType::default(), policy),
            SessionManager::new(),
            RecordingTransport::default(),
        )
    }

    fn responder() -> (InvitationResponder, Arc<Mutex<Option<bool>>>) {
        let answer = Arc::new(Mutex::new(None));
        let slot = answer.clone();
        let responder = InvitationResponder::new(move |accepted| {
            *slot.lock().unwrap() = Some(accepted);
        });
        (responder, answer)
    }

    #[test]
    fn start_runs_both_roles_and_stop_is_idempotent() {
        let (mut discovery, mut session, mut transport) = engine(DiscoveryPolicy::default());
        discovery.start(&mut transport);
        assert!(discovery.is_running());
        assert_eq!(transport.calls(), [Call::StartAdvertising, Call::StartBrowsing]);

        discovery.stop(&mut session, &mut transport);
        discovery.stop(&mut session, &mut transport);
        assert!(!discovery.is_running());
        assert_eq!(
            transport.calls(),
            [
                Call::StartAdvertising,
                Call::StartBrowsing,
                Call::StopAdvertising,
                Call::StopBrowsing
            ]
        );
    }

    #[test]
    fn advertising_failure_still_browses() {
        let (mut discovery, _, mut transport) = engine(DiscoveryPolicy::default());
        transport.fail_advertising = true;
        discovery.start(&mut transport);
        assert!(discovery.is_running());
        assert!(transport.calls().contains(&Call::StartBrowsing));
    }

    #[test]
    fn found_peer_is_invited_once() {
        let (mut discovery, mut session, mut transport) = engine(DiscoveryPolicy::default());
        discovery.start(&mut transport);
        let bob = PeerId::from("bob");

        discovery.on_peer_found(&mut session, &mut transport, bob.clone(), "Bob".into());
        discovery.on_peer_found(&mut session, &mut transport, bob.clone(), "Bob".into());

        let invites = transport
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Invite(_)))
            .count();
        assert_eq!(invites, 1);
        assert_eq!(session.state_of(&bob), Some(ConnectionState::Connecting));
    }

    #[test]
    fn manual_pairing_leaves_found_peer_alone() {
        let (mut discovery, mut session, mut transport) = engine(DiscoveryPolicy {
            auto_invite: false,
            auto_accept: true,
        });
        discovery.start(&mut transport);
        let bob = PeerId::from("bob");
        discovery.on_peer_found(&mut session, &mut transport, bob.clone(), "Bob".into());
        assert_eq!(session.state_of(&bob), Some(ConnectionState::NotConnected));
        assert!(!transport.calls().contains(&Call::Invite(bob)));
    }

    #[test]
    fn invitation_is_accepted_and_registers_peer() {
        let (mut discovery, mut session, mut transport) = engine(DiscoveryPolicy::default());
        discovery.start(&mut transport);
        let (responder, answer) = responder();
        let carol = PeerId::from("carol");

        discovery.on_invitation(&mut session, carol.clone(), "Carol".into(), responder);
        assert_eq!(*answer.lock().unwrap(), Some(true));
        assert_eq!(session.state_of(&carol), Some(ConnectionState::Connecting));
    }

    #[test]
    fn invitation_is_declined_without_consent() {
        let (mut discovery, mut session, mut transport) = engine(DiscoveryPolicy {
            auto_invite: true,
            auto_accept: false,
        });
        discovery.start(&mut transport);
        let (responder, answer) = responder();
        discovery.on_invitation(&mut session, PeerId::from("eve"), "Eve".into(), responder);
        assert_eq!(*answer.lock().unwrap(), Some(false));
        assert!(session.is_empty());
    }

    #[test]
    fn losing_a_connected_peer_tears_its_session_down() {
        let (mut discovery, mut session, mut transport) = engine(DiscoveryPolicy::default());
        discovery.start(&mut transport);
        let bob = PeerId::from("bob");
        discovery.on_peer_found(&mut session, &mut transport, bob.clone(), "Bob".into());
        discovery.on_state_changed(&mut session, &bob, ConnectionState::Connected);

        assert!(discovery.on_peer_lost(&mut session, &mut transport, &bob));
        assert!(session.is_empty());
        assert!(transport.calls().contains(&Call::Disconnect(bob.clone())));
        assert!(!discovery.on_peer_lost(&mut session, &mut transport, &bob));
    }

    #[test]
    fn stop_disconnects_active_peers() {
        let (mut discovery, mut session, mut transport) = engine(DiscoveryPolicy::default());
        discovery.start(&mut transport);
        let bob = PeerId::from("bob");
        discovery.on_peer_found(&mut session, &mut transport, bob.clone(), "Bob".into());
        discovery.on_state_changed(&mut session, &bob, ConnectionState::Connected);

        assert_eq!(discovery.stop(&mut session, &mut transport), vec![bob.clone()]);
        assert_eq!(session.state_of(&bob), Some(ConnectionState::NotConnected));
        assert!(transport.calls().contains(&Call::Disconnect(bob)));
    }

    #[test]
    fn illegal_state_report_is_ignored() {
        let (mut discovery, mut session, mut transport) = engine(DiscoveryPolicy::default());
        let bob = PeerId::from("bob");
        discovery.start(&mut transport);
        session.record_discovered(bob.clone(), "Bob");
        assert!(!discovery.on_state_changed(&mut session, &bob, ConnectionState::Connected));
        assert_eq!(session.state_of(&bob), Some(ConnectionState::NotConnected));
    }

    #[test]
    fn transport_cannot_restart_a_handshake_on_its_own() {
        let (mut discovery, mut session, mut transport) = engine(DiscoveryPolicy::default());
        let bob = PeerId::from("bob");
        discovery.start(&mut transport);
        discovery.on_peer_found(&mut session, &mut transport, bob.clone(), "Bob".into());
        assert!(discovery.on_state_changed(&mut session, &bob, ConnectionState::Connected));
        assert!(discovery.on_state_changed(&mut session, &bob, ConnectionState::NotConnected));

        assert!(!discovery.on_state_changed(&mut session, &bob, ConnectionState::Connecting));
        assert_eq!(session.state_of(&bob), Some(ConnectionState::NotConnected));
    }

    proptest! {
        #[test]
        fn transport_reports_never_leave_idle_on_their_own(
            reports in prop::collection::vec(
                prop_oneof![
                    Just(ConnectionState::NotConnected),
                    Just(ConnectionState::Connecting),
                    Just(ConnectionState::Connected),
                ],
                0..32,
            ),
        ) {
            let policy = DiscoveryPolicy { auto_invite: false, auto_accept: true };
            let (mut discovery, mut session, mut transport) = engine(policy);
            let bob = PeerId::from("bob");
            discovery.start(&mut transport);
            discovery.on_peer_found(&mut session, &mut transport, bob.clone(), "Bob".into());
            for state in reports {
                discovery.on_state_changed(&mut session, &bob, state);
                prop_assert_eq!(session.state_of(&bob), Some(ConnectionState::NotConnected));
            }
        }
    }
}
