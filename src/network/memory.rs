//! In-process radio segment.
//!
//! Every [`MemoryTransport`] handed out by one [`MemoryNetwork`] shares the
//! same registry. Callbacks are collected while the registry is locked and
//! delivered after the lock is released, so observers may call straight back
//! into the network.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::common::{ConnectionState, InvitationResponder, PeerId};
use crate::config::ServiceType;
use crate::error::TransportError;
use crate::transport::{LocalPeer, Observers, Transport};

struct Node {
    name: String,
    service: ServiceType,
    observers: Observers,
    advertising: bool,
    browsing: bool,
    fail_sends: bool,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    nodes: HashMap<PeerId, Node>,
    /// (browser, advertiser) pairs the browser has been told about.
    sightings: HashSet<(PeerId, PeerId)>,
    /// (inviter, invitee) pairs awaiting an answer.
    invites: HashSet<(PeerId, PeerId)>,
    /// Established sessions, stored with the smaller id first.
    links: HashSet<(PeerId, PeerId)>,
}

enum Notice {
    Found(Observers, PeerId, String),
    Lost(Observers, PeerId),
    Invitation(Observers, PeerId, String, InvitationResponder),
    State(Observers, PeerId, ConnectionState),
    Data(Observers, PeerId, Vec<u8>),
}

fn deliver(notices: Vec<Notice>) {
    for notice in notices {
        match notice {
            Notice::Found(to, peer, name) => to.discovery.peer_found(peer, name),
            Notice::Lost(to, peer) => to.discovery.peer_lost(peer),
            Notice::Invitation(to, peer, name, responder) => {
                to.discovery.invitation_received(peer, name, responder)
            }
            Notice::State(to, peer, state) => to.session.session_state_changed(peer, state),
            Notice::Data(to, peer, bytes) => to.session.data_received(peer, bytes),
        }
    }
}

fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl Registry {
    fn observers(&self, peer: &PeerId) -> Option<Observers> {
        self.nodes.get(peer).map(|node| node.observers.clone())
    }

    fn name(&self, peer: &PeerId) -> String {
        self.nodes
            .get(peer)
            .map(|node| node.name.clone())
            .unwrap_or_default()
    }

    fn linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.links.contains(&link_key(a, b))
    }

    /// Tell `browser` about `advertiser` if it has not heard of it yet.
    fn sight(&mut self, browser: &PeerId, advertiser: &PeerId, notices: &mut Vec<Notice>) {
        if browser == advertiser {
            return;
        }
        let (Some(b), Some(a)) = (self.nodes.get(browser), self.nodes.get(advertiser)) else {
            return;
        };
        if !b.browsing || !a.advertising || b.service != a.service {
            return;
        }
        if self.sightings.insert((browser.clone(), advertiser.clone())) {
            notices.push(Notice::Found(
                b.observers.clone(),
                advertiser.clone(),
                a.name.clone(),
            ));
        }
    }

    /// Withdraw `advertiser` from every browser that saw it.
    fn unsight(&mut self, advertiser: &PeerId, notices: &mut Vec<Notice>) {
        let browsers: Vec<PeerId> = self
            .sightings
            .iter()
            .filter(|(_, seen)| seen == advertiser)
            .map(|(browser, _)| browser.clone())
            .collect();
        for browser in browsers {
            self.sightings.remove(&(browser.clone(), advertiser.clone()));
            if let Some(observers) = self.observers(&browser) {
                notices.push(Notice::Lost(observers, advertiser.clone()));
            }
        }
    }

    fn unlink(&mut self, a: &PeerId, b: &PeerId, notices: &mut Vec<Notice>) {
        if self.links.remove(&link_key(a, b)) {
            for (me, other) in [(a, b), (b, a)] {
                if let Some(observers) = self.observers(me) {
                    notices.push(Notice::State(
                        observers,
                        other.clone(),
                        ConnectionState::NotConnected,
                    ));
                }
            }
        }
        // An unanswered invite from `a` leaves `a` waiting in Connecting.
        if self.invites.remove(&(a.clone(), b.clone())) {
            if let Some(observers) = self.observers(a) {
                notices.push(Notice::State(
                    observers,
                    b.clone(),
                    ConnectionState::NotConnected,
                ));
            }
        }
        self.invites.remove(&(b.clone(), a.clone()));
    }
}

/// Shared handle to an in-process segment.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh device on this segment, identified as `peer-N`.
    pub fn transport(&self) -> MemoryTransport {
        let id = {
            let mut registry = self.lock();
            registry.next_id += 1;
            PeerId::new(format!("peer-{}", registry.next_id))
        };
        MemoryTransport {
            id,
            network: self.clone(),
        }
    }

    /// Hand `bytes` to `to` as if `from` had sent them, bypassing sessions.
    pub fn deliver_raw(&self, from: &PeerId, to: &PeerId, bytes: Vec<u8>) {
        let notices = match self.lock().observers(to) {
            Some(observers) => vec![Notice::Data(observers, from.clone(), bytes)],
            None => Vec::new(),
        };
        deliver(notices);
    }

    /// Make every later send from `peer` fail at the transport.
    pub fn set_send_failure(&self, peer: &PeerId, fail: bool) {
        if let Some(node) = self.lock().nodes.get_mut(peer) {
            node.fail_sends = fail;
        }
    }

    /// `peer` drops off the segment: browsers lose sight of it and its
    /// sessions end.
    pub fn vanish(&self, peer: &PeerId) {
        let mut notices = Vec::new();
        {
            let mut registry = self.lock();
            if let Some(node) = registry.nodes.get_mut(peer) {
                node.advertising = false;
                node.browsing = false;
            }
            let linked: Vec<PeerId> = registry
                .links
                .iter()
                .filter_map(|(a, b)| {
                    if a == peer {
                        Some(b.clone())
                    } else if b == peer {
                        Some(a.clone())
                    } else {
                        None
                    }
                })
                .collect();
            for other in linked {
                registry.unlink(peer, &other, &mut notices);
            }
            registry
                .invites
                .retain(|(from, to)| from != peer && to != peer);
            registry.unsight(peer, &mut notices);
            registry.sightings.retain(|(browser, _)| browser != peer);
        }
        deliver(notices);
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.lock().linked(a, b)
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn answer(&self, inviter: &PeerId, invitee: &PeerId, accept: bool) {
        let mut notices = Vec::new();
        {
            let mut registry = self.lock();
            if !registry
                .invites
                .remove(&(inviter.clone(), invitee.clone()))
            {
                return;
            }
            let (Some(from), Some(to)) = (registry.observers(inviter), registry.observers(invitee))
            else {
                return;
            };
            if accept {
                registry.links.insert(link_key(inviter, invitee));
                notices.push(Notice::State(
                    from,
                    invitee.clone(),
                    ConnectionState::Connected,
                ));
                notices.push(Notice::State(to, inviter.clone(), ConnectionState::Connected));
            } else {
                notices.push(Notice::State(
                    from,
                    invitee.clone(),
                    ConnectionState::NotConnected,
                ));
            }
        }
        deliver(notices);
    }
}

pub struct MemoryTransport {
    id: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn peer_id(&self) -> &PeerId {
        &self.id
    }

    fn update(&self, change: impl FnOnce(&mut Registry, &mut Vec<Notice>)) {
        let mut notices = Vec::new();
        {
            let mut registry = self.network.lock();
            change(&mut registry, &mut notices);
        }
        deliver(notices);
    }
}

impl Transport for MemoryTransport {
    fn bind(&mut self, local: &LocalPeer, observers: Observers) {
        self.network.lock().nodes.insert(
            self.id.clone(),
            Node {
                name: local.display_name.clone(),
                service: local.service.clone(),
                observers,
                advertising: false,
                browsing: false,
                fail_sends: false,
            },
        );
    }

    fn start_advertising(&mut self) -> Result<(), TransportError> {
        let id = self.id.clone();
        let mut bound = true;
        self.update(|registry, notices| {
            let Some(node) = registry.nodes.get_mut(&id) else {
                bound = false;
                return;
            };
            node.advertising = true;
            let browsers: Vec<PeerId> = registry.nodes.keys().cloned().collect();
            for browser in browsers {
                registry.sight(&browser, &id, notices);
            }
        });
        if bound {
            Ok(())
        } else {
            Err(TransportError::Unavailable("transport not bound".into()))
        }
    }

    fn stop_advertising(&mut self) {
        let id = self.id.clone();
        self.update(|registry, notices| {
            if let Some(node) = registry.nodes.get_mut(&id) {
                node.advertising = false;
            }
            registry.unsight(&id, notices);
        });
    }

    fn start_browsing(&mut self) -> Result<(), TransportError> {
        let id = self.id.clone();
        let mut bound = true;
        self.update(|registry, notices| {
            let Some(node) = registry.nodes.get_mut(&id) else {
                bound = false;
                return;
            };
            node.browsing = true;
            let advertisers: Vec<PeerId> = registry.nodes.keys().cloned().collect();
            for advertiser in advertisers {
                registry.sight(&id, &advertiser, notices);
            }
        });
        if bound {
            Ok(())
        } else {
            Err(TransportError::Unavailable("transport not bound".into()))
        }
    }

    fn stop_browsing(&mut self) {
        let id = self.id.clone();
        self.update(|registry, _| {
            if let Some(node) = registry.nodes.get_mut(&id) {
                node.browsing = false;
            }
            registry.sightings.retain(|(browser, _)| *browser != id);
        });
    }

    fn invite(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let id = self.id.clone();
        let mut result = Ok(());
        self.update(|registry, notices| {
            let Some(to) = registry.observers(peer) else {
                result = Err(TransportError::NotConnected(peer.clone()));
                return;
            };
            if registry.linked(&id, peer)
                || registry.invites.contains(&(peer.clone(), id.clone()))
                || !registry.invites.insert((id.clone(), peer.clone()))
            {
                return;
            }
            let network = self.network.clone();
            let (inviter, invitee) = (id.clone(), peer.clone());
            let responder = InvitationResponder::new(move |accept| {
                network.answer(&inviter, &invitee, accept);
            });
            notices.push(Notice::Invitation(to, id.clone(), registry.name(&id), responder));
        });
        result
    }

    fn disconnect(&mut self, peer: &PeerId) {
        let id = self.id.clone();
        self.update(|registry, notices| registry.unlink(&id, peer, notices));
    }

    fn send(
        &mut self,
        peers: &[PeerId],
        bytes: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let id = self.id.clone();
        let mut result = Ok(());
        self.update(|registry, notices| {
            if registry.nodes.get(&id).is_some_and(|node| node.fail_sends) {
                result = Err(TransportError::Rejected("simulated failure".into()));
                return;
            }
            let mut reached = 0;
            for peer in peers {
                if !registry.linked(&id, peer) {
                    continue;
                }
                if let Some(observers) = registry.observers(peer) {
                    notices.push(Notice::Data(observers, id.clone(), bytes.clone()));
                    reached += 1;
                }
            }
            if reached == 0 {
                result = Err(TransportError::NoRecipients);
            }
        });
        futures::future::ready(result).boxed()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.vanish(&self.id);
        self.network.lock().nodes.remove(&self.id);
    }
}
