//! Event loop owning the libp2p swarm.
//!
//! Maps swarm events onto the observer callbacks:
//! - mDNS discovery, while browsing, dials the peer.
//! - identify with our service protocol reports `peer_found`; anything else
//!   is disconnected.
//! - a remote subscription to the service topic completes the handshake when
//!   we invited the peer, and is an inbound invitation otherwise.
//! - topic messages from joined peers are `data_received`.
//!
//! Every node subscribes to the topic when the swarm is built, so an inviter
//! joins before the invitee has answered. Consent is only enforced on the
//! receiving side: a peer that declines drops our packets until its rejection
//! closes the connection.

use std::collections::{HashMap, HashSet};

use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::swarm::SwarmEvent;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::{Multiaddr, PeerId, Swarm, identify, mdns};
use tokio::sync::{mpsc, oneshot};

use crate::common::{self, ConnectionState, DiscoveryRole, InvitationResponder};
use crate::config::normalize_display_name;
use crate::error::TransportError;
use crate::transport::Observers;

use super::behavior::{ChatBehavior, ChatBehaviorEvent};

#[derive(Debug)]
pub enum SwarmCommand {
    StartAdvertising,
    StopAdvertising,
    StartBrowsing,
    StopBrowsing,
    Invite(PeerId),
    Answer { peer: PeerId, accept: bool },
    Disconnect(PeerId),
    Publish {
        peers: Vec<PeerId>,
        bytes: Vec<u8>,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
}

pub struct SwarmDriver {
    swarm: Swarm<ChatBehavior>,
    topic: IdentTopic,
    protocol: String,
    listen_addr: Multiaddr,
    observers: Observers,
    commands: mpsc::UnboundedReceiver<SwarmCommand>,
    /// Lets invitation responders answer through our own queue without
    /// keeping the driver alive.
    answers: mpsc::WeakUnboundedSender<SwarmCommand>,
    listener: Option<ListenerId>,
    browsing: bool,
    /// Peers reported through `peer_found`, with their display names.
    identified: HashMap<PeerId, String>,
    invited: HashSet<PeerId>,
    joined: HashSet<PeerId>,
}

impl SwarmDriver {
    pub fn new(
        swarm: Swarm<ChatBehavior>,
        topic: IdentTopic,
        protocol: String,
        listen_addr: Multiaddr,
        observers: Observers,
        commands: mpsc::UnboundedReceiver<SwarmCommand>,
        answers: mpsc::WeakUnboundedSender<SwarmCommand>,
    ) -> Self {
        Self {
            swarm,
            topic,
            protocol,
            listen_addr,
            observers,
            commands,
            answers,
            listener: None,
            browsing: false,
            identified: HashMap::new(),
            invited: HashSet::new(),
            joined: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        log::info!("Local PeerID: {}", self.swarm.local_peer_id());
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }
        log::info!("Network event loop stopped");
    }

    fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::StartAdvertising => {
                if self.listener.is_some() {
                    return;
                }
                match self.swarm.listen_on(self.listen_addr.clone()) {
                    Ok(id) => self.listener = Some(id),
                    Err(err) => self
                        .observers
                        .discovery
                        .discovery_failed(DiscoveryRole::Advertise, err.to_string()),
                }
            }
            SwarmCommand::StopAdvertising => {
                if let Some(id) = self.listener.take() {
                    self.swarm.remove_listener(id);
                }
            }
            SwarmCommand::StartBrowsing => {
                self.browsing = true;
                let known: Vec<PeerId> = self
                    .swarm
                    .behaviour()
                    .mdns
                    .discovered_nodes()
                    .copied()
                    .collect();
                for peer in known {
                    self.dial(peer);
                }
            }
            SwarmCommand::StopBrowsing => self.browsing = false,
            SwarmCommand::Invite(peer) => self.invite(peer),
            SwarmCommand::Answer { peer, accept } => self.answer(peer, accept),
            SwarmCommand::Disconnect(peer) => {
                self.invited.remove(&peer);
                self.joined.remove(&peer);
                self.swarm
                    .behaviour_mut()
                    .gossipsub
                    .remove_explicit_peer(&peer);
                let _ = self.swarm.disconnect_peer_id(peer);
            }
            SwarmCommand::Publish { peers, bytes, done } => {
                let _ = done.send(self.publish(&peers, bytes));
            }
        }
    }

    fn dial(&mut self, peer: PeerId) {
        let opts = DialOpts::peer_id(peer)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .build();
        if let Err(err) = self.swarm.dial(opts) {
            log::debug!("Not dialing {peer}: {err}");
        }
    }

    fn invite(&mut self, peer: PeerId) {
        self.invited.insert(peer);
        self.swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer);
        // The remote subscription may already be known.
        let topic = self.topic.hash();
        let subscribed = self
            .swarm
            .behaviour()
            .gossipsub
            .all_peers()
            .any(|(candidate, topics)| *candidate == peer && topics.contains(&&topic));
        if subscribed {
            self.join(peer);
        }
    }

    fn answer(&mut self, peer: PeerId, accept: bool) {
        if accept {
            self.swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer);
            self.join(peer);
        } else {
            log::info!("Invitation from {peer} declined");
            let _ = self.swarm.disconnect_peer_id(peer);
            self.observers
                .session
                .session_state_changed(to_core(&peer), ConnectionState::NotConnected);
        }
    }

    fn join(&mut self, peer: PeerId) {
        if self.joined.insert(peer) {
            self.observers
                .session
                .session_state_changed(to_core(&peer), ConnectionState::Connected);
        }
    }

    fn leave(&mut self, peer: &PeerId) {
        let was_invited = self.invited.remove(peer);
        if self.joined.remove(peer) || was_invited {
            self.observers
                .session
                .session_state_changed(to_core(peer), ConnectionState::NotConnected);
        }
    }

    fn publish(&mut self, peers: &[PeerId], bytes: Vec<u8>) -> Result<(), TransportError> {
        if !peers.iter().any(|peer| self.joined.contains(peer)) {
            return Err(TransportError::NoRecipients);
        }
        self.swarm
            .behaviour_mut()
            .gossipsub
            .publish(self.topic.clone(), bytes)
            .map(|_| ())
            .map_err(|err| TransportError::Rejected(err.to_string()))
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<ChatBehaviorEvent>) {
        match event {
            SwarmEvent::Behaviour(ChatBehaviorEvent::Mdns(mdns::Event::Discovered(list))) => {
                if !self.browsing {
                    return;
                }
                for (peer, address) in list {
                    log::debug!("mDNS found {peer} at {address}");
                    self.dial(peer);
                }
            }
            SwarmEvent::Behaviour(ChatBehaviorEvent::Mdns(mdns::Event::Expired(list))) => {
                for (peer, _) in list {
                    if self.identified.remove(&peer).is_some() {
                        self.invited.remove(&peer);
                        self.joined.remove(&peer);
                        self.observers.discovery.peer_lost(to_core(&peer));
                    }
                }
            }
            SwarmEvent::Behaviour(ChatBehaviorEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => self.on_identified(peer_id, info),
            SwarmEvent::Behaviour(ChatBehaviorEvent::Gossipsub(gossipsub::Event::Subscribed {
                peer_id,
                topic,
            })) if topic == self.topic.hash() => self.on_subscribed(peer_id),
            SwarmEvent::Behaviour(ChatBehaviorEvent::Gossipsub(
                gossipsub::Event::Unsubscribed { peer_id, topic },
            )) if topic == self.topic.hash() => self.leave(&peer_id),
            SwarmEvent::Behaviour(ChatBehaviorEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let source = message.source.unwrap_or(propagation_source);
                if self.joined.contains(&source) {
                    self.observers
                        .session
                        .data_received(to_core(&source), message.data);
                } else {
                    log::debug!("Dropping message from {source}: not joined");
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established: 0,
                ..
            } => self.leave(&peer_id),
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                log::debug!("Dial to {peer_id} failed: {error}");
                self.leave(&peer_id);
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                log::info!("Listening on {address}");
            }
            _ => {}
        }
    }

    fn on_identified(&mut self, peer: PeerId, info: identify::Info) {
        if info.protocol_version != self.protocol {
            log::debug!(
                "{peer} speaks {} instead of {}; disconnecting",
                info.protocol_version,
                self.protocol
            );
            let _ = self.swarm.disconnect_peer_id(peer);
            return;
        }
        let name = normalize_display_name(&info.agent_version).unwrap_or_else(|_| peer.to_string());
        self.identified.insert(peer, name.clone());
        self.observers.discovery.peer_found(to_core(&peer), name);
    }

    fn on_subscribed(&mut self, peer: PeerId) {
        if self.joined.contains(&peer) {
            return;
        }
        if self.invited.contains(&peer) {
            self.join(peer);
            return;
        }
        let name = self
            .identified
            .get(&peer)
            .cloned()
            .unwrap_or_else(|| peer.to_string());
        let answers = self.answers.clone();
        let responder = InvitationResponder::new(move |accept| {
            if let Some(answers) = answers.upgrade() {
                let _ = answers.send(SwarmCommand::Answer { peer, accept });
            }
        });
        self.observers
            .discovery
            .invitation_received(to_core(&peer), name, responder);
    }
}

pub fn to_core(peer: &PeerId) -> common::PeerId {
    common::PeerId::new(peer.to_string())
}
