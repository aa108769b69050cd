//! Concrete transports.
//!
//! [`Libp2pTransport`] runs the core over a real local network;
//! [`MemoryNetwork`] is an in-process segment for tests and demos.

pub mod behavior;
pub mod client;
pub mod memory;
pub mod transport;

use std::error::Error;

use futures::FutureExt;
use futures::future::BoxFuture;
use libp2p::{Multiaddr, identity};
use tokio::sync::{mpsc, oneshot};

use crate::common::{DiscoveryRole, PeerId};
use crate::config::ChatConfig;
use crate::error::{ConfigError, TransportError};
use crate::transport::{LocalPeer, Observers, Transport};

pub use client::{SwarmCommand, SwarmDriver};
pub use memory::{MemoryNetwork, MemoryTransport};

pub type BoxError = Box<dyn Error + Send + Sync>;

/// mDNS discovery, gossipsub broadcast and TCP + noise + yamux links.
pub struct Libp2pTransport {
    local_key: identity::Keypair,
    listen_addr: Multiaddr,
    commands: Option<mpsc::UnboundedSender<SwarmCommand>>,
}

impl Libp2pTransport {
    pub fn new(config: &ChatConfig) -> Result<Self, ConfigError> {
        let listen_addr =
            config
                .listen_addr
                .parse::<Multiaddr>()
                .map_err(|err| ConfigError::InvalidListenAddr {
                    address: config.listen_addr.clone(),
                    reason: err.to_string(),
                })?;
        Ok(Self {
            local_key: identity::Keypair::generate_ed25519(),
            listen_addr,
            commands: None,
        })
    }

    pub fn local_peer_id(&self) -> libp2p::PeerId {
        libp2p::PeerId::from(self.local_key.public())
    }

    fn spawn_driver(
        &self,
        local: &LocalPeer,
        observers: Observers,
    ) -> Result<mpsc::UnboundedSender<SwarmCommand>, BoxError> {
        let (behavior, topic) = behavior::build_behavior(&self.local_key, local)?;
        let swarm = transport::build_swarm(&self.local_key, behavior)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let driver = SwarmDriver::new(
            swarm,
            topic,
            behavior::service_protocol(local),
            self.listen_addr.clone(),
            observers,
            command_rx,
            command_tx.downgrade(),
        );
        tokio::spawn(driver.run());
        Ok(command_tx)
    }

    fn command(&self, command: SwarmCommand) -> Result<(), TransportError> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| TransportError::Unavailable("swarm not running".into()))?;
        commands.send(command).map_err(|_| TransportError::Closed)
    }

    fn command_quietly(&self, command: SwarmCommand) {
        if let Err(err) = self.command(command) {
            log::debug!("Swarm command dropped: {err}");
        }
    }
}

impl Transport for Libp2pTransport {
    fn bind(&mut self, local: &LocalPeer, observers: Observers) {
        match self.spawn_driver(local, observers.clone()) {
            Ok(commands) => self.commands = Some(commands),
            Err(err) => {
                log::error!("Failed to start libp2p swarm: {err}");
                observers
                    .discovery
                    .discovery_failed(DiscoveryRole::Advertise, err.to_string());
                observers
                    .discovery
                    .discovery_failed(DiscoveryRole::Browse, err.to_string());
            }
        }
    }

    fn start_advertising(&mut self) -> Result<(), TransportError> {
        self.command(SwarmCommand::StartAdvertising)
    }

    fn stop_advertising(&mut self) {
        self.command_quietly(SwarmCommand::StopAdvertising);
    }

    fn start_browsing(&mut self) -> Result<(), TransportError> {
        self.command(SwarmCommand::StartBrowsing)
    }

    fn stop_browsing(&mut self) {
        self.command_quietly(SwarmCommand::StopBrowsing);
    }

    fn invite(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let peer = to_libp2p(peer)?;
        self.command(SwarmCommand::Invite(peer))
    }

    fn disconnect(&mut self, peer: &PeerId) {
        match to_libp2p(peer) {
            Ok(peer) => self.command_quietly(SwarmCommand::Disconnect(peer)),
            Err(err) => log::debug!("Cannot disconnect: {err}"),
        }
    }

    fn send(
        &mut self,
        peers: &[PeerId],
        bytes: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let peers: Vec<libp2p::PeerId> = peers
            .iter()
            .filter_map(|peer| to_libp2p(peer).ok())
            .collect();
        let (done, outcome) = oneshot::channel();
        let queued = self.command(SwarmCommand::Publish { peers, bytes, done });
        async move {
            queued?;
            outcome.await.unwrap_or(Err(TransportError::Closed))
        }
        .boxed()
    }
}

fn to_libp2p(peer: &PeerId) -> Result<libp2p::PeerId, TransportError> {
    peer.as_str()
        .parse()
        .map_err(|_| TransportError::NotConnected(peer.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_listen_address_is_a_config_error() {
        let config = ChatConfig {
            listen_addr: "not a multiaddr".into(),
            ..ChatConfig::default()
        };
        assert!(matches!(
            Libp2pTransport::new(&config),
            Err(ConfigError::InvalidListenAddr { .. })
        ));
    }

    #[test]
    fn commands_before_bind_are_unavailable() {
        let mut transport = Libp2pTransport::new(&ChatConfig::default()).unwrap();
        assert!(matches!(
            transport.start_advertising(),
            Err(TransportError::Unavailable(_))
        ));
    }

    #[test]
    fn peer_ids_round_trip_through_core_ids() {
        let transport = Libp2pTransport::new(&ChatConfig::default()).unwrap();
        let id = transport.local_peer_id();
        assert_eq!(to_libp2p(&client::to_core(&id)).unwrap(), id);
        assert!(to_libp2p(&PeerId::from("peer-1")).is_err());
    }
}
