use std::time::Duration;

use libp2p::core::upgrade::Version;
use libp2p::swarm::Config as SwarmConfig;
use libp2p::{PeerId, Swarm, Transport, identity, noise, tcp, yamux};

use super::BoxError;
use super::behavior::ChatBehavior;

/// How long a link with no open streams stays up. Joined peers keep gossipsub
/// streams open, so this only reaps links to foreign or declined peers.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP with noise encryption and yamux multiplexing, wrapped around `behavior`.
pub fn build_swarm(
    local_key: &identity::Keypair,
    behavior: ChatBehavior,
) -> Result<Swarm<ChatBehavior>, BoxError> {
    let local_peer_id = PeerId::from(local_key.public());
    let noise_config = noise::Config::new(local_key)?;

    let link = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .upgrade(Version::V1)
        .authenticate(noise_config)
        .multiplex(yamux::Config::default())
        .boxed();

    Ok(Swarm::new(
        link,
        behavior,
        local_peer_id,
        SwarmConfig::with_tokio_executor().with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT),
    ))
}
