use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use libp2p::gossipsub::{self, IdentTopic};
use libp2p::swarm::NetworkBehaviour;
use libp2p::{PeerId, identify, identity, mdns};

use crate::transport::LocalPeer;

use super::BoxError;

#[derive(NetworkBehaviour)]
pub struct ChatBehavior {
    /// Broadcast of envelopes to every joined peer.
    pub gossipsub: gossipsub::Behaviour,
    /// Advertise and browse on the local segment.
    pub mdns: mdns::tokio::Behaviour,
    /// Display name and service scope of the remote end.
    pub identify: identify::Behaviour,
}

/// Identify protocol string. Peers announcing anything else belong to another
/// application.
pub fn service_protocol(local: &LocalPeer) -> String {
    format!("/{}/1.0.0", local.service)
}

pub fn build_behavior(
    local_key: &identity::Keypair,
    local: &LocalPeer,
) -> Result<(ChatBehavior, IdentTopic), BoxError> {
    let local_peer_id = PeerId::from(local_key.public());

    // Envelopes carry a UUID or a timestamp, so identical bytes really are a
    // duplicate.
    let message_id_fn = |message: &gossipsub::Message| {
        let mut hasher = DefaultHasher::new();
        message.data.hash(&mut hasher);
        gossipsub::MessageId::from(hasher.finish().to_string())
    };

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(1))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .message_id_fn(message_id_fn)
        .build()?;

    let mut gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(local_key.clone()),
        gossipsub_config,
    )?;

    let topic = IdentTopic::new(local.service.as_str());
    gossipsub.subscribe(&topic)?;

    let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?;

    let identify = identify::Behaviour::new(
        identify::Config::new(service_protocol(local), local_key.public())
            .with_agent_version(local.display_name.clone()),
    );

    Ok((
        ChatBehavior {
            gossipsub,
            mdns,
            identify,
        },
        topic,
    ))
}
