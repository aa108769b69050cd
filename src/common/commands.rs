use tokio::sync::oneshot;

use super::types::PeerRecord;
use crate::dispatcher::SendOutcome;

/// Requests from the public handle to the owner task.
#[derive(Debug)]
pub enum ServiceCommand {
    StartDiscovery {
        done: oneshot::Sender<()>,
    },
    StopDiscovery {
        done: oneshot::Sender<()>,
    },
    SendMessage {
        text: String,
        reply: oneshot::Sender<SendOutcome>,
    },
    TypingActivity,
    TypingStopped,
    Snapshot {
        reply: oneshot::Sender<Vec<PeerRecord>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}
