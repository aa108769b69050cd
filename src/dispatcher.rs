//! Outgoing message lifecycle: Sending -> Sent | Failed.
//!
//! Transmission runs on its own task so the owner keeps handling peer
//! events while a send is in flight. The task reports back through a
//! [`SendCompletion`], which the owner feeds into [`MessageDispatcher::complete`].

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::codec::{self, Packet};
use crate::common::{ChatMessage, PeerId};
use crate::error::{SendError, TransportError};
use crate::transport::Transport;

/// What became of a `send_message` call.
#[derive(Debug)]
pub enum SendOutcome {
    /// Nothing but whitespace; no message was created.
    Skipped,
    Sent(ChatMessage),
    Failed {
        message: ChatMessage,
        error: SendError,
    },
}

impl SendOutcome {
    pub fn message(&self) -> Option<&ChatMessage> {
        match self {
            SendOutcome::Skipped => None,
            SendOutcome::Sent(message) | SendOutcome::Failed { message, .. } => Some(message),
        }
    }

    pub fn error(&self) -> Option<&SendError> {
        match self {
            SendOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent(_))
    }
}

#[derive(Debug)]
pub struct SendCompletion {
    id: Uuid,
    result: Result<(), TransportError>,
}

struct PendingSend {
    message: ChatMessage,
    reply: oneshot::Sender<SendOutcome>,
}

pub struct MessageDispatcher {
    completions: mpsc::UnboundedSender<SendCompletion>,
    pending: HashMap<Uuid, PendingSend>,
}

impl MessageDispatcher {
    pub fn new(completions: mpsc::UnboundedSender<SendCompletion>) -> Self {
        Self {
            completions,
            pending: HashMap::new(),
        }
    }

    /// Trim `text` and build a message in `Sending`, or `None` when nothing is
    /// left.
    pub fn compose(text: &str) -> Option<ChatMessage> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(ChatMessage::outgoing(text))
    }

    /// Hand `message` to the transport for every peer in `recipients`.
    ///
    /// Failures known up front settle the message right away; the settled
    /// copy is returned and `reply` has been answered. Otherwise the send is
    /// in flight and `None` is returned.
    pub fn dispatch(
        &mut self,
        mut message: ChatMessage,
        session_open: bool,
        recipients: &[PeerId],
        transport: &mut dyn Transport,
        reply: oneshot::Sender<SendOutcome>,
    ) -> Option<ChatMessage> {
        let early = if !session_open {
            Some(SendError::NoSession)
        } else if recipients.is_empty() {
            Some(SendError::NoPeers)
        } else {
            None
        };
        if let Some(error) = early {
            return Some(fail_now(&mut message, error, reply));
        }

        let bytes = match codec::encode(&Packet::Message(message.clone())) {
            Ok(bytes) => bytes,
            Err(err) => return Some(fail_now(&mut message, err.into(), reply)),
        };

        log::debug!(
            "Sending message {} to {} peer(s)",
            message.id,
            recipients.len()
        );
        let transmission = transport.send(recipients, bytes);
        let completions = self.completions.clone();
        let id = message.id;
        tokio::spawn(async move {
            let result = transmission.await;
            let _ = completions.send(SendCompletion { id, result });
        });
        self.pending.insert(id, PendingSend { message, reply });
        None
    }

    /// Settle an in-flight send. Returns the settled message, or `None` for a
    /// completion nobody is waiting on.
    pub fn complete(&mut self, completion: SendCompletion) -> Option<ChatMessage> {
        let Some(PendingSend { mut message, reply }) = self.pending.remove(&completion.id) else {
            log::debug!("Ignoring completion for unknown message {}", completion.id);
            return None;
        };
        let outcome = match completion.result {
            Ok(()) => {
                message.mark_sent();
                SendOutcome::Sent(message.clone())
            }
            Err(err) => {
                log::warn!("Message {} failed: {err}", message.id);
                message.mark_failed();
                SendOutcome::Failed {
                    message: message.clone(),
                    error: SendError::TransmitFailure(err),
                }
            }
        };
        let _ = reply.send(outcome);
        Some(message)
    }

    /// Fail everything still in flight with `NoSession`. Used on shutdown.
    pub fn abort_all(&mut self) -> Vec<ChatMessage> {
        self.pending
            .drain()
            .map(|(_, PendingSend { mut message, reply })| {
                fail_now(&mut message, SendError::NoSession, reply);
                message
            })
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

fn fail_now(
    message: &mut ChatMessage,
    error: SendError,
    reply: oneshot::Sender<SendOutcome>,
) -> ChatMessage {
    log::warn!("Message {} failed: {error}", message.id);
    message.mark_failed();
    let settled = message.clone();
    let _ = reply.send(SendOutcome::Failed {
        message: settled.clone(),
        error,
    });
    settled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DeliveryStatus, Direction};
    use crate::transport::testing::RecordingTransport;

    fn dispatcher() -> (MessageDispatcher, mpsc::UnboundedReceiver<SendCompletion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MessageDispatcher::new(tx), rx)
    }

    #[test]
    fn compose_trims_and_skips_blank_text() {
        assert!(MessageDispatcher::compose("  \n\t ").is_none());
        let message = MessageDispatcher::compose("  hi there ").unwrap();
        assert_eq!(message.text, "hi there");
        assert_eq!(message.direction, Direction::Outgoing);
        assert_eq!(message.delivery_status, DeliveryStatus::Sending);
    }

    #[tokio::test]
    async fn send_without_session_fails_before_touching_transport() {
        let (mut dispatcher, _rx) = dispatcher();
        let mut transport = RecordingTransport::default();
        let (reply, outcome) = oneshot::channel();
        let message = MessageDispatcher::compose("x").unwrap();

        let settled = dispatcher
            .dispatch(message, false, &[PeerId::from("bob")], &mut transport, reply)
            .unwrap();
        assert_eq!(settled.delivery_status, DeliveryStatus::Failed);
        assert!(matches!(
            outcome.await.unwrap().error(),
            Some(SendError::NoSession)
        ));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn send_with_nobody_connected_fails_with_no_peers() {
        let (mut dispatcher, _rx) = dispatcher();
        let mut transport = RecordingTransport::default();
        let (reply, outcome) = oneshot::channel();
        let message = MessageDispatcher::compose("x").unwrap();

        assert!(
            dispatcher
                .dispatch(message, true, &[], &mut transport, reply)
                .is_some()
        );
        assert!(matches!(
            outcome.await.unwrap().error(),
            Some(SendError::NoPeers)
        ));
        assert!(transport.sends().is_empty());
    }

    #[tokio::test]
    async fn successful_transmission_marks_sent() {
        let (mut dispatcher, mut completions) = dispatcher();
        let mut transport = RecordingTransport::default();
        let (reply, outcome) = oneshot::channel();
        let message = MessageDispatcher::compose("hi").unwrap();
        let peers = [PeerId::from("bob"), PeerId::from("carol")];

        assert!(
            dispatcher
                .dispatch(message, true, &peers, &mut transport, reply)
                .is_none()
        );
        assert_eq!(dispatcher.in_flight(), 1);
        let sends = transport.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, peers);

        let settled = dispatcher.complete(completions.recv().await.unwrap()).unwrap();
        assert_eq!(settled.delivery_status, DeliveryStatus::Sent);
        assert!(outcome.await.unwrap().is_sent());
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn transport_rejection_marks_failed() {
        let (mut dispatcher, mut completions) = dispatcher();
        let mut transport = RecordingTransport::default();
        *transport.send_result.lock().unwrap() = Some(TransportError::Rejected("busy".into()));
        let (reply, outcome) = oneshot::channel();
        let message = MessageDispatcher::compose("hi").unwrap();

        dispatcher.dispatch(message, true, &[PeerId::from("bob")], &mut transport, reply);
        let settled = dispatcher.complete(completions.recv().await.unwrap()).unwrap();
        assert_eq!(settled.delivery_status, DeliveryStatus::Failed);
        assert!(matches!(
            outcome.await.unwrap().error(),
            Some(SendError::TransmitFailure(TransportError::Rejected(_)))
        ));
    }

    #[tokio::test]
    async fn abort_all_fails_in_flight_sends() {
        let (mut dispatcher, _completions) = dispatcher();
        let mut transport = RecordingTransport::default();
        let (reply, outcome) = oneshot::channel();
        let message = MessageDispatcher::compose("late").unwrap();
        dispatcher.dispatch(message, true, &[PeerId::from("bob")], &mut transport, reply);

        let aborted = dispatcher.abort_all();
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].delivery_status, DeliveryStatus::Failed);
        assert!(matches!(
            outcome.await.unwrap().error(),
            Some(SendError::NoSession)
        ));
    }
}
