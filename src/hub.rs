//! Fan-out of core events to any number of consumers.
//!
//! Every sequence is a `tokio::sync::broadcast` channel: producers never wait,
//! a consumer that falls more than `capacity` events behind skips ahead, and a
//! new subscriber only sees events published after it subscribed.

use std::sync::{Arc, Mutex, PoisonError};

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::common::{ChatMessage, PeerRecord, TypingSignal};

pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// One multi-consumer sequence.
pub struct Channel<T> {
    name: &'static str,
    capacity: usize,
    sender: Mutex<Option<broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> Channel<T> {
    fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name,
            capacity,
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = match guard.as_ref() {
            Some(sender) => sender.subscribe(),
            // Already closed: hand out a receiver that ends immediately.
            None => broadcast::channel(self.capacity).1,
        };
        Subscription {
            name: self.name,
            receiver,
        }
    }

    /// Returns the number of consumers that will see `value`. Publishing into
    /// a closed sequence, or one nobody listens to, is a no-op.
    pub(crate) fn publish(&self, value: T) -> usize {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(sender) => sender.send(value).unwrap_or(0),
            None => 0,
        }
    }

    /// Consumers drain what is buffered, then see the end of the sequence.
    pub(crate) fn close(&self) {
        let mut guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            log::debug!("Closed {} sequence", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Consumer end of a [`Channel`].
pub struct Subscription<T> {
    name: &'static str,
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Next event, or `None` once the sequence is closed and drained.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("{} consumer lagged; skipped {skipped} events", self.name);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered event, without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(value) => return Some(value),
                Err(TryRecvError::Lagged(skipped)) => {
                    log::warn!("{} consumer lagged; skipped {skipped} events", self.name);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            let value = subscription.next().await?;
            Some((value, subscription))
        })
    }
}

struct Channels {
    peers: Channel<Vec<PeerRecord>>,
    messages: Channel<ChatMessage>,
    typing: Channel<TypingSignal>,
    outgoing: Channel<ChatMessage>,
}

/// The event sequences the core exposes upward. Cloning shares the same
/// sequences; only the owner task publishes.
#[derive(Clone)]
pub struct EventHub {
    channels: Arc<Channels>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Channels {
                peers: Channel::new("peer snapshot", capacity),
                messages: Channel::new("incoming message", capacity),
                typing: Channel::new("typing signal", capacity),
                outgoing: Channel::new("outgoing message", capacity),
            }),
        }
    }

    /// Full peer list after every discovery or session change.
    pub fn peers(&self) -> &Channel<Vec<PeerRecord>> {
        &self.channels.peers
    }

    pub fn messages(&self) -> &Channel<ChatMessage> {
        &self.channels.messages
    }

    pub fn typing(&self) -> &Channel<TypingSignal> {
        &self.channels.typing
    }

    /// Local messages, once when created and once when settled.
    pub fn outgoing(&self) -> &Channel<ChatMessage> {
        &self.channels.outgoing
    }

    pub(crate) fn close(&self) {
        self.channels.peers.close();
        self.channels.messages.close();
        self.channels.typing.close();
        self.channels.outgoing.close();
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::common::{TypingKind, TypingSignal};

    fn signal(name: &str) -> TypingSignal {
        TypingSignal::new(TypingKind::Start, name)
    }

    #[tokio::test]
    async fn every_consumer_sees_events_in_order() {
        let hub = EventHub::new(8);
        let mut first = hub.typing().subscribe();
        let mut second = hub.typing().subscribe();

        assert_eq!(hub.typing().publish(signal("a")), 2);
        hub.typing().publish(signal("b"));

        for subscription in [&mut first, &mut second] {
            assert_eq!(subscription.next().await.unwrap().peer_display_name, "a");
            assert_eq!(subscription.next().await.unwrap().peer_display_name, "b");
        }
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_replay() {
        let hub = EventHub::new(8);
        let _early = hub.typing().subscribe();
        hub.typing().publish(signal("before"));

        let mut late = hub.typing().subscribe();
        assert!(late.try_next().is_none());
        hub.typing().publish(signal("after"));
        assert_eq!(late.next().await.unwrap().peer_display_name, "after");
    }

    #[tokio::test]
    async fn publishing_without_consumers_does_not_block() {
        let hub = EventHub::new(1);
        for _ in 0..100 {
            assert_eq!(hub.typing().publish(signal("x")), 0);
        }
    }

    #[tokio::test]
    async fn slow_consumer_skips_ahead() {
        let hub = EventHub::new(2);
        let mut slow = hub.typing().subscribe();
        for name in ["1", "2", "3", "4"] {
            hub.typing().publish(signal(name));
        }
        assert_eq!(slow.next().await.unwrap().peer_display_name, "3");
        assert_eq!(slow.next().await.unwrap().peer_display_name, "4");
    }

    #[tokio::test]
    async fn close_drains_then_ends_and_later_publishes_are_ignored() {
        let hub = EventHub::new(8);
        let mut subscription = hub.typing().subscribe();
        hub.typing().publish(signal("last"));
        hub.close();

        assert_eq!(hub.typing().publish(signal("ignored")), 0);
        assert!(hub.typing().is_closed());
        assert_eq!(subscription.next().await.unwrap().peer_display_name, "last");
        assert!(subscription.next().await.is_none());

        let mut after_close = hub.typing().subscribe();
        assert!(after_close.next().await.is_none());
    }

    #[tokio::test]
    async fn sequences_are_independent() {
        let hub = EventHub::new(8);
        let messages = hub.messages().subscribe();
        let mut typing = hub.typing().subscribe();
        hub.typing().publish(signal("a"));

        let mut stream = Box::pin(messages.into_stream());
        assert_eq!(typing.next().await.unwrap().peer_display_name, "a");
        hub.close();
        assert!(stream.next().await.is_none());
    }
}
