//! Typing presence.
//!
//! [`TypingCoordinator`] turns raw keystroke activity into at most one Start
//! per burst and exactly one Stop after it. [`RemoteTypingIndicator`] tracks
//! which peer is shown as typing.
//!
//! Timers are spawned tasks that report back through a channel; the owner
//! feeds the report into `on_timer`. Each timer carries a generation number so
//! a report from a timer that was cancelled after it fired is ignored.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::common::{TypingKind, TypingSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingConfig {
    /// Delay before the first Start of a burst.
    pub debounce: Duration,
    /// Quiet period after which local typing counts as stopped.
    pub inactivity: Duration,
    /// Lifetime of a remote Start that is never followed by a Stop.
    pub remote_expiry: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            inactivity: Duration::from_secs(3),
            remote_expiry: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingState {
    Idle,
    PendingStart,
    ActiveTyping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Debounce,
    Inactivity,
    RemoteExpiry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    generation: u64,
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl Timer {
    fn schedule(
        kind: TimerKind,
        generation: u64,
        delay: Duration,
        fired: &mpsc::UnboundedSender<TimerFired>,
    ) -> Self {
        let fired = fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(TimerFired { kind, generation });
        });
        Self { generation, handle }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Local typing state machine: Idle -> PendingStart -> ActiveTyping -> Idle.
pub struct TypingCoordinator {
    config: TypingConfig,
    state: TypingState,
    generation: u64,
    debounce: Option<Timer>,
    inactivity: Option<Timer>,
    fired: mpsc::UnboundedSender<TimerFired>,
}

impl TypingCoordinator {
    pub fn new(config: TypingConfig, fired: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            config,
            state: TypingState::Idle,
            generation: 0,
            debounce: None,
            inactivity: None,
            fired,
        }
    }

    pub fn state(&self) -> TypingState {
        self.state
    }

    /// The user pressed a key. Never emits directly: Start comes from the
    /// debounce timer.
    pub fn notify_activity(&mut self) {
        match self.state {
            TypingState::Idle => {
                self.cancel_timers();
                self.debounce = Some(self.schedule(TimerKind::Debounce, self.config.debounce));
                self.state = TypingState::PendingStart;
            }
            // The running window already covers this keystroke.
            TypingState::PendingStart => {}
            TypingState::ActiveTyping => {
                self.inactivity =
                    Some(self.schedule(TimerKind::Inactivity, self.config.inactivity));
            }
        }
    }

    /// Explicit stop (message sent, discovery stopped). Emits Stop only if a
    /// Start went out.
    pub fn notify_stopped(&mut self) -> Option<TypingKind> {
        self.cancel_timers();
        let was_active = self.state == TypingState::ActiveTyping;
        self.state = TypingState::Idle;
        was_active.then_some(TypingKind::Stop)
    }

    pub fn on_timer(&mut self, fired: TimerFired) -> Option<TypingKind> {
        match (fired.kind, self.state) {
            (TimerKind::Debounce, TypingState::PendingStart)
                if is_current(&self.debounce, fired) =>
            {
                self.debounce = None;
                self.state = TypingState::ActiveTyping;
                self.inactivity =
                    Some(self.schedule(TimerKind::Inactivity, self.config.inactivity));
                Some(TypingKind::Start)
            }
            (TimerKind::Inactivity, TypingState::ActiveTyping)
                if is_current(&self.inactivity, fired) =>
            {
                self.notify_stopped()
            }
            _ => {
                log::debug!("Ignoring stale {:?} timer", fired.kind);
                None
            }
        }
    }

    pub fn cancel_timers(&mut self) {
        self.debounce = None;
        self.inactivity = None;
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration) -> Timer {
        self.generation += 1;
        Timer::schedule(kind, self.generation, delay, &self.fired)
    }
}

fn is_current(timer: &Option<Timer>, fired: TimerFired) -> bool {
    timer
        .as_ref()
        .is_some_and(|timer| timer.generation == fired.generation)
}

/// "Peer X is typing" as shown to the user.
///
/// A Start shows its sender. A Stop clears the indicator only when it comes
/// from the peer currently shown, so a late Stop from someone else cannot wipe
/// a newer Start.
pub struct RemoteTypingIndicator {
    current: watch::Sender<Option<String>>,
    expiry_after: Duration,
    expiry: Option<Timer>,
    generation: u64,
    fired: mpsc::UnboundedSender<TimerFired>,
}

impl RemoteTypingIndicator {
    pub fn new(expiry_after: Duration, fired: mpsc::UnboundedSender<TimerFired>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            current,
            expiry_after,
            expiry: None,
            generation: 0,
            fired,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.current.subscribe()
    }

    pub fn current(&self) -> Option<String> {
        self.current.borrow().clone()
    }

    /// Returns true when the displayed typer changed.
    pub fn apply(&mut self, signal: &TypingSignal) -> bool {
        match signal.kind {
            TypingKind::Start => {
                self.generation += 1;
                self.expiry = Some(Timer::schedule(
                    TimerKind::RemoteExpiry,
                    self.generation,
                    self.expiry_after,
                    &self.fired,
                ));
                let name = signal.peer_display_name.clone();
                log::debug!("'{name}' started typing");
                self.current.send_if_modified(|current| {
                    let changed = current.as_deref() != Some(name.as_str());
                    *current = Some(name);
                    changed
                })
            }
            TypingKind::Stop => {
                if self.current.borrow().as_deref() != Some(signal.peer_display_name.as_str()) {
                    return false;
                }
                log::debug!("'{}' stopped typing", signal.peer_display_name);
                self.clear()
            }
        }
    }

    pub fn on_timer(&mut self, fired: TimerFired) -> bool {
        if fired.kind != TimerKind::RemoteExpiry || !is_current(&self.expiry, fired) {
            return false;
        }
        log::debug!("Typing indicator expired");
        self.clear()
    }

    pub fn clear(&mut self) -> bool {
        self.expiry = None;
        self.current.send_if_modified(|current| current.take().is_some())
    }
}
