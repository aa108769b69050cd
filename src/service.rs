//! The serialized owner of all chat state, and the handle the outside world
//! talks to it through.
//!
//! [`ChatService::spawn`] moves the transport and every core component onto a
//! single task. Commands from the handle, transport callbacks, timer reports
//! and send completions all arrive on channels and are handled one at a time,
//! so the peer map never sees concurrent edits.

use tokio::sync::{mpsc, oneshot, watch};

use crate::codec::{self, Packet};
use crate::common::{
    ChatMessage, PeerId, PeerRecord, ServiceCommand, TransportEvent, TypingKind, TypingSignal,
};
use crate::config::ChatConfig;
use crate::discovery::{DiscoveryEngine, DiscoveryPolicy};
use crate::dispatcher::{MessageDispatcher, SendCompletion, SendOutcome};
use crate::error::{ConfigError, ServiceError};
use crate::hub::{EventHub, Subscription};
use crate::session::SessionManager;
use crate::transport::{EventSink, LocalPeer, Transport};
use crate::typing::{RemoteTypingIndicator, TimerFired, TimerKind, TypingCoordinator};

/// Public handle to a running chat core. Cheap to clone; every clone talks to
/// the same owner task.
#[derive(Clone)]
pub struct ChatService {
    commands: mpsc::UnboundedSender<ServiceCommand>,
    hub: EventHub,
    indicator: watch::Receiver<Option<String>>,
    display_name: String,
}

impl ChatService {
    /// Bind `transport` and start the owner task. Must be called from inside a
    /// tokio runtime.
    pub fn spawn<T>(config: &ChatConfig, mut transport: T) -> Result<Self, ConfigError>
    where
        T: Transport + 'static,
    {
        let service = config.service()?;
        let display_name = config.resolved_display_name()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        transport.bind(
            &LocalPeer {
                display_name: display_name.clone(),
                service: service.clone(),
            },
            EventSink::new(event_tx).observers(),
        );

        let hub = EventHub::new(config.event_buffer);
        let typing_config = config.typing();
        let indicator = RemoteTypingIndicator::new(typing_config.remote_expiry, timer_tx.clone());
        let indicator_rx = indicator.subscribe();

        let engine = Engine {
            transport: Box::new(transport),
            local_name: display_name.clone(),
            session: SessionManager::new(),
            discovery: DiscoveryEngine::new(
                service,
                DiscoveryPolicy {
                    auto_invite: config.auto_invite,
                    auto_accept: config.auto_accept,
                },
            ),
            dispatcher: MessageDispatcher::new(completion_tx),
            typing: TypingCoordinator::new(typing_config, timer_tx),
            indicator,
            hub: hub.clone(),
            session_open: false,
        };
        tokio::spawn(engine.run(Inbox {
            commands: command_rx,
            events: event_rx,
            timers: timer_rx,
            completions: completion_rx,
        }));
        log::info!("Chat service running as '{display_name}'");

        Ok(Self {
            commands: command_tx,
            hub,
            indicator: indicator_rx,
            display_name,
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Begin advertising and browsing. Calling it again restarts discovery.
    pub async fn start_discovery(&self) -> Result<(), ServiceError> {
        let (done, ack) = oneshot::channel();
        self.request(ServiceCommand::StartDiscovery { done })?;
        ack.await.map_err(|_| ServiceError::Stopped)
    }

    /// Release both discovery roles and disconnect every peer. Sequences stay
    /// open so discovery can be started again.
    pub async fn stop_discovery(&self) -> Result<(), ServiceError> {
        let (done, ack) = oneshot::channel();
        self.request(ServiceCommand::StopDiscovery { done })?;
        ack.await.map_err(|_| ServiceError::Stopped)
    }

    /// Broadcast `text` to every connected peer. Resolves once the message has
    /// settled; blank text resolves to [`SendOutcome::Skipped`].
    pub async fn send_message(&self, text: impl Into<String>) -> Result<SendOutcome, ServiceError> {
        let (reply, outcome) = oneshot::channel();
        self.request(ServiceCommand::SendMessage {
            text: text.into(),
            reply,
        })?;
        outcome.await.map_err(|_| ServiceError::Stopped)
    }

    /// The user typed something.
    pub fn notify_typing_activity(&self) {
        if self.request(ServiceCommand::TypingActivity).is_err() {
            log::debug!("Typing activity after shutdown ignored");
        }
    }

    /// The user cleared the input without sending.
    pub fn notify_typing_stopped(&self) {
        if self.request(ServiceCommand::TypingStopped).is_err() {
            log::debug!("Typing stop after shutdown ignored");
        }
    }

    pub async fn peer_snapshot(&self) -> Result<Vec<PeerRecord>, ServiceError> {
        let (reply, snapshot) = oneshot::channel();
        self.request(ServiceCommand::Snapshot { reply })?;
        snapshot.await.map_err(|_| ServiceError::Stopped)
    }

    /// Stop discovery, fail in-flight sends, close every sequence and end the
    /// owner task. Safe to call any number of times.
    pub async fn shutdown(&self) {
        let (done, ack) = oneshot::channel();
        if self.request(ServiceCommand::Shutdown { done }).is_ok() {
            let _ = ack.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    pub fn peers(&self) -> Subscription<Vec<PeerRecord>> {
        self.hub.peers().subscribe()
    }

    pub fn messages(&self) -> Subscription<ChatMessage> {
        self.hub.messages().subscribe()
    }

    pub fn typing(&self) -> Subscription<TypingSignal> {
        self.hub.typing().subscribe()
    }

    pub fn outgoing(&self) -> Subscription<ChatMessage> {
        self.hub.outgoing().subscribe()
    }

    /// Name of the peer currently shown as typing.
    pub fn typing_indicator(&self) -> watch::Receiver<Option<String>> {
        self.indicator.clone()
    }

    fn request(&self, command: ServiceCommand) -> Result<(), ServiceError> {
        self.commands
            .send(command)
            .map_err(|_| ServiceError::Stopped)
    }
}

struct Inbox {
    commands: mpsc::UnboundedReceiver<ServiceCommand>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    completions: mpsc::UnboundedReceiver<SendCompletion>,
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

struct Engine {
    transport: Box<dyn Transport>,
    local_name: String,
    session: SessionManager,
    discovery: DiscoveryEngine,
    dispatcher: MessageDispatcher,
    typing: TypingCoordinator,
    indicator: RemoteTypingIndicator,
    hub: EventHub,
    /// Set by `start_discovery`, cleared by `stop_discovery`.
    session_open: bool,
}

impl Engine {
    async fn run(mut self, inbox: Inbox) {
        let Inbox {
            mut commands,
            mut events,
            mut timers,
            mut completions,
        } = inbox;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        log::info!("All service handles dropped; shutting down");
                        self.shutdown();
                        break;
                    };
                    if self.handle_command(command) == Flow::Exit {
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_transport_event(event),
                Some(fired) = timers.recv() => self.handle_timer(fired),
                Some(completion) = completions.recv() => {
                    if let Some(settled) = self.dispatcher.complete(completion) {
                        self.hub.outgoing().publish(settled);
                    }
                }
            }
        }
        log::info!("Chat service stopped");
    }

    fn handle_command(&mut self, command: ServiceCommand) -> Flow {
        match command {
            ServiceCommand::StartDiscovery { done } => {
                self.discovery.start(self.transport.as_mut());
                self.session_open = true;
                self.publish_peers();
                let _ = done.send(());
            }
            ServiceCommand::StopDiscovery { done } => {
                self.stop_discovery();
                let _ = done.send(());
            }
            ServiceCommand::SendMessage { text, reply } => self.send_message(&text, reply),
            ServiceCommand::TypingActivity => self.typing.notify_activity(),
            ServiceCommand::TypingStopped => {
                if let Some(kind) = self.typing.notify_stopped() {
                    self.broadcast_typing(kind);
                }
            }
            ServiceCommand::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
            ServiceCommand::Shutdown { done } => {
                self.shutdown();
                let _ = done.send(());
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    fn send_message(&mut self, text: &str, reply: oneshot::Sender<SendOutcome>) {
        let Some(message) = MessageDispatcher::compose(text) else {
            let _ = reply.send(SendOutcome::Skipped);
            return;
        };
        self.hub.outgoing().publish(message.clone());

        if let Some(kind) = self.typing.notify_stopped() {
            self.broadcast_typing(kind);
        }

        let recipients = self.session.connected_peers();
        if let Some(settled) = self.dispatcher.dispatch(
            message,
            self.session_open,
            &recipients,
            self.transport.as_mut(),
            reply,
        ) {
            self.hub.outgoing().publish(settled);
        }
    }

    /// Fire-and-forget: a lost typing signal only costs a stale indicator.
    fn broadcast_typing(&mut self, kind: TypingKind) {
        let recipients = self.session.connected_peers();
        if !self.session_open || recipients.is_empty() {
            log::debug!("No one to tell about typing {kind:?}");
            return;
        }
        let signal = TypingSignal::new(kind, self.local_name.clone());
        let bytes = match codec::encode(&Packet::Typing(signal)) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("Failed to encode typing signal: {err}");
                return;
            }
        };
        let transmission = self.transport.send(&recipients, bytes);
        tokio::spawn(async move {
            if let Err(err) = transmission.await {
                log::debug!("Typing signal not delivered: {err}");
            }
        });
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerFound { peer, display_name } => {
                if !self.discovery.is_running() {
                    log::debug!("Ignoring late discovery of {peer}");
                    return;
                }
                self.discovery.on_peer_found(
                    &mut self.session,
                    self.transport.as_mut(),
                    peer,
                    display_name,
                );
                self.publish_peers();
            }
            TransportEvent::PeerLost { peer } => {
                if self
                    .discovery
                    .on_peer_lost(&mut self.session, self.transport.as_mut(), &peer)
                {
                    self.publish_peers();
                }
            }
            TransportEvent::Invitation {
                peer,
                display_name,
                responder,
            } => {
                self.discovery
                    .on_invitation(&mut self.session, peer, display_name, responder);
                self.publish_peers();
            }
            TransportEvent::DiscoveryFailed { role, reason } => {
                self.discovery.on_role_failed(role, &reason);
            }
            TransportEvent::SessionStateChanged { peer, state } => {
                if self
                    .discovery
                    .on_state_changed(&mut self.session, &peer, state)
                {
                    self.publish_peers();
                }
            }
            TransportEvent::DataReceived { peer, bytes } => self.handle_data(peer, &bytes),
        }
    }

    fn handle_data(&mut self, peer: PeerId, bytes: &[u8]) {
        if !self.session_open {
            log::debug!("Dropping {} bytes from {peer}: no session", bytes.len());
            return;
        }
        match codec::decode(bytes) {
            Ok(Packet::Message(message)) => {
                log::debug!("Message {} from {peer}", message.id);
                self.hub.messages().publish(message);
            }
            Ok(Packet::Typing(signal)) => {
                self.indicator.apply(&signal);
                self.hub.typing().publish(signal);
            }
            Err(err) => log::warn!("Dropping packet from {peer}: {err}"),
        }
    }

    fn handle_timer(&mut self, fired: TimerFired) {
        match fired.kind {
            TimerKind::RemoteExpiry => {
                self.indicator.on_timer(fired);
            }
            TimerKind::Debounce | TimerKind::Inactivity => {
                if let Some(kind) = self.typing.on_timer(fired) {
                    self.broadcast_typing(kind);
                }
            }
        }
    }

    fn stop_discovery(&mut self) {
        if !self.discovery.is_running() && !self.session_open {
            return;
        }
        // Peers hear the Stop before the link goes away.
        if let Some(kind) = self.typing.notify_stopped() {
            self.broadcast_typing(kind);
        }
        self.indicator.clear();
        self.discovery
            .stop(&mut self.session, self.transport.as_mut());
        self.session_open = false;
        self.publish_peers();
    }

    fn shutdown(&mut self) {
        self.stop_discovery();
        for aborted in self.dispatcher.abort_all() {
            self.hub.outgoing().publish(aborted);
        }
        self.hub.close();
    }

    fn publish_peers(&self) {
        self.hub.peers().publish(self.session.snapshot());
    }
}
