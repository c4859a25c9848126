//! The synchronization core.
//!
//! `SyncProvider` wires the channel, the document model, the step queue, the
//! catchup controller and the presence tracker together, and exposes the
//! event surface the editing layer subscribes to.
//!
//! ## Architecture
//!
//! ```text
//!                        ┌──────────────────── SyncProvider ────────────────────┐
//! ChannelEvent::Data ───►│ StepQueue::enqueue ─► drain ─► DocumentModel ─► "data" │
//!                        │                        │ gap                           │
//!                        │                        ▼                               │
//! TimerToken ───────────►│ CatchupController ─► Channel::request_steps            │
//! CatchupResponse ──────►│   snapshot: reset ─► "init" (+ "local-steps")          │
//!                        │   steps:    back through enqueue/drain                 │
//! ChannelEvent::Tele… ──►│ PresenceTracker ─► "presence", "telepointer"           │
//! ProviderCommand ──────►│ send / send_message / has_unsent_changes               │
//!                        └───────────────────────────────────────────────────────┘
//! ```
//!
//! Every handler runs to completion on one task. Subscribers that need to
//! call back into the provider post a [`ProviderCommand`] through a
//! [`ProviderHandle`]; it is picked up once the current dispatch is over.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::catchup::{CatchupController, CatchupState, Scheduler, TimerToken, TokioScheduler};
use crate::channel::{Channel, ChannelEvent, WsChannel};
use crate::clock::{Clock, SystemClock};
use crate::config::ProviderConfig;
use crate::directory::ParticipantDirectory;
use crate::document::{DocumentModel, Transaction};
use crate::error::SyncError;
use crate::events::{EventBus, EventKind, SubscriptionId, SyncEvent};
use crate::presence::{Participant, PresenceTracker};
use crate::protocol::{CatchupResponse, OutgoingMessage, StepBatch, Telepointer};
use crate::queue::StepQueue;

/// Deferred edit run against the document model inside the provider task.
pub type EditFn<D> = Box<dyn FnOnce(&mut D) -> Transaction + Send>;

/// Requests posted to a running provider.
pub enum ProviderCommand<D> {
    /// Run an edit on the document model, then send its steps.
    Edit(EditFn<D>),
    SendMessage(OutgoingMessage),
    HasUnsentChanges(oneshot::Sender<bool>),
    Shutdown,
}

/// Cloneable sender for [`ProviderCommand`]s.
pub struct ProviderHandle<D> {
    commands: mpsc::UnboundedSender<ProviderCommand<D>>,
}

impl<D> Clone for ProviderHandle<D> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<D> ProviderHandle<D> {
    fn post(&self, command: ProviderCommand<D>) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::ConnectionClosed)
    }

    pub fn edit(
        &self,
        edit: impl FnOnce(&mut D) -> Transaction + Send + 'static,
    ) -> Result<(), SyncError> {
        self.post(ProviderCommand::Edit(Box::new(edit)))
    }

    pub fn send_message(&self, message: OutgoingMessage) -> Result<(), SyncError> {
        self.post(ProviderCommand::SendMessage(message))
    }

    /// Ask whether local steps are still waiting for confirmation.
    pub async fn has_unsent_changes(&self) -> Result<bool, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.post(ProviderCommand::HasUnsentChanges(tx))?;
        rx.await.map_err(|_| SyncError::ConnectionClosed)
    }

    pub fn shutdown(&self) -> Result<(), SyncError> {
        self.post(ProviderCommand::Shutdown)
    }
}

/// Receivers feeding [`SyncProvider::run`].
pub struct Inbox {
    pub events: mpsc::Receiver<ChannelEvent>,
    pub timers: mpsc::UnboundedReceiver<TimerToken>,
}

pub struct SyncProvider<C, D, R> {
    config: ProviderConfig,
    channel: C,
    document: D,
    directory: R,
    queue: StepQueue,
    catchup: CatchupController,
    presence: PresenceTracker,
    clock: Arc<dyn Clock + Send + Sync>,
    events: EventBus,
    handle: ProviderHandle<D>,
    commands: Option<mpsc::UnboundedReceiver<ProviderCommand<D>>>,
}

impl<D, R> SyncProvider<WsChannel, D, R>
where
    D: DocumentModel,
    R: ParticipantDirectory,
{
    /// Open a WebSocket to `url` and build a provider on top of it.
    ///
    /// Nothing is sent yet: register subscribers, call
    /// [`initialize`](Self::initialize), then drive the provider with
    /// [`run`](Self::run).
    pub async fn connect(
        url: &str,
        config: ProviderConfig,
        document: D,
        directory: R,
    ) -> Result<(Self, Inbox), SyncError> {
        let (event_tx, event_rx) = mpsc::channel(config.outgoing_capacity);
        let channel = WsChannel::open(
            url,
            config.session_id.clone(),
            config.outgoing_capacity,
            event_tx,
        )
        .await?;
        let (scheduler, timers) = TokioScheduler::new();
        let provider = Self::new(config, channel, document, directory, Box::new(scheduler));
        Ok((
            provider,
            Inbox {
                events: event_rx,
                timers,
            },
        ))
    }
}

impl<C, D, R> SyncProvider<C, D, R>
where
    C: Channel,
    D: DocumentModel,
    R: ParticipantDirectory,
{
    pub fn new(
        config: ProviderConfig,
        channel: C,
        document: D,
        directory: R,
        scheduler: Box<dyn Scheduler + Send>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let catchup = CatchupController::with_delay(scheduler, config.catchup_retry_delay);
        let presence =
            PresenceTracker::with_timeout(config.user_id.clone(), config.presence_timeout);
        Self {
            config,
            channel,
            document,
            directory,
            queue: StepQueue::new(),
            catchup,
            presence,
            clock: Arc::new(SystemClock),
            events: EventBus::new(),
            handle: ProviderHandle { commands: tx },
            commands: Some(rx),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Start the handshake: send the local document and the version to
    /// resume from. The configured version wins over the document's own.
    pub fn initialize(&mut self) -> Result<(), SyncError> {
        let doc = self.document.encode_document();
        let version = self
            .config
            .initial_version
            .unwrap_or_else(|| self.document.version());
        log::info!(
            "Session {} connecting at version {}",
            self.config.session_id,
            version
        );
        self.channel.connect(version, doc)
    }

    /// Dispatch one inbound channel event.
    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { doc, version } => self.on_connected(doc, version),
            ChannelEvent::Data(batch) => self.on_receive_data(batch),
            ChannelEvent::Telepointer(telepointer) => self.on_receive_telepointer(telepointer),
            ChannelEvent::CatchupResponse(response) => self.on_catchup_response(response),
            ChannelEvent::Disconnected => self.on_disconnected(),
        }
    }

    /// Handshake completed: adopt the authoritative document, then announce
    /// readiness.
    pub fn on_connected(&mut self, doc: Vec<u8>, version: u64) {
        let version = self.config.initial_version.unwrap_or(version);
        if let Err(e) = self.document.reset(&doc, version) {
            log::warn!("Failed to load connected document: {e}");
            return;
        }

        let sid = self.config.session_id.clone();
        log::info!("Session {sid} connected at version {version}");
        self.events.emit(&SyncEvent::Init {
            sid: sid.clone(),
            doc,
            version,
        });
        self.events.emit(&SyncEvent::Connected { sid });
        self.process_queue();
    }

    pub fn on_receive_data(&mut self, batch: StepBatch) {
        if let Err(e) = self.queue.enqueue(batch) {
            log::warn!("Dropping batch: {e}");
            return;
        }
        self.process_queue();
    }

    pub fn on_receive_telepointer(&mut self, telepointer: Telepointer) {
        let now = self.clock.now_ms();
        let Some(change) = self
            .presence
            .on_telepointer(&telepointer, &self.directory, now)
        else {
            return;
        };
        self.events.emit(&SyncEvent::Presence(change));
        self.events.emit(&SyncEvent::Telepointer(telepointer));
    }

    /// A catchup timer fired. Issues the request if it is still wanted.
    pub fn on_catchup_timer(&mut self, token: TimerToken) {
        if !self.catchup.on_timer_fired(token) {
            return;
        }
        let since = self.document.version();
        log::info!(
            "Requesting catchup since version {} (attempt {})",
            since,
            self.catchup.attempts()
        );
        if let Err(e) = self.channel.request_steps(since) {
            log::warn!("Catchup request failed: {e}");
            self.catchup.on_request_failed();
        }
    }

    pub fn on_catchup_response(&mut self, response: Result<CatchupResponse, SyncError>) {
        match response {
            Ok(CatchupResponse::Snapshot { doc, version }) => {
                self.catchup.on_response();
                self.apply_snapshot(doc, version);
            }
            Ok(CatchupResponse::Steps { version, steps }) => {
                self.catchup.on_response();
                if !steps.is_empty() {
                    if let Err(e) = self.queue.enqueue(StepBatch::new(version, steps)) {
                        log::warn!("Dropping catchup steps: {e}");
                    }
                }
                // Re-arms the timer if the queue still holds a gap.
                self.process_queue();
            }
            Err(e) => {
                log::warn!("Catchup failed, retrying: {e}");
                self.catchup.on_request_failed();
            }
        }
    }

    fn on_disconnected(&mut self) {
        log::warn!("Session {} disconnected", self.config.session_id);
        if self.catchup.state() == CatchupState::InFlight {
            self.catchup.on_request_failed();
        }
    }

    /// Send the model's pending local steps. Transactions without steps
    /// produce no traffic.
    pub fn send(&mut self, transaction: &Transaction) -> Result<(), SyncError> {
        if !transaction.has_steps() {
            return Ok(());
        }
        match self.document.sendable_steps() {
            Some(sendable) => self.channel.send_steps(sendable),
            None => Ok(()),
        }
    }

    /// Broadcast an ephemeral message. Unknown kinds are dropped.
    pub fn send_message(&mut self, message: OutgoingMessage) -> Result<(), SyncError> {
        match message {
            OutgoingMessage::Telepointer { selection } => {
                self.channel.send_telepointer(Telepointer {
                    session_id: self.config.session_id.clone(),
                    timestamp: self.clock.now_ms(),
                    selection,
                })
            }
            OutgoingMessage::Other { kind } => {
                log::debug!("Ignoring outgoing message of kind {kind}");
                Ok(())
            }
        }
    }

    pub fn has_unsent_changes(&self) -> bool {
        self.document
            .sendable_steps()
            .is_some_and(|s| !s.steps.is_empty())
    }

    pub fn on(
        &mut self,
        kind: EventKind,
        handler: impl FnMut(&SyncEvent) + Send + 'static,
    ) -> SubscriptionId {
        self.events.on(kind, handler)
    }

    pub fn off(&mut self, id: SubscriptionId) -> bool {
        self.events.off(id)
    }

    pub fn unsubscribe_all(&mut self, kind: EventKind) {
        self.events.unsubscribe_all(kind);
    }

    pub fn emit(&mut self, event: &SyncEvent) {
        self.events.emit(event);
    }

    /// Handle for posting commands from subscribers or other tasks.
    pub fn handle(&self) -> ProviderHandle<D> {
        self.handle.clone()
    }

    /// Run a command. Returns `false` on shutdown.
    pub fn handle_command(&mut self, command: ProviderCommand<D>) -> bool {
        match command {
            ProviderCommand::Edit(edit) => {
                let transaction = edit(&mut self.document);
                if let Err(e) = self.send(&transaction) {
                    log::warn!("Failed to send steps: {e}");
                }
            }
            ProviderCommand::SendMessage(message) => {
                if let Err(e) = self.send_message(message) {
                    log::warn!("Failed to send message: {e}");
                }
            }
            ProviderCommand::HasUnsentChanges(reply) => {
                let _ = reply.send(self.has_unsent_changes());
            }
            ProviderCommand::Shutdown => {
                log::info!("Session {} shutting down", self.config.session_id);
                self.catchup.reset();
                return false;
            }
        }
        true
    }

    /// Drive the provider until a `Shutdown` command arrives. Returns the
    /// provider so its final state can be inspected.
    pub async fn run(mut self, mut inbox: Inbox) -> Self {
        let Some(mut commands) = self.commands.take() else {
            return self;
        };

        loop {
            tokio::select! {
                Some(event) = inbox.events.recv() => self.handle_channel_event(event),
                Some(token) = inbox.timers.recv() => self.on_catchup_timer(token),
                Some(command) = commands.recv() => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                else => break,
            }
        }

        self.commands = Some(commands);
        self
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn catchup_state(&self) -> CatchupState {
        self.catchup.state()
    }

    pub fn participants(&self) -> Vec<&Participant> {
        self.presence.participants()
    }

    pub fn document(&self) -> &D {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut D {
        &mut self.document
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn apply_snapshot(&mut self, doc: Vec<u8>, version: u64) {
        let local_steps = self
            .document
            .sendable_steps()
            .map(|s| s.steps)
            .unwrap_or_default();

        if let Err(e) = self.document.reset(&doc, version) {
            log::warn!("Failed to apply snapshot at version {version}: {e}");
            self.catchup.on_gap();
            return;
        }
        log::info!(
            "Resynced from snapshot at version {} ({} local steps to replay)",
            version,
            local_steps.len()
        );

        self.events.emit(&SyncEvent::Init {
            sid: self.config.session_id.clone(),
            doc,
            version,
        });
        if !local_steps.is_empty() {
            self.events.emit(&SyncEvent::LocalSteps { steps: local_steps });
        }
        self.process_queue();
    }

    /// Forward every contiguous batch to the model and react to gaps.
    fn process_queue(&mut self) {
        let outcome = self.queue.drain(self.document.version());
        let gap = outcome.gap;
        let mut progressed = false;
        let mut accepted = outcome.accepted.into_iter();

        while let Some(batch) = accepted.next() {
            let user_ids = self.resolve_user_ids(&batch);
            if let Err(e) = self.document.apply_remote(&batch, &user_ids) {
                log::warn!("Document rejected batch ending at {}: {e}", batch.version);
                for rest in accepted {
                    if let Err(e) = self.queue.enqueue(rest) {
                        log::warn!("Dropping batch: {e}");
                    }
                }
                if progressed {
                    self.catchup.on_contiguous();
                }
                self.catchup.on_gap();
                return;
            }
            progressed = true;
            self.events.emit(&SyncEvent::Data {
                steps: batch.steps,
                version: batch.version,
                user_ids,
            });
        }

        if progressed {
            self.catchup.on_contiguous();
        }
        if gap.is_some() {
            self.catchup.on_gap();
        }
    }

    fn resolve_user_ids(&self, batch: &StepBatch) -> Vec<Option<String>> {
        (0..batch.len())
            .map(|i| {
                batch
                    .step_session(i)
                    .map(|session| self.directory.resolve_user_id(session))
            })
            .collect()
    }
}
