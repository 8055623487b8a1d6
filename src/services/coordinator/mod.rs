mod task;

use crate::config::CoordinatorConfig;
use crate::domain::conversation::{Conversation, ConversationSummary};
use crate::domain::message::{self, Message};
use crate::domain::profile::{ProfileCard, ProfileDirectory};
use crate::error::{AppError, Result};
use crate::storage::MessageStore;
use crate::transport::ChannelTransport;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use std::sync::Arc;
use task::CoordinatorTask;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::Instrument;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub(crate) struct Metrics {
    pub(crate) sent_total: Counter<u64>,
    pub(crate) live_inserts_total: Counter<u64>,
    pub(crate) stale_fetches_total: Counter<u64>,
    pub(crate) typing_signals_total: Counter<u64>,
    pub(crate) resyncs_total: Counter<u64>,
    pub(crate) thread_fetch_size: Histogram<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("alumnet-messaging");
        Self {
            sent_total: meter
                .u64_counter("alumnet_messages_sent_total")
                .with_description("Total messages submitted to the durable store")
                .build(),
            live_inserts_total: meter
                .u64_counter("alumnet_live_inserts_total")
                .with_description("Row-change inserts applied from the live feed")
                .build(),
            stale_fetches_total: meter
                .u64_counter("alumnet_stale_fetches_total")
                .with_description("Thread fetches discarded because the selection changed")
                .build(),
            typing_signals_total: meter
                .u64_counter("alumnet_typing_signals_total")
                .with_description("Typing signals broadcast on behalf of this viewer")
                .build(),
            resyncs_total: meter
                .u64_counter("alumnet_resyncs_total")
                .with_description("Full conversation refetches triggered by reconnect or lag")
                .build(),
            thread_fetch_size: meter
                .u64_histogram("alumnet_thread_fetch_size")
                .with_description("Number of messages returned by a thread fetch")
                .build(),
        }
    }
}

/// Coarse state-diff events broadcast to observers. Consumers re-read the
/// affected state through the query methods rather than receiving payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    ConversationsChanged,
    ThreadUpdated { counterpart: Uuid },
    PresenceChanged,
    TypingChanged { user: Uuid, is_typing: bool },
}

pub(crate) enum Command {
    SelectThread { counterpart: Uuid, reply: oneshot::Sender<Result<Vec<Message>>> },
    SetTyping { to: Uuid, is_typing: bool },
    Conversations { reply: oneshot::Sender<Vec<Conversation>> },
    Thread { reply: oneshot::Sender<(Option<Uuid>, Vec<Message>)> },
    IsOnline { id: Uuid, reply: oneshot::Sender<bool> },
    IsTyping { id: Uuid, reply: oneshot::Sender<bool> },
}

/// Completions of work the actor farmed out to tasks, re-entering the event
/// loop so all state mutation stays on the single writer.
pub(crate) enum TaskEvent {
    ThreadFetched { counterpart: Uuid, seq: u64, result: Result<Vec<Message>> },
    ConversationsLoaded { result: Result<Vec<ConversationSummary>> },
    ProfilesResolved { cards: Vec<ProfileCard> },
}

/// Consumer-facing facade over the conversation list, active thread and
/// presence state. One instance per viewing session; all mutation happens on
/// a single actor task, commands and queries go over a channel.
#[derive(Debug, Clone)]
pub struct Coordinator {
    me: Uuid,
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<Update>,
    store: Arc<dyn MessageStore>,
    metrics: Metrics,
}

impl Coordinator {
    /// Loads the viewer's conversation list, attaches all live feeds and
    /// spawns the coordinator actor.
    ///
    /// # Errors
    /// Returns `AppError::Read` if the initial conversation load fails and
    /// `AppError::Transport` if any subscription cannot be established.
    pub async fn open(
        me: Uuid,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn ChannelTransport>,
        profiles: Arc<dyn ProfileDirectory>,
        config: &CoordinatorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let summaries = store.fetch_conversations(me).await?;

        let counterpart_ids: Vec<Uuid> = summaries.iter().map(|s| s.counterpart_id).collect();
        let cards = match profiles.lookup(&counterpart_ids).await {
            Ok(cards) => cards,
            Err(e) => {
                tracing::warn!(error = %e, "Profile lookup failed, using placeholders");
                Vec::new()
            }
        };

        let changes_rx = transport.subscribe_changes(me).await?;
        let presence_rx = transport.track(&config.presence_scope, me).await?;
        let signals_rx = transport.signals(&config.presence_scope).await?;
        let connection_rx = transport.connection();

        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer);
        let (updates_tx, _) = broadcast::channel(config.update_channel_capacity);
        let metrics = Metrics::new();

        let task = CoordinatorTask::new(
            me,
            Arc::clone(&store),
            transport,
            profiles,
            config,
            summaries,
            cards,
            commands_rx,
            changes_rx,
            presence_rx,
            signals_rx,
            connection_rx,
            updates_tx.clone(),
            shutdown,
            metrics.clone(),
        );
        tokio::spawn(task.run().instrument(tracing::info_span!("coordinator", user_id = %me)));

        tracing::info!(user_id = %me, "Coordinator opened");
        Ok(Self { me, commands: commands_tx, updates: updates_tx, store, metrics })
    }

    #[must_use]
    pub const fn me(&self) -> Uuid {
        self.me
    }

    /// Subscribes to state-diff notifications.
    #[must_use]
    pub fn updates(&self) -> broadcast::Receiver<Update> {
        self.updates.subscribe()
    }

    /// Sends a message. The sent message is *not* echoed into local state
    /// here; the live feed's insert event is the sole path by which the
    /// sender's own view picks it up, so thread content has a single source
    /// of truth.
    ///
    /// # Errors
    /// `AppError::Validation` before any network call, `AppError::Write` on
    /// store failure. Never retried automatically.
    #[tracing::instrument(err(level = "warn"), skip(self, content), fields(recipient_id = %to))]
    pub async fn send(&self, to: Uuid, content: &str) -> Result<Message> {
        message::validate_outgoing(self.me, to, content)?;
        match self.store.send(self.me, to, content).await {
            Ok(stored) => {
                self.metrics.sent_total.add(1, &[KeyValue::new("status", "success")]);
                Ok(stored)
            }
            Err(e) => {
                self.metrics.sent_total.add(1, &[KeyValue::new("status", "failure")]);
                Err(e)
            }
        }
    }

    /// Selects a thread: fetches its full snapshot, marks it read and clears
    /// its unread count. Resolves once the fetch result has been applied, so
    /// the unread count is already zero when this returns. A competing later
    /// selection supersedes this one, which then resolves with
    /// `AppError::StaleSelection`.
    ///
    /// # Errors
    /// `AppError::Read` if the fetch fails, `AppError::StaleSelection` if
    /// superseded, `AppError::Closed` if the coordinator shut down.
    pub async fn select_thread(&self, counterpart: Uuid) -> Result<Vec<Message>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SelectThread { counterpart, reply })
            .await
            .map_err(|_| AppError::Closed)?;
        rx.await.map_err(|_| AppError::Closed)?
    }

    /// Forwards the viewer's typing state for `to`. `true` refreshes the
    /// sender-side idle timer; if no further call arrives within the idle
    /// timeout the coordinator emits the stop signal itself.
    pub async fn set_typing(&self, to: Uuid, is_typing: bool) -> Result<()> {
        self.commands
            .send(Command::SetTyping { to, is_typing })
            .await
            .map_err(|_| AppError::Closed)
    }

    /// Current conversation list, most recent first.
    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.query(|reply| Command::Conversations { reply }).await
    }

    /// Currently selected counterpart and the thread's messages.
    pub async fn thread(&self) -> Result<(Option<Uuid>, Vec<Message>)> {
        self.query(|reply| Command::Thread { reply }).await
    }

    pub async fn is_online(&self, id: Uuid) -> Result<bool> {
        self.query(|reply| Command::IsOnline { id, reply }).await
    }

    pub async fn is_typing(&self, id: Uuid) -> Result<bool> {
        self.query(|reply| Command::IsTyping { id, reply }).await
    }

    async fn query<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        self.commands.send(make(reply)).await.map_err(|_| AppError::Closed)?;
        rx.await.map_err(|_| AppError::Closed)
    }
}
