use crate::config::CoordinatorConfig;
use crate::domain::conversation::{ConversationList, ConversationSummary};
use crate::domain::message::{self, Message};
use crate::domain::presence::{PresenceEvent, TypingSignal};
use crate::domain::profile::{ProfileCard, ProfileDirectory};
use crate::error::{AppError, Result};
use crate::services::coordinator::{Command, Metrics, TaskEvent, Update};
use crate::services::presence::PresenceTracker;
use crate::storage::MessageStore;
use crate::transport::{ChangeOp, ChannelTransport, ConnectionState, RowChange};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

struct PendingFetch {
    seq: u64,
    counterpart: Uuid,
    reply: Option<oneshot::Sender<Result<Vec<Message>>>>,
}

/// The coordinator's single-writer event loop. Every mutation of the
/// conversation list, active thread and presence state happens here;
/// transport callbacks, command handlers and timers all funnel through the
/// same `select!` so no locking is needed anywhere in the state.
pub(crate) struct CoordinatorTask {
    state: State,
    commands_rx: mpsc::Receiver<Command>,
    events_rx: mpsc::Receiver<TaskEvent>,
    changes_rx: broadcast::Receiver<RowChange>,
    presence_rx: broadcast::Receiver<PresenceEvent>,
    signals_rx: broadcast::Receiver<TypingSignal>,
    connection_rx: watch::Receiver<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

impl CoordinatorTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        me: Uuid,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn ChannelTransport>,
        profiles: Arc<dyn ProfileDirectory>,
        config: &CoordinatorConfig,
        summaries: Vec<ConversationSummary>,
        cards: Vec<ProfileCard>,
        commands_rx: mpsc::Receiver<Command>,
        changes_rx: broadcast::Receiver<RowChange>,
        presence_rx: broadcast::Receiver<PresenceEvent>,
        signals_rx: broadcast::Receiver<TypingSignal>,
        connection_rx: watch::Receiver<ConnectionState>,
        updates: broadcast::Sender<Update>,
        shutdown: watch::Receiver<bool>,
        metrics: Metrics,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);

        let mut conversations = ConversationList::default();
        let card_map: HashMap<Uuid, ProfileCard> =
            cards.into_iter().map(|c| (c.id, c)).collect();
        conversations.replace(summaries, |id| {
            card_map.get(&id).cloned().unwrap_or_else(|| ProfileCard::placeholder(id))
        });

        let state = State {
            me,
            scope: config.presence_scope.clone(),
            store,
            transport,
            profiles,
            conversations,
            selected: None,
            thread: Vec::new(),
            tracker: PresenceTracker::new(me, Duration::from_millis(config.typing_expiry_ms)),
            typing_idle: HashMap::new(),
            idle_timeout: Duration::from_millis(config.typing_idle_ms),
            fetch_seq: 0,
            pending: None,
            events_tx,
            updates,
            metrics,
        };

        Self {
            state,
            commands_rx,
            events_rx,
            changes_rx,
            presence_rx,
            signals_rx,
            connection_rx,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        // Destructuring allows the select arms to borrow the receivers
        // independently of the mutable state.
        let Self {
            mut state,
            mut commands_rx,
            mut events_rx,
            mut changes_rx,
            mut presence_rx,
            mut signals_rx,
            mut connection_rx,
            mut shutdown,
        } = self;

        state.resolve_missing_profiles();
        let mut was_disconnected = *connection_rx.borrow() == ConnectionState::Disconnected;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let deadline = state.next_deadline();

            tokio::select! {
                biased;

                res = shutdown.changed() => {
                    if res.is_err() { break; }
                }

                cmd = commands_rx.recv() => {
                    match cmd {
                        Some(cmd) => state.handle_command(cmd),
                        None => break,
                    }
                }

                event = events_rx.recv() => {
                    if let Some(event) = event {
                        state.handle_task_event(event);
                    }
                }

                change = changes_rx.recv() => {
                    let continue_loop = match change {
                        Ok(change) => {
                            state.handle_change(change);
                            true
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Missed inserts would otherwise never be
                            // reconciled; fall back to a full refetch.
                            tracing::warn!(missed = n, "Change feed lagged, resyncing");
                            state.resync();
                            if let Some(counterpart) = state.selected {
                                state.spawn_thread_fetch(counterpart, None);
                            }
                            true
                        }
                        Err(broadcast::error::RecvError::Closed) => false,
                    };
                    if !continue_loop { break; }
                }

                event = presence_rx.recv() => {
                    match event {
                        Ok(event) => {
                            state.tracker.on_presence_event(event);
                            state.notify(Update::PresenceChanged);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "Presence feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                signal = signals_rx.recv() => {
                    match signal {
                        Ok(signal) => state.handle_typing_signal(signal),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "Typing feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                res = connection_rx.changed() => {
                    if res.is_err() { break; }
                    match *connection_rx.borrow() {
                        ConnectionState::Disconnected => {
                            tracing::info!("Transport disconnected");
                            was_disconnected = true;
                        }
                        ConnectionState::Connected if was_disconnected => {
                            tracing::info!("Transport reconnected, resyncing");
                            was_disconnected = false;
                            state.tracker.reset();
                            state.notify(Update::PresenceChanged);
                            state.resync();
                            if let Some(counterpart) = state.selected {
                                state.spawn_thread_fetch(counterpart, None);
                            }
                        }
                        ConnectionState::Connected => {}
                    }
                }

                () = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => state.handle_deadline(),
            }
        }

        if let Err(e) = state.transport.leave(&state.scope, state.me).await {
            tracing::debug!(error = %e, "Presence leave failed during shutdown");
        }
        tracing::info!("Coordinator closed");
    }
}

struct State {
    me: Uuid,
    scope: String,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn ChannelTransport>,
    profiles: Arc<dyn ProfileDirectory>,
    conversations: ConversationList,
    selected: Option<Uuid>,
    thread: Vec<Message>,
    tracker: PresenceTracker,
    /// Counterparts this viewer is currently typing to, each with its own
    /// idle deadline. Independent of the tracker's receive-side expiry.
    typing_idle: HashMap<Uuid, Instant>,
    idle_timeout: Duration,
    fetch_seq: u64,
    pending: Option<PendingFetch>,
    events_tx: mpsc::Sender<TaskEvent>,
    updates: broadcast::Sender<Update>,
    metrics: Metrics,
}

impl State {
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SelectThread { counterpart, reply } => {
                self.select_thread(counterpart, reply);
            }
            Command::SetTyping { to, is_typing } => self.set_typing(to, is_typing),
            Command::Conversations { reply } => {
                let _ = reply.send(self.conversations.entries().to_vec());
            }
            Command::Thread { reply } => {
                let _ = reply.send((self.selected, self.thread.clone()));
            }
            Command::IsOnline { id, reply } => {
                let _ = reply.send(self.tracker.is_online(id));
            }
            Command::IsTyping { id, reply } => {
                let _ = reply.send(self.tracker.is_typing_at(id, Instant::now()));
            }
        }
    }

    fn select_thread(
        &mut self,
        counterpart: Uuid,
        reply: oneshot::Sender<Result<Vec<Message>>>,
    ) {
        // Any typing signal this viewer still owes is cleared on navigation.
        let owed: Vec<Uuid> = self.typing_idle.drain().map(|(to, _)| to).collect();
        for to in owed {
            self.broadcast_typing(to, false);
        }

        if let Some(stale) = self.pending.take()
            && let Some(stale_reply) = stale.reply
        {
            self.metrics.stale_fetches_total.add(1, &[]);
            let _ = stale_reply.send(Err(AppError::StaleSelection));
        }

        self.selected = Some(counterpart);
        self.thread.clear();
        self.notify(Update::ThreadUpdated { counterpart });
        self.spawn_thread_fetch(counterpart, Some(reply));
    }

    fn set_typing(&mut self, to: Uuid, is_typing: bool) {
        if is_typing {
            self.typing_idle.insert(to, Instant::now() + self.idle_timeout);
        } else {
            self.typing_idle.remove(&to);
        }
        self.broadcast_typing(to, is_typing);
    }

    fn broadcast_typing(&self, to: Uuid, is_typing: bool) {
        let signal = TypingSignal { from: self.me, to, is_typing };
        self.metrics.typing_signals_total.add(1, &[]);
        // Fire-and-forget: a dropped signal degrades to "not shown as
        // typing" on the far side, so failure is not surfaced. The publish
        // runs off the event loop so a slow transport cannot stall it.
        let transport = Arc::clone(&self.transport);
        let scope = self.scope.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.send_signal(&scope, signal).await {
                tracing::debug!(error = %e, "Typing broadcast failed");
            }
        });
    }

    fn handle_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::ThreadFetched { counterpart, seq, result } => {
                self.apply_thread_fetch(counterpart, seq, result);
            }
            TaskEvent::ConversationsLoaded { result } => match result {
                Ok(summaries) => {
                    self.apply_conversations(summaries);
                }
                Err(e) => {
                    // The list is a cache, not an action result; the next
                    // resync retries.
                    tracing::debug!(error = %e, "Conversation refetch failed");
                }
            },
            TaskEvent::ProfilesResolved { cards } => {
                if cards.is_empty() {
                    return;
                }
                for card in cards {
                    self.conversations.decorate(card);
                }
                self.notify(Update::ConversationsChanged);
            }
        }
    }

    fn apply_thread_fetch(
        &mut self,
        counterpart: Uuid,
        seq: u64,
        result: Result<Vec<Message>>,
    ) {
        let Some(pending) = self.pending.take() else {
            self.discard_stale_fetch(counterpart);
            return;
        };
        if pending.seq != seq
            || pending.counterpart != counterpart
            || self.selected != Some(counterpart)
        {
            self.pending = Some(pending);
            self.discard_stale_fetch(counterpart);
            return;
        }

        match result {
            Ok(fetched) => {
                // The snapshot and the live feed may both have delivered the
                // same message while the fetch was outstanding; the live
                // arrivals are folded in keyed by id.
                let live = std::mem::take(&mut self.thread);
                let mut merged = fetched;
                for msg in live {
                    message::insert_ordered(&mut merged, msg);
                }
                self.metrics.thread_fetch_size.record(merged.len() as u64, &[]);
                self.thread = merged;

                self.mark_visible_read(counterpart);
                self.conversations.clear_unread(counterpart);
                self.notify(Update::ThreadUpdated { counterpart });
                self.notify(Update::ConversationsChanged);

                if let Some(reply) = pending.reply {
                    let _ = reply.send(Ok(self.thread.clone()));
                }
            }
            Err(e) => {
                if let Some(reply) = pending.reply {
                    let _ = reply.send(Err(e));
                } else {
                    tracing::debug!(error = %e, "Thread refetch failed");
                }
            }
        }
    }

    fn discard_stale_fetch(&mut self, counterpart: Uuid) {
        // Not an error: the user navigated away before the fetch resolved.
        self.metrics.stale_fetches_total.add(1, &[]);
        tracing::trace!(%counterpart, "Discarded stale thread fetch");
    }

    fn apply_conversations(&mut self, summaries: Vec<ConversationSummary>) {
        let existing: HashMap<Uuid, ProfileCard> = self
            .conversations
            .entries()
            .iter()
            .filter(|c| !c.counterpart.is_placeholder())
            .map(|c| (c.counterpart.id, c.counterpart.clone()))
            .collect();

        self.conversations.replace(summaries, |id| {
            existing.get(&id).cloned().unwrap_or_else(|| ProfileCard::placeholder(id))
        });

        // The open thread stays visible through a resync, so its unread
        // count never resurfaces even if the mark-read write is in flight.
        if let Some(selected) = self.selected {
            self.conversations.clear_unread(selected);
        }
        self.notify(Update::ConversationsChanged);
        self.resolve_missing_profiles();
    }

    fn handle_change(&mut self, change: RowChange) {
        match change.op {
            ChangeOp::Insert => self.handle_insert(change.row),
            ChangeOp::Update => self.handle_row_update(change.row),
            ChangeOp::Delete => {
                tracing::trace!("Ignoring delete on the messages feed");
            }
        }
    }

    fn handle_insert(&mut self, row: Message) {
        if !row.involves(self.me) {
            // The subscription filter should have excluded this already.
            tracing::trace!(message_id = %row.id, "Insert does not involve this viewer");
            return;
        }
        self.metrics.live_inserts_total.add(1, &[]);
        let partner = row.counterpart_of(self.me);

        if self.selected == Some(partner) {
            if message::insert_ordered(&mut self.thread, row.clone()) {
                if row.recipient_id == self.me {
                    // The thread is open and visible, so the message is read
                    // the moment it lands.
                    self.mark_visible_read(partner);
                }
                self.notify(Update::ThreadUpdated { counterpart: partner });
            }
        }

        if let Some(needs_profile) = self.conversations.apply_insert(self.me, &row, self.selected) {
            self.spawn_profile_lookup(vec![needs_profile]);
        }
        self.notify(Update::ConversationsChanged);
    }

    fn handle_row_update(&mut self, row: Message) {
        // Read receipts: a counterpart marking our messages read shows up as
        // row updates; only the open thread renders them.
        if self.selected == Some(row.counterpart_of(self.me))
            && let Some(existing) = self.thread.iter_mut().find(|m| m.id == row.id)
        {
            let counterpart = row.counterpart_of(self.me);
            *existing = row;
            self.notify(Update::ThreadUpdated { counterpart });
        }
    }

    fn handle_typing_signal(&mut self, signal: TypingSignal) {
        if self.tracker.on_typing_signal(signal, Instant::now()) {
            self.notify(Update::TypingChanged { user: signal.from, is_typing: signal.is_typing });
        }
    }

    fn handle_deadline(&mut self) {
        let now = Instant::now();

        for user in self.tracker.sweep_expired(now) {
            self.notify(Update::TypingChanged { user, is_typing: false });
        }

        let idle: Vec<Uuid> = self
            .typing_idle
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(to, _)| *to)
            .collect();
        for to in idle {
            self.typing_idle.remove(&to);
            self.broadcast_typing(to, false);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let idle = self.typing_idle.values().min().copied();
        match (self.tracker.next_expiry(), idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Marks every unread incoming message in the open thread read, both
    /// locally and durably. The durable write is fire-and-forget; it is
    /// idempotent and a failure self-heals on the next selection.
    fn mark_visible_read(&mut self, counterpart: Uuid) {
        let now = OffsetDateTime::now_utc();
        let mut any = false;
        for msg in &mut self.thread {
            if msg.recipient_id == self.me && msg.read_at.is_none() {
                msg.read_at = Some(now);
                any = true;
            }
        }
        if any {
            let store = Arc::clone(&self.store);
            let me = self.me;
            tokio::spawn(async move {
                if let Err(e) = store.mark_thread_read(me, counterpart).await {
                    tracing::warn!(error = %e, "Failed to persist read receipts");
                }
            });
        }
    }

    fn resync(&mut self) {
        self.metrics.resyncs_total.add(1, &[]);
        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        let me = self.me;
        tokio::spawn(async move {
            let result = store.fetch_conversations(me).await;
            let _ = events.send(TaskEvent::ConversationsLoaded { result }).await;
        });
    }

    fn spawn_thread_fetch(
        &mut self,
        counterpart: Uuid,
        reply: Option<oneshot::Sender<Result<Vec<Message>>>>,
    ) {
        self.fetch_seq += 1;
        let seq = self.fetch_seq;
        // A refetch of the still-selected thread answers the original
        // selection, so any waiting caller is carried over to the new fetch.
        let reply = reply.or_else(|| {
            self.pending
                .take()
                .filter(|p| p.counterpart == counterpart)
                .and_then(|p| p.reply)
        });
        self.pending = Some(PendingFetch { seq, counterpart, reply });

        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        let me = self.me;
        tokio::spawn(async move {
            let result = store.fetch_thread(me, counterpart).await;
            let _ = events.send(TaskEvent::ThreadFetched { counterpart, seq, result }).await;
        });
    }

    fn spawn_profile_lookup(&self, ids: Vec<Uuid>) {
        if ids.is_empty() {
            return;
        }
        let profiles = Arc::clone(&self.profiles);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            match profiles.lookup(&ids).await {
                Ok(cards) => {
                    let _ = events.send(TaskEvent::ProfilesResolved { cards }).await;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Profile lookup failed, placeholders remain");
                }
            }
        });
    }

    fn resolve_missing_profiles(&self) {
        let missing: Vec<Uuid> = self
            .conversations
            .entries()
            .iter()
            .filter(|c| c.counterpart.is_placeholder())
            .map(|c| c.counterpart.id)
            .collect();
        self.spawn_profile_lookup(missing);
    }

    fn notify(&self, update: Update) {
        // No observers is fine.
        let _ = self.updates.send(update);
    }
}
