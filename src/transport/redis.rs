use crate::config::PubSubConfig;
use crate::domain::presence::{PresenceEvent, TypingSignal};
use crate::error::{AppError, Result};
use crate::transport::{ChannelTransport, ConnectionState, RowChange};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::Instrument;
use uuid::Uuid;

/// How long a member stays in the presence set without a heartbeat refresh.
/// Covers clients that crash without calling `leave`.
const PRESENCE_TTL_SECS: i64 = 60;
const PRESENCE_HEARTBEAT: Duration = Duration::from_secs(20);

/// Incremental presence membership event on the wire. The full-state `Sync`
/// is never broadcast; each subscriber reads the membership set itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum PresenceWireEvent {
    Join(Uuid),
    Leave(Uuid),
}

/// Transport contract implemented over Redis pub/sub. Row changes and typing
/// signals are JSON payloads on per-participant and per-scope channels.
/// Presence membership lives in a Redis sorted set scored by last-heartbeat
/// time, so subscribers can build a `Sync` from the live window and a
/// crashed client ages out after [`PRESENCE_TTL_SECS`].
#[derive(Debug)]
pub struct RedisTransport {
    publisher: ConnectionManager,
    client: redis::Client,
    prefix: String,
    channel_capacity: usize,
    changes: Arc<DashMap<Uuid, broadcast::Sender<RowChange>>>,
    presence: Arc<DashMap<String, broadcast::Sender<PresenceEvent>>>,
    signals: Arc<DashMap<String, broadcast::Sender<TypingSignal>>>,
    heartbeats: DashMap<(String, Uuid), tokio::task::JoinHandle<()>>,
    connection_tx: Arc<watch::Sender<ConnectionState>>,
    connection_rx: watch::Receiver<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

impl RedisTransport {
    /// Connects to Redis and returns a transport handle.
    ///
    /// # Errors
    /// Returns an error if the initial connection fails.
    pub async fn new(config: &PubSubConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<Arc<Self>> {
        let client = redis::Client::open(config.url.as_str())?;
        let publisher = (|| client.get_connection_manager())
            .retry(ExponentialBuilder::default())
            .notify(|err, dur| tracing::warn!(error = %err, retry_in = ?dur, "Redis connect failed"))
            .await?;

        let (connection_tx, connection_rx) = watch::channel(ConnectionState::Connected);

        Ok(Arc::new(Self {
            publisher,
            client,
            prefix: config.channel_prefix.clone(),
            channel_capacity: config.channel_capacity,
            changes: Arc::new(DashMap::new()),
            presence: Arc::new(DashMap::new()),
            signals: Arc::new(DashMap::new()),
            heartbeats: DashMap::new(),
            connection_tx: Arc::new(connection_tx),
            connection_rx,
            shutdown,
        }))
    }

    fn changes_channel(&self, participant: Uuid) -> String {
        format!("{}:changes:{participant}", self.prefix)
    }

    fn presence_channel(&self, scope: &str) -> String {
        format!("{}:presence:{scope}", self.prefix)
    }

    fn members_key(&self, scope: &str) -> String {
        format!("{}:presence:{scope}:members", self.prefix)
    }

    fn typing_channel(&self, scope: &str) -> String {
        format!("{}:typing:{scope}", self.prefix)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, i64>(channel, payload)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Starts a background listener for one concrete channel, feeding decoded
    /// events into `tx`. The listener reconnects with exponential backoff and
    /// reports connection transitions on the watch; `on_subscribed` runs
    /// after every successful subscribe, including reconnects. Returns once
    /// the first subscribe has completed, so nothing published after this
    /// resolves can be missed.
    async fn spawn_listener<T, D, S, Fut>(
        &self,
        channel: String,
        tx: broadcast::Sender<T>,
        decode: D,
        on_subscribed: S,
    ) where
        T: Clone + Send + 'static,
        D: Fn(&[u8]) -> Option<T> + Send + 'static,
        S: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let client = self.client.clone();
        let shutdown = self.shutdown.clone();
        let connection_tx = Arc::clone(&self.connection_tx);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(
            run_channel_listener(
                client,
                channel.clone(),
                tx,
                decode,
                on_subscribed,
                shutdown,
                connection_tx,
                ready_tx,
            )
            .instrument(tracing::info_span!("redis_channel_listener", channel = %channel)),
        );

        // Wait for the listener to be ready (subscribed).
        let _ = ready_rx.await;
    }

    /// Periodically re-scores this member in the presence set so it stays
    /// inside the liveness window. Aborted on `leave`.
    fn spawn_heartbeat(&self, scope: &str, key: Uuid) {
        let mut conn = self.publisher.clone();
        let members_key = self.members_key(scope);
        let member = key.to_string();
        let mut shutdown = self.shutdown.clone();

        let handle = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(PRESENCE_HEARTBEAT) => {
                            let score = OffsetDateTime::now_utc().unix_timestamp();
                            if let Err(e) =
                                conn.zadd::<_, _, _, ()>(&members_key, &member, score).await
                            {
                                tracing::debug!(error = %e, "Presence heartbeat failed");
                            }
                        }
                        _ = shutdown.changed() => return,
                    }
                }
            }
            .instrument(tracing::debug_span!("presence_heartbeat", key = %key)),
        );

        if let Some(old) = self.heartbeats.insert((scope.to_string(), key), handle) {
            old.abort();
        }
    }
}

/// Prunes members whose heartbeat fell out of the liveness window and
/// returns the ones still inside it.
async fn read_members(
    mut conn: ConnectionManager,
    key: &str,
) -> redis::RedisResult<HashSet<Uuid>> {
    let cutoff = OffsetDateTime::now_utc().unix_timestamp() - PRESENCE_TTL_SECS;
    let () = conn.zrembyscore(key, "-inf", cutoff).await?;
    let members: Vec<String> = conn.zrangebyscore(key, cutoff, "+inf").await?;
    Ok(members.iter().filter_map(|m| Uuid::parse_str(m).ok()).collect())
}

#[allow(clippy::too_many_arguments)]
async fn run_channel_listener<T, D, S, Fut>(
    client: redis::Client,
    channel: String,
    tx: broadcast::Sender<T>,
    decode: D,
    on_subscribed: S,
    mut shutdown: watch::Receiver<bool>,
    connection_tx: Arc<watch::Sender<ConnectionState>>,
    ready_tx: oneshot::Sender<()>,
) where
    T: Clone + Send + 'static,
    D: Fn(&[u8]) -> Option<T> + Send + 'static,
    S: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(30);
    let mut ready_tx = Some(ready_tx);

    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(ps) => ps,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to open pubsub, retrying in {:?}", backoff);
                let _ = connection_tx.send(ConnectionState::Disconnected);
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {
                        backoff = std::cmp::min(backoff * 2, max_backoff);
                        continue;
                    }
                    _ = shutdown.changed() => return,
                }
            }
        };

        if let Err(e) = pubsub.subscribe(&channel).await {
            tracing::warn!(error = %e, "Failed to subscribe to {}, retrying in {:?}", channel, backoff);
            let _ = connection_tx.send(ConnectionState::Disconnected);
            tokio::select! {
                () = tokio::time::sleep(backoff) => {
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                    continue;
                }
                _ = shutdown.changed() => return,
            }
        }

        tracing::debug!(channel = %channel, "Subscribed");
        let _ = connection_tx.send(ConnectionState::Connected);
        // Runs on every (re)subscribe; presence channels use it to re-emit
        // a full-state Sync, which the coordinator's reconnect reset needs.
        on_subscribed().await;
        if let Some(rtx) = ready_tx.take() {
            let _ = rtx.send(());
        }
        backoff = Duration::from_secs(1);

        let mut stream = pubsub.into_on_message();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                msg = stream.next() => {
                    if let Some(msg) = msg {
                        let payload: Vec<u8> = msg.get_payload().unwrap_or_default();
                        if let Some(event) = decode(&payload) {
                            let _ = tx.send(event);
                        } else {
                            tracing::warn!(channel = %channel, "Dropping undecodable payload");
                        }
                    } else {
                        tracing::warn!(channel = %channel, "Pubsub connection lost, reconnecting");
                        let _ = connection_tx.send(ConnectionState::Disconnected);
                        break;
                    }
                }
            }
        }

        if *shutdown.borrow() {
            return;
        }
    }
}

#[async_trait]
impl ChannelTransport for RedisTransport {
    async fn subscribe_changes(&self, participant: Uuid) -> Result<broadcast::Receiver<RowChange>> {
        if let Some(tx) = self.changes.get(&participant) {
            return Ok(tx.subscribe());
        }
        let (tx, rx) = broadcast::channel(self.channel_capacity);
        self.changes.insert(participant, tx.clone());
        self.spawn_listener(
            self.changes_channel(participant),
            tx,
            |payload| serde_json::from_slice::<RowChange>(payload).ok(),
            || std::future::ready(()),
        )
        .await;
        Ok(rx)
    }

    async fn publish_change(&self, change: RowChange) -> Result<()> {
        let payload = serde_json::to_vec(&change)
            .map_err(|e| AppError::Transport(e.to_string()))?;

        self.publish(&self.changes_channel(change.row.sender_id), &payload).await?;
        if change.row.recipient_id != change.row.sender_id {
            self.publish(&self.changes_channel(change.row.recipient_id), &payload).await?;
        }
        Ok(())
    }

    async fn track(&self, scope: &str, key: Uuid) -> Result<broadcast::Receiver<PresenceEvent>> {
        let existing = self.presence.get(scope).map(|entry| entry.value().clone());
        let (tx, rx) = match existing {
            Some(tx) => {
                let rx = tx.subscribe();
                (tx, rx)
            }
            None => {
                let (tx, rx) = broadcast::channel(self.channel_capacity);
                self.presence.insert(scope.to_string(), tx.clone());

                // Wire listener forwards remote join/leave into the local sender.
                let remote_tx = tx.clone();
                let (wire_tx, mut wire_rx) = broadcast::channel(self.channel_capacity);
                tokio::spawn(async move {
                    loop {
                        match wire_rx.recv().await {
                            Ok(PresenceWireEvent::Join(id)) => {
                                let _ = remote_tx.send(PresenceEvent::Join(id));
                            }
                            Ok(PresenceWireEvent::Leave(id)) => {
                                let _ = remote_tx.send(PresenceEvent::Leave(id));
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!(missed = n, "Presence wire listener lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });

                let resync_conn = self.publisher.clone();
                let resync_key = self.members_key(scope);
                let sync_tx = tx.clone();
                self.spawn_listener(
                    self.presence_channel(scope),
                    wire_tx,
                    |payload| serde_json::from_slice::<PresenceWireEvent>(payload).ok(),
                    move || {
                        let conn = resync_conn.clone();
                        let key = resync_key.clone();
                        let sync_tx = sync_tx.clone();
                        async move {
                            match read_members(conn, &key).await {
                                Ok(members) => {
                                    let _ = sync_tx.send(PresenceEvent::Sync(members));
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "Presence membership read failed");
                                }
                            }
                        }
                    },
                )
                .await;
                (tx, rx)
            }
        };

        let mut conn = self.publisher.clone();
        let score = OffsetDateTime::now_utc().unix_timestamp();
        let () = conn
            .zadd(self.members_key(scope), key.to_string(), score)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;
        self.spawn_heartbeat(scope, key);

        let payload = serde_json::to_vec(&PresenceWireEvent::Join(key))
            .map_err(|e| AppError::Transport(e.to_string()))?;
        self.publish(&self.presence_channel(scope), &payload).await?;

        let members = read_members(self.publisher.clone(), &self.members_key(scope))
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;
        let _ = tx.send(PresenceEvent::Sync(members));

        Ok(rx)
    }

    async fn leave(&self, scope: &str, key: Uuid) -> Result<()> {
        if let Some((_, handle)) = self.heartbeats.remove(&(scope.to_string(), key)) {
            handle.abort();
        }

        let mut conn = self.publisher.clone();
        let () = conn
            .zrem(self.members_key(scope), key.to_string())
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;

        let payload = serde_json::to_vec(&PresenceWireEvent::Leave(key))
            .map_err(|e| AppError::Transport(e.to_string()))?;
        self.publish(&self.presence_channel(scope), &payload).await
    }

    async fn send_signal(&self, scope: &str, signal: TypingSignal) -> Result<()> {
        let payload = serde_json::to_vec(&signal)
            .map_err(|e| AppError::Transport(e.to_string()))?;
        self.publish(&self.typing_channel(scope), &payload).await
    }

    async fn signals(&self, scope: &str) -> Result<broadcast::Receiver<TypingSignal>> {
        if let Some(tx) = self.signals.get(scope) {
            return Ok(tx.subscribe());
        }
        let (tx, rx) = broadcast::channel(self.channel_capacity);
        self.signals.insert(scope.to_string(), tx.clone());
        self.spawn_listener(
            self.typing_channel(scope),
            tx,
            |payload| serde_json::from_slice::<TypingSignal>(payload).ok(),
            || std::future::ready(()),
        )
        .await;
        Ok(rx)
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection_rx.clone()
    }
}
