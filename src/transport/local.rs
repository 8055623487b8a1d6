use crate::domain::presence::{PresenceEvent, TypingSignal};
use crate::error::Result;
use crate::transport::{ChannelTransport, ConnectionState, RowChange};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const PRESENCE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
struct Scope {
    members: Mutex<HashSet<Uuid>>,
    events: broadcast::Sender<PresenceEvent>,
    signals: broadcast::Sender<TypingSignal>,
}

impl Scope {
    fn new() -> Self {
        Self {
            members: Mutex::new(HashSet::new()),
            events: broadcast::channel(PRESENCE_CHANNEL_CAPACITY).0,
            signals: broadcast::channel(PRESENCE_CHANNEL_CAPACITY).0,
        }
    }
}

/// In-process fan-out hub implementing the full transport contract. One hub
/// is shared by every session participating in a test or demo; each session
/// holds its own [`LocalTransport`] handle with an independent connection
/// state.
#[derive(Debug, Default)]
pub struct LocalHub {
    changes: DashMap<Uuid, broadcast::Sender<RowChange>>,
    scopes: DashMap<String, Arc<Scope>>,
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a session handle bound to this hub.
    #[must_use]
    pub fn transport(self: &Arc<Self>) -> LocalTransport {
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        LocalTransport { hub: Arc::clone(self), connection_tx: Arc::new(tx), connection_rx: rx }
    }

    fn change_sender(&self, participant: Uuid) -> broadcast::Sender<RowChange> {
        self.changes
            .entry(participant)
            .or_insert_with(|| broadcast::channel(CHANGE_CHANNEL_CAPACITY).0)
            .value()
            .clone()
    }

    fn scope(&self, name: &str) -> Arc<Scope> {
        self.scopes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Scope::new()))
            .value()
            .clone()
    }

    fn fan_out(&self, change: &RowChange) {
        let mut targets = vec![change.row.sender_id];
        if change.row.recipient_id != change.row.sender_id {
            targets.push(change.row.recipient_id);
        }
        for participant in targets {
            if let Some(tx) = self.changes.get(&participant) {
                // Nobody listening is fine; the feed is at-most-once anyway.
                let _ = tx.send(change.clone());
            }
        }
    }
}

/// One session's view of a [`LocalHub`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    hub: Arc<LocalHub>,
    connection_tx: Arc<watch::Sender<ConnectionState>>,
    connection_rx: watch::Receiver<ConnectionState>,
}

impl LocalTransport {
    /// Drops the simulated connection. Events published while disconnected
    /// are still fanned out by the hub; a real client would miss them, so
    /// tests pair this with a later [`Self::simulate_reconnect`] to exercise
    /// the resync backstop.
    pub fn simulate_disconnect(&self) {
        let _ = self.connection_tx.send(ConnectionState::Disconnected);
    }

    /// Restores the simulated connection and replays a presence `Sync` for
    /// every scope, matching the hosted service's reconnect behavior.
    pub fn simulate_reconnect(&self) {
        let _ = self.connection_tx.send(ConnectionState::Connected);
        for entry in &self.hub.scopes {
            let members = entry
                .value()
                .members
                .lock()
                .map(|m| m.clone())
                .unwrap_or_default();
            let _ = entry.value().events.send(PresenceEvent::Sync(members));
        }
    }
}

#[async_trait]
impl ChannelTransport for LocalTransport {
    async fn subscribe_changes(
        &self,
        participant: Uuid,
    ) -> Result<broadcast::Receiver<RowChange>> {
        Ok(self.hub.change_sender(participant).subscribe())
    }

    async fn publish_change(&self, change: RowChange) -> Result<()> {
        self.hub.fan_out(&change);
        Ok(())
    }

    async fn track(&self, scope: &str, key: Uuid) -> Result<broadcast::Receiver<PresenceEvent>> {
        let scope = self.hub.scope(scope);
        let rx = scope.events.subscribe();

        let snapshot = {
            let mut members = scope
                .members
                .lock()
                .map_err(|_| crate::error::AppError::Transport("presence scope poisoned".into()))?;
            members.insert(key);
            members.clone()
        };
        let _ = scope.events.send(PresenceEvent::Join(key));
        let _ = scope.events.send(PresenceEvent::Sync(snapshot));
        Ok(rx)
    }

    async fn leave(&self, scope: &str, key: Uuid) -> Result<()> {
        let scope = self.hub.scope(scope);
        if let Ok(mut members) = scope.members.lock() {
            members.remove(&key);
        }
        let _ = scope.events.send(PresenceEvent::Leave(key));
        Ok(())
    }

    async fn send_signal(&self, scope: &str, signal: TypingSignal) -> Result<()> {
        let _ = self.hub.scope(scope).signals.send(signal);
        Ok(())
    }

    async fn signals(&self, scope: &str) -> Result<broadcast::Receiver<TypingSignal>> {
        Ok(self.hub.scope(scope).signals.subscribe())
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection_rx.clone()
    }
}
