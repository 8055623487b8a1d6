use crate::domain::message::Message;
use crate::domain::presence::{PresenceEvent, TypingSignal};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

pub mod local;
pub mod redis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One row-change event from the durable store's feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowChange {
    pub op: ChangeOp,
    pub row: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// The publish/subscribe channel the coordinator is layered over.
///
/// Delivery guarantees assumed by everything upstream: at-most-once, commit
/// order within a single change subscription, no ordering across channels,
/// and a full presence re-sync after reconnect. Missed durable inserts are
/// reconciled by the coordinator's reconnect refetch, not by the transport.
#[async_trait]
pub trait ChannelTransport: Send + Sync + std::fmt::Debug {
    /// Subscribes to row changes on the messages feed where the given
    /// participant is sender or recipient.
    async fn subscribe_changes(&self, participant: Uuid) -> Result<broadcast::Receiver<RowChange>>;

    /// Feeds one row change into the fan-out. In a hosted deployment this is
    /// the backend's side of the wire; clients only consume.
    async fn publish_change(&self, change: RowChange) -> Result<()>;

    /// Attaches `key` to the presence scope and returns its event stream.
    /// A `Sync` carrying the full member set is delivered at least once
    /// shortly after subscribing.
    async fn track(&self, scope: &str, key: Uuid) -> Result<broadcast::Receiver<PresenceEvent>>;

    /// Detaches `key` from the presence scope.
    async fn leave(&self, scope: &str, key: Uuid) -> Result<()>;

    /// Fire-and-forget broadcast to everyone sharing the scope. No
    /// acknowledgment, no delivery guarantee.
    async fn send_signal(&self, scope: &str, signal: TypingSignal) -> Result<()>;

    /// Subscribes to the scope's broadcast signals.
    async fn signals(&self, scope: &str) -> Result<broadcast::Receiver<TypingSignal>>;

    /// Connection-state watch; a `Disconnected -> Connected` transition is
    /// the upstream trigger for a full resync.
    fn connection(&self) -> watch::Receiver<ConnectionState>;
}
