use crate::domain::conversation::ConversationSummary;
use crate::domain::message::Message;
use crate::error::Result;
use crate::storage::MessageStore;
use crate::transport::{ChangeOp, ChannelTransport, RowChange};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Store wrapper that models the hosted backend's change feed: after a
/// successful durable insert it publishes the stored row to the transport.
///
/// The wrapped adapter itself never notifies anyone; this is the backend's
/// side of the wire, used by deployments (and tests) without a
/// database-native feed. A feed publish failure is logged and swallowed:
/// the write succeeded, and the reconnect resync is the correctness
/// backstop for a missed event.
#[derive(Debug)]
pub struct FeedStore {
    inner: Arc<dyn MessageStore>,
    transport: Arc<dyn ChannelTransport>,
}

impl FeedStore {
    #[must_use]
    pub fn new(inner: Arc<dyn MessageStore>, transport: Arc<dyn ChannelTransport>) -> Self {
        Self { inner, transport }
    }
}

#[async_trait]
impl MessageStore for FeedStore {
    async fn send(&self, sender_id: Uuid, recipient_id: Uuid, content: &str) -> Result<Message> {
        let stored = self.inner.send(sender_id, recipient_id, content).await?;

        let change = RowChange { op: ChangeOp::Insert, row: stored.clone() };
        if let Err(e) = self.transport.publish_change(change).await {
            tracing::warn!(error = %e, message_id = %stored.id, "Change feed publish failed");
        }
        Ok(stored)
    }

    async fn fetch_thread(&self, me: Uuid, counterpart: Uuid) -> Result<Vec<Message>> {
        self.inner.fetch_thread(me, counterpart).await
    }

    async fn mark_thread_read(&self, me: Uuid, counterpart: Uuid) -> Result<()> {
        self.inner.mark_thread_read(me, counterpart).await
    }

    async fn fetch_conversations(&self, me: Uuid) -> Result<Vec<ConversationSummary>> {
        self.inner.fetch_conversations(me).await
    }
}
