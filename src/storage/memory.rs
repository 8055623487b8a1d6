use crate::domain::conversation::{self, ConversationSummary};
use crate::domain::message::{self, Message};
use crate::error::{AppError, Result};
use crate::storage::MessageStore;
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use uuid::Uuid;

/// In-memory message store: the reference semantics for [`MessageStore`] and
/// the durable half of the test harness.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<Vec<Message>>,
    fail_writes: AtomicBool,
}

impl InMemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with a generic `Write` error,
    /// standing in for a store-level policy rejection or outage.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Message>>> {
        self.messages
            .lock()
            .map_err(|_| AppError::read(anyhow::anyhow!("store lock poisoned")))
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn send(&self, sender_id: Uuid, recipient_id: Uuid, content: &str) -> Result<Message> {
        let content = message::validate_outgoing(sender_id, recipient_id, content)?;

        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::write(anyhow::anyhow!("insert rejected by store policy")));
        }

        let stored = Message {
            id: Uuid::now_v7(),
            sender_id,
            recipient_id,
            content: content.to_string(),
            created_at: OffsetDateTime::now_utc(),
            read_at: None,
        };
        self.lock()?.push(stored.clone());
        Ok(stored)
    }

    async fn fetch_thread(&self, me: Uuid, counterpart: Uuid) -> Result<Vec<Message>> {
        let mut thread: Vec<Message> = self
            .lock()?
            .iter()
            .filter(|m| {
                (m.sender_id == me && m.recipient_id == counterpart)
                    || (m.sender_id == counterpart && m.recipient_id == me)
            })
            .cloned()
            .collect();
        thread.sort_by_key(|m| m.created_at);
        Ok(thread)
    }

    async fn mark_thread_read(&self, me: Uuid, counterpart: Uuid) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        for m in self.lock()?.iter_mut() {
            if m.recipient_id == me && m.sender_id == counterpart && m.read_at.is_none() {
                m.read_at = Some(now);
            }
        }
        Ok(())
    }

    async fn fetch_conversations(&self, me: Uuid) -> Result<Vec<ConversationSummary>> {
        let messages = self.lock()?.clone();
        Ok(conversation::summarize(me, &messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_assigns_id_and_timestamp() {
        let store = InMemoryMessageStore::new();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);

        let stored = store.send(a, b, "  hello  ").await.expect("send");
        assert_eq!(stored.content, "hello");
        assert!(stored.read_at.is_none());

        let thread = store.fetch_thread(a, b).await.expect("fetch");
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].id, stored.id);
    }

    #[tokio::test]
    async fn test_mark_thread_read_is_idempotent() {
        let store = InMemoryMessageStore::new();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);

        store.send(b, a, "one").await.expect("send");
        store.send(b, a, "two").await.expect("send");

        store.mark_thread_read(a, b).await.expect("mark");
        let first: Vec<_> = store
            .fetch_thread(a, b)
            .await
            .expect("fetch")
            .iter()
            .map(|m| m.read_at)
            .collect();
        assert!(first.iter().all(Option::is_some));

        store.mark_thread_read(a, b).await.expect("mark again");
        let second: Vec<_> = store
            .fetch_thread(a, b)
            .await
            .expect("fetch")
            .iter()
            .map(|m| m.read_at)
            .collect();
        assert_eq!(first, second, "second call must not touch timestamps");
    }

    #[tokio::test]
    async fn test_mark_thread_read_leaves_other_directions_alone() {
        let store = InMemoryMessageStore::new();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);

        store.send(b, a, "to me").await.expect("send");
        store.send(a, b, "from me").await.expect("send");

        store.mark_thread_read(a, b).await.expect("mark");
        let thread = store.fetch_thread(a, b).await.expect("fetch");
        let from_me = thread.iter().find(|m| m.sender_id == a).expect("own message");
        assert!(from_me.read_at.is_none(), "own outgoing message must stay unread");
    }

    #[tokio::test]
    async fn test_failed_write_surfaces_write_error() {
        let store = InMemoryMessageStore::new();
        store.set_fail_writes(true);
        let err = store
            .send(Uuid::from_u128(1), Uuid::from_u128(2), "hi")
            .await
            .expect_err("write should fail");
        assert!(matches!(err, AppError::Write(_)));
    }
}
