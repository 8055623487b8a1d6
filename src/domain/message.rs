use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A direct message between two participants. Immutable once stored, except
/// for the one-shot `read_at` transition performed by the recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub read_at: Option<OffsetDateTime>,
}

impl Message {
    /// The other participant of this message from `me`'s point of view.
    #[must_use]
    pub fn counterpart_of(&self, me: Uuid) -> Uuid {
        if self.sender_id == me { self.recipient_id } else { self.sender_id }
    }

    #[must_use]
    pub fn involves(&self, user: Uuid) -> bool {
        self.sender_id == user || self.recipient_id == user
    }

    #[must_use]
    pub const fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }
}

/// Validates an outgoing message before any network call.
///
/// Returns the trimmed content on success.
///
/// # Errors
/// Returns `AppError::Validation` for blank content or self-messaging.
pub fn validate_outgoing(sender: Uuid, recipient: Uuid, content: &str) -> Result<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("message content must not be empty"));
    }
    if sender == recipient {
        return Err(AppError::Validation("cannot send a message to yourself"));
    }
    Ok(trimmed)
}

/// Inserts `message` into a thread ordered ascending by `created_at`,
/// skipping it if a message with the same id is already present.
///
/// Live inserts almost always land at the tail, but the position is derived
/// from `created_at` rather than arrival order so an out-of-order delivery
/// cannot corrupt the thread. Ties keep arrival order.
pub fn insert_ordered(thread: &mut Vec<Message>, message: Message) -> bool {
    if thread.iter().any(|m| m.id == message.id) {
        return false;
    }
    let pos = thread
        .iter()
        .rposition(|m| m.created_at <= message.created_at)
        .map_or(0, |i| i + 1);
    thread.insert(pos, message);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn msg(id: u128, at_secs: i64) -> Message {
        Message {
            id: Uuid::from_u128(id),
            sender_id: Uuid::from_u128(1),
            recipient_id: Uuid::from_u128(2),
            content: "hi".to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH + Duration::seconds(at_secs),
            read_at: None,
        }
    }

    #[test]
    fn test_validate_rejects_blank_and_self() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);

        assert!(matches!(validate_outgoing(a, b, "   \n"), Err(AppError::Validation(_))));
        assert!(matches!(validate_outgoing(a, a, "hello"), Err(AppError::Validation(_))));
        assert_eq!(validate_outgoing(a, b, "  hello ").expect("valid"), "hello");
    }

    #[test]
    fn test_insert_ordered_appends_in_arrival_order() {
        let mut thread = Vec::new();
        assert!(insert_ordered(&mut thread, msg(1, 10)));
        assert!(insert_ordered(&mut thread, msg(2, 20)));
        let ids: Vec<_> = thread.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![Uuid::from_u128(1), Uuid::from_u128(2)]);
    }

    #[test]
    fn test_insert_ordered_repairs_out_of_order_delivery() {
        let mut thread = Vec::new();
        insert_ordered(&mut thread, msg(2, 20));
        insert_ordered(&mut thread, msg(1, 10));
        let ids: Vec<_> = thread.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![Uuid::from_u128(1), Uuid::from_u128(2)]);
    }

    #[test]
    fn test_insert_ordered_dedupes_by_id() {
        let mut thread = Vec::new();
        assert!(insert_ordered(&mut thread, msg(1, 10)));
        assert!(!insert_ordered(&mut thread, msg(1, 10)));
        assert_eq!(thread.len(), 1);
    }
}
