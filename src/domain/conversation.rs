use crate::domain::message::Message;
use crate::domain::profile::ProfileCard;
use time::OffsetDateTime;
use uuid::Uuid;

/// Per-counterpart rollup of the message history, before profile decoration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub counterpart_id: Uuid,
    pub last_message: String,
    pub last_message_at: OffsetDateTime,
    pub unread_count: u64,
}

/// A conversation-list entry as shown to the viewer: the summary plus the
/// counterpart's display identity. Conversations are keyed by counterpart;
/// there is no persistent conversation entity.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub counterpart: ProfileCard,
    pub last_message: String,
    pub last_message_at: OffsetDateTime,
    pub unread_count: u64,
}

impl Conversation {
    fn from_summary(summary: ConversationSummary, card: ProfileCard) -> Self {
        Self {
            counterpart: card,
            last_message: summary.last_message,
            last_message_at: summary.last_message_at,
            unread_count: summary.unread_count,
        }
    }
}

/// Rolls the full message history of `me` up into one summary per distinct
/// counterpart, sorted descending by last activity.
///
/// `O(n)` over the messages involving `me`; only used for cold load and
/// reconnect resync. Live updates go through [`ConversationList::apply_insert`].
#[must_use]
pub fn summarize(me: Uuid, messages: &[Message]) -> Vec<ConversationSummary> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut by_counterpart: std::collections::HashMap<Uuid, ConversationSummary> =
        std::collections::HashMap::new();

    for message in messages.iter().filter(|m| m.involves(me)) {
        let counterpart_id = message.counterpart_of(me);
        let unread = u64::from(message.recipient_id == me && message.is_unread());

        match by_counterpart.get_mut(&counterpart_id) {
            Some(summary) => {
                summary.unread_count += unread;
                if message.created_at > summary.last_message_at {
                    summary.last_message = message.content.clone();
                    summary.last_message_at = message.created_at;
                }
            }
            None => {
                order.push(counterpart_id);
                by_counterpart.insert(
                    counterpart_id,
                    ConversationSummary {
                        counterpart_id,
                        last_message: message.content.clone(),
                        last_message_at: message.created_at,
                        unread_count: unread,
                    },
                );
            }
        }
    }

    let mut summaries: Vec<ConversationSummary> = order
        .into_iter()
        .filter_map(|id| by_counterpart.remove(&id))
        .collect();
    summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    summaries
}

/// The viewer's conversation list: an incrementally-patched materialized view
/// kept sorted most-recent-first. Rebuilt from scratch only on cold start and
/// reconnect resync.
#[derive(Debug, Default)]
pub struct ConversationList {
    entries: Vec<Conversation>,
}

impl ConversationList {
    /// Replaces the whole list from a fresh aggregation, decorating each
    /// entry with whatever profile card `resolve` can supply.
    pub fn replace<F>(&mut self, summaries: Vec<ConversationSummary>, mut resolve: F)
    where
        F: FnMut(Uuid) -> ProfileCard,
    {
        self.entries = summaries
            .into_iter()
            .map(|s| {
                let card = resolve(s.counterpart_id);
                Conversation::from_summary(s, card)
            })
            .collect();
    }

    #[must_use]
    pub fn entries(&self) -> &[Conversation] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies one live-delivered message: updates the affected entry's
    /// summary fields, bumps its unread count when the viewer received the
    /// message outside the currently-selected thread, and moves the entry to
    /// the head. Synthesizes a placeholder entry for a first-contact
    /// counterpart and returns its id so the caller can resolve the real
    /// profile lazily.
    pub fn apply_insert(
        &mut self,
        me: Uuid,
        message: &Message,
        selected: Option<Uuid>,
    ) -> Option<Uuid> {
        let counterpart_id = message.counterpart_of(me);
        let counts_as_unread =
            message.recipient_id == me && selected != Some(counterpart_id);

        if let Some(pos) = self.position(counterpart_id) {
            let mut entry = self.entries.remove(pos);
            entry.last_message = message.content.clone();
            entry.last_message_at = message.created_at;
            if counts_as_unread {
                entry.unread_count += 1;
            }
            self.entries.insert(0, entry);
            None
        } else {
            self.entries.insert(
                0,
                Conversation {
                    counterpart: ProfileCard::placeholder(counterpart_id),
                    last_message: message.content.clone(),
                    last_message_at: message.created_at,
                    unread_count: u64::from(counts_as_unread),
                },
            );
            Some(counterpart_id)
        }
    }

    /// Zeroes the unread count for `counterpart`. The `Unread -> Read`
    /// transition is one-directional; nothing ever re-raises a count except
    /// a new insert.
    pub fn clear_unread(&mut self, counterpart: Uuid) {
        if let Some(pos) = self.position(counterpart) {
            self.entries[pos].unread_count = 0;
        }
    }

    /// Swaps a placeholder display identity for a resolved one.
    pub fn decorate(&mut self, card: ProfileCard) {
        if let Some(pos) = self.position(card.id) {
            self.entries[pos].counterpart = card;
        }
    }

    #[must_use]
    pub fn unread_count(&self, counterpart: Uuid) -> u64 {
        self.position(counterpart)
            .map_or(0, |pos| self.entries[pos].unread_count)
    }

    fn position(&self, counterpart: Uuid) -> Option<usize> {
        self.entries.iter().position(|c| c.counterpart.id == counterpart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn me() -> Uuid {
        Uuid::from_u128(0xAA)
    }

    fn msg(id: u128, from: Uuid, to: Uuid, at_secs: i64, content: &str) -> Message {
        Message {
            id: Uuid::from_u128(id),
            sender_id: from,
            recipient_id: to,
            content: content.to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH + Duration::seconds(at_secs),
            read_at: None,
        }
    }

    #[test]
    fn test_summarize_groups_and_sorts_by_recency() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let messages = vec![
            msg(1, a, me(), 10, "from a"),
            msg(2, me(), a, 20, "to a"),
            msg(3, b, me(), 15, "from b"),
        ];

        let summaries = summarize(me(), &messages);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].counterpart_id, a);
        assert_eq!(summaries[0].last_message, "to a");
        assert_eq!(summaries[0].unread_count, 1);
        assert_eq!(summaries[1].counterpart_id, b);
        assert_eq!(summaries[1].unread_count, 1);
    }

    #[test]
    fn test_summarize_counts_only_unread_to_me() {
        let a = Uuid::from_u128(1);
        let mut read = msg(1, a, me(), 10, "seen");
        read.read_at = Some(OffsetDateTime::UNIX_EPOCH + Duration::seconds(11));
        let messages = vec![
            read,
            msg(2, a, me(), 12, "unseen"),
            msg(3, me(), a, 13, "mine"),
        ];

        let summaries = summarize(me(), &messages);
        assert_eq!(summaries[0].unread_count, 1);
    }

    #[test]
    fn test_apply_insert_moves_entry_to_head() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let c = Uuid::from_u128(3);

        let mut list = ConversationList::default();
        for (id, from, at) in [(1u128, a, 10i64), (2, b, 20), (3, c, 30)] {
            list.apply_insert(me(), &msg(id, from, me(), at, "hi"), None);
        }
        // A speaks again: [A, C, B].
        list.apply_insert(me(), &msg(4, a, me(), 40, "again"), None);

        let order: Vec<_> = list.entries().iter().map(|e| e.counterpart.id).collect();
        assert_eq!(order, vec![a, c, b]);
        assert_eq!(list.unread_count(a), 2);
    }

    #[test]
    fn test_apply_insert_skips_unread_for_selected_thread() {
        let a = Uuid::from_u128(1);
        let mut list = ConversationList::default();

        list.apply_insert(me(), &msg(1, a, me(), 10, "hi"), Some(a));
        assert_eq!(list.unread_count(a), 0);

        list.apply_insert(me(), &msg(2, a, me(), 20, "hi again"), None);
        assert_eq!(list.unread_count(a), 1);
    }

    #[test]
    fn test_apply_insert_for_own_message_never_counts_unread() {
        let a = Uuid::from_u128(1);
        let mut list = ConversationList::default();

        list.apply_insert(me(), &msg(1, me(), a, 10, "sent"), None);
        assert_eq!(list.unread_count(a), 0);
        assert_eq!(list.entries()[0].last_message, "sent");
    }

    #[test]
    fn test_apply_insert_synthesizes_placeholder_entry() {
        let a = Uuid::from_u128(1);
        let mut list = ConversationList::default();

        let needs_profile = list.apply_insert(me(), &msg(1, a, me(), 10, "hi"), None);
        assert_eq!(needs_profile, Some(a));
        assert!(list.entries()[0].counterpart.is_placeholder());

        list.decorate(ProfileCard {
            id: a,
            display_name: "Ada".to_string(),
            avatar_ref: None,
        });
        assert_eq!(list.entries()[0].counterpart.display_name, "Ada");
    }

    #[test]
    fn test_clear_unread_is_idempotent() {
        let a = Uuid::from_u128(1);
        let mut list = ConversationList::default();
        list.apply_insert(me(), &msg(1, a, me(), 10, "hi"), None);

        list.clear_unread(a);
        assert_eq!(list.unread_count(a), 0);
        list.clear_unread(a);
        assert_eq!(list.unread_count(a), 0);
    }
}
