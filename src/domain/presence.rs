use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ephemeral presence event delivered by the transport for a shared scope.
///
/// `Sync` replaces the online set wholesale and is guaranteed to arrive at
/// least once right after subscribing; `Join`/`Leave` are incremental.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Sync(std::collections::HashSet<Uuid>),
    Join(Uuid),
    Leave(Uuid),
}

/// Fire-and-forget typing signal broadcast to everyone sharing the scope.
/// The transport does not filter per recipient; receivers drop signals whose
/// `to` is not their own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub from: Uuid,
    pub to: Uuid,
    pub is_typing: bool,
}
