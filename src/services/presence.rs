use crate::domain::presence::{PresenceEvent, TypingSignal};
use std::collections::{HashMap, HashSet};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// Tracks who is online and who is typing to `me`, driven purely by
/// transport signals. Holds no durable state; a transport reconnect resets
/// it wholesale.
///
/// Typing entries are dead-man's switches: each carries its own expiry
/// deadline, refreshed by every repeated signal and cleared immediately by
/// an explicit stop. Presence is best-effort; a dropped signal degrades to
/// "not shown as typing", never to a stuck indicator.
#[derive(Debug)]
pub struct PresenceTracker {
    me: Uuid,
    online: HashSet<Uuid>,
    typing: HashMap<Uuid, Instant>,
    expiry: Duration,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(me: Uuid, expiry: Duration) -> Self {
        Self { me, online: HashSet::new(), typing: HashMap::new(), expiry }
    }

    /// Applies one presence event from the transport. `Sync` replaces the
    /// online set wholesale; it arrives at least once after subscribing and
    /// again after every reconnect.
    pub fn on_presence_event(&mut self, event: PresenceEvent) {
        match event {
            PresenceEvent::Sync(members) => self.online = members,
            PresenceEvent::Join(id) => {
                self.online.insert(id);
            }
            PresenceEvent::Leave(id) => {
                self.online.remove(&id);
            }
        }
    }

    /// Applies one broadcast typing signal. The transport does not filter
    /// per recipient, so signals addressed to someone else are dropped here.
    /// Returns `true` if the typing state for the signal's sender changed.
    pub fn on_typing_signal(&mut self, signal: TypingSignal, now: Instant) -> bool {
        if signal.to != self.me {
            return false;
        }
        if signal.is_typing {
            let was_typing = self.is_typing_at(signal.from, now);
            self.typing.insert(signal.from, now + self.expiry);
            !was_typing
        } else {
            self.typing.remove(&signal.from).is_some()
        }
    }

    /// Removes entries whose deadline has passed, returning the senders that
    /// just expired.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .typing
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.typing.remove(id);
        }
        expired
    }

    /// The earliest outstanding typing deadline, if any. The coordinator
    /// sleeps until this instant to turn expiries into state-change events.
    #[must_use]
    pub fn next_expiry(&self) -> Option<Instant> {
        self.typing.values().min().copied()
    }

    /// Full reset, used when the transport reconnects.
    pub fn reset(&mut self) {
        self.online.clear();
        self.typing.clear();
    }

    #[must_use]
    pub fn is_online(&self, id: Uuid) -> bool {
        self.online.contains(&id)
    }

    /// Whether `id` is typing to `me` as of `now`. Deadline-checked, so the
    /// answer is correct even before the expiry sweep runs.
    #[must_use]
    pub fn is_typing_at(&self, id: Uuid, now: Instant) -> bool {
        self.typing.get(&id).is_some_and(|deadline| *deadline > now)
    }

    #[must_use]
    pub fn online_users(&self) -> &HashSet<Uuid> {
        &self.online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRY: Duration = Duration::from_secs(3);

    fn me() -> Uuid {
        Uuid::from_u128(0xAA)
    }

    fn typing(from: Uuid, is_typing: bool) -> TypingSignal {
        TypingSignal { from, to: me(), is_typing }
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_expires_after_deadline() {
        let mut tracker = PresenceTracker::new(me(), EXPIRY);
        let a = Uuid::from_u128(1);

        assert!(tracker.on_typing_signal(typing(a, true), Instant::now()));
        assert!(tracker.is_typing_at(a, Instant::now()));

        tokio::time::advance(Duration::from_millis(2999)).await;
        assert!(tracker.is_typing_at(a, Instant::now()));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(!tracker.is_typing_at(a, Instant::now()));
        assert_eq!(tracker.sweep_expired(Instant::now()), vec![a]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshing_signal_restarts_the_timer() {
        let mut tracker = PresenceTracker::new(me(), EXPIRY);
        let a = Uuid::from_u128(1);

        tracker.on_typing_signal(typing(a, true), Instant::now());
        tokio::time::advance(Duration::from_secs(2)).await;
        tracker.on_typing_signal(typing(a, true), Instant::now());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(tracker.is_typing_at(a, Instant::now()), "refresh must restart the 3s window");

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(!tracker.is_typing_at(a, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_clears_immediately() {
        let mut tracker = PresenceTracker::new(me(), EXPIRY);
        let a = Uuid::from_u128(1);

        tracker.on_typing_signal(typing(a, true), Instant::now());
        assert!(tracker.on_typing_signal(typing(a, false), Instant::now()));
        assert!(!tracker.is_typing_at(a, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_for_other_recipients_are_ignored() {
        let mut tracker = PresenceTracker::new(me(), EXPIRY);
        let a = Uuid::from_u128(1);
        let someone_else = Uuid::from_u128(2);

        let misdirected = TypingSignal { from: a, to: someone_else, is_typing: true };
        assert!(!tracker.on_typing_signal(misdirected, Instant::now()));
        assert!(!tracker.is_typing_at(a, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_are_per_sender() {
        let mut tracker = PresenceTracker::new(me(), EXPIRY);
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);

        tracker.on_typing_signal(typing(a, true), Instant::now());
        tokio::time::advance(Duration::from_secs(2)).await;
        tracker.on_typing_signal(typing(b, true), Instant::now());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!tracker.is_typing_at(a, Instant::now()));
        assert!(tracker.is_typing_at(b, Instant::now()));
    }

    #[test]
    fn test_sync_replaces_online_set_wholesale() {
        let mut tracker = PresenceTracker::new(me(), EXPIRY);
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);

        tracker.on_presence_event(PresenceEvent::Join(a));
        assert!(tracker.is_online(a));

        tracker.on_presence_event(PresenceEvent::Sync([b].into_iter().collect()));
        assert!(!tracker.is_online(a));
        assert!(tracker.is_online(b));

        tracker.on_presence_event(PresenceEvent::Leave(b));
        assert!(!tracker.is_online(b));
    }
}
