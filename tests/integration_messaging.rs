mod common;

use alumnet_messaging::error::AppError;
use alumnet_messaging::storage::MessageStore;
use common::{TestEnv, settle};
use uuid::Uuid;

fn alice() -> Uuid {
    Uuid::from_u128(0xA11CE)
}

fn bob() -> Uuid {
    Uuid::from_u128(0xB0B)
}

fn carol() -> Uuid {
    Uuid::from_u128(0xCA501)
}

#[tokio::test(start_paused = true)]
async fn test_send_echo_appears_exactly_once() {
    let env = TestEnv::new([(alice(), "Alice"), (bob(), "Bob")]);
    let a = env.open(alice()).await;

    a.coordinator.select_thread(bob()).await.expect("select");
    a.coordinator.send(bob(), "hello bob").await.expect("send");
    settle().await;

    // The sender's view comes exclusively from the feed echo.
    let (selected, thread) = a.coordinator.thread().await.expect("thread");
    assert_eq!(selected, Some(bob()));
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].content, "hello bob");

    let conversations = a.coordinator.conversations().await.expect("conversations");
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].last_message, "hello bob");
    assert_eq!(conversations[0].unread_count, 0, "own sends never count as unread");
}

#[tokio::test(start_paused = true)]
async fn test_recipient_sees_live_message_and_unread_count() {
    let env = TestEnv::new([(alice(), "Alice"), (bob(), "Bob")]);
    let a = env.open(alice()).await;
    let b = env.open(bob()).await;

    a.coordinator.send(bob(), "are you there?").await.expect("send");
    settle().await;

    let conversations = b.coordinator.conversations().await.expect("conversations");
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].counterpart.id, alice());
    assert_eq!(conversations[0].counterpart.display_name, "Alice");
    assert_eq!(conversations[0].unread_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_message_into_open_thread_is_read_immediately() {
    let env = TestEnv::new([(alice(), "Alice"), (bob(), "Bob")]);
    let a = env.open(alice()).await;
    let b = env.open(bob()).await;

    b.coordinator.select_thread(alice()).await.expect("select");
    a.coordinator.send(bob(), "ping").await.expect("send");
    settle().await;

    let (_, thread) = b.coordinator.thread().await.expect("thread");
    assert_eq!(thread.len(), 1);
    assert!(thread[0].read_at.is_some(), "visible message must be read on arrival");

    let conversations = b.coordinator.conversations().await.expect("conversations");
    assert_eq!(conversations[0].unread_count, 0, "open thread never accrues unread");

    // The durable rows were marked too.
    settle().await;
    let stored = env.store.fetch_thread(bob(), alice()).await.expect("fetch");
    assert!(stored[0].read_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_select_thread_clears_prior_unread() {
    let env = TestEnv::new([(alice(), "Alice"), (bob(), "Bob")]);
    let a = env.open(alice()).await;

    for text in ["one", "two", "three"] {
        a.coordinator.send(bob(), text).await.expect("send");
    }

    let b = env.open(bob()).await;
    let conversations = b.coordinator.conversations().await.expect("conversations");
    assert_eq!(conversations[0].unread_count, 3);

    let thread = b.coordinator.select_thread(alice()).await.expect("select");
    assert_eq!(thread.len(), 3);
    assert_eq!(
        thread.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
        vec!["one", "two", "three"],
    );

    // Unread is already zero when select_thread resolves.
    let conversations = b.coordinator.conversations().await.expect("conversations");
    assert_eq!(conversations[0].unread_count, 0);

    // Idempotent on re-selection.
    b.coordinator.select_thread(alice()).await.expect("select again");
    let conversations = b.coordinator.conversations().await.expect("conversations");
    assert_eq!(conversations[0].unread_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_conversation_list_ordering_moves_repeat_sender_to_head() {
    let env = TestEnv::new([(alice(), "Alice"), (bob(), "Bob"), (carol(), "Carol")]);
    let me = Uuid::from_u128(0xD0E);
    let viewer = env.open(me).await;

    let a = env.open(alice()).await;
    let b = env.open(bob()).await;
    let c = env.open(carol()).await;

    a.coordinator.send(me, "from alice").await.expect("send");
    settle().await;
    b.coordinator.send(me, "from bob").await.expect("send");
    settle().await;
    c.coordinator.send(me, "from carol").await.expect("send");
    settle().await;
    a.coordinator.send(me, "alice again").await.expect("send");
    settle().await;

    let conversations = viewer.coordinator.conversations().await.expect("conversations");
    let order: Vec<Uuid> = conversations.iter().map(|c| c.counterpart.id).collect();
    assert_eq!(order, vec![alice(), carol(), bob()]);
    assert_eq!(conversations[0].last_message, "alice again");
    assert_eq!(conversations[0].unread_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_validation_rejected_before_any_write() {
    let env = TestEnv::new([(alice(), "Alice"), (bob(), "Bob")]);
    let a = env.open(alice()).await;

    let err = a.coordinator.send(bob(), "   ").await.expect_err("blank content");
    assert!(matches!(err, AppError::Validation(_)));

    let err = a.coordinator.send(alice(), "hi me").await.expect_err("self message");
    assert!(matches!(err, AppError::Validation(_)));

    settle().await;
    assert!(env.store.fetch_thread(alice(), bob()).await.expect("fetch").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_write_surfaces_and_nothing_is_echoed() {
    let env = TestEnv::new([(alice(), "Alice"), (bob(), "Bob")]);
    let a = env.open(alice()).await;
    a.coordinator.select_thread(bob()).await.expect("select");

    env.store.set_fail_writes(true);
    let err = a.coordinator.send(bob(), "hello?").await.expect_err("policy rejection");
    assert!(matches!(err, AppError::Write(_)));

    settle().await;
    let (_, thread) = a.coordinator.thread().await.expect("thread");
    assert!(thread.is_empty(), "a failed send must not appear anywhere");

    // An explicit user re-action succeeds once the store recovers.
    env.store.set_fail_writes(false);
    a.coordinator.send(bob(), "hello?").await.expect("retry by user");
    settle().await;
    let (_, thread) = a.coordinator.thread().await.expect("thread");
    assert_eq!(thread.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_first_contact_synthesizes_decorated_entry() {
    let env = TestEnv::new([(alice(), "Alice"), (bob(), "Bob")]);
    let b = env.open(bob()).await;

    let a = env.open(alice()).await;
    a.coordinator.send(bob(), "hi, we met at the reunion").await.expect("send");
    settle().await;

    let conversations = b.coordinator.conversations().await.expect("conversations");
    assert_eq!(conversations.len(), 1);
    // Lazy profile lookup resolved the synthesized placeholder.
    assert_eq!(conversations[0].counterpart.display_name, "Alice");
}
