// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for opening conversations and keeping them in sync.
//!
//! These tests validate:
//! - History and channel events merge into one ordered, duplicate-free timeline
//! - Paginated history is fetched in full, followed by a catch-up query
//! - Switching conversations tears down the old subscription and ignores
//!   results that arrive for it afterwards
//! - A failed history fetch is surfaced and a refresh recovers from it

mod common;

use threadsync::channel::ConnectionState;
use threadsync::coordinator::SyncPhase;
use threadsync_proto::channel::ChannelEvent;
use threadsync_proto::conversation::{ConversationId, topic_for};
use threadsync_proto::message::MessageId;

use common::{Harness, confirmed_ids, contents, wait_messages, wait_status, wait_until};

const CONV: ConversationId = ConversationId::new(42);

#[tokio::test]
async fn history_and_channel_merge_without_duplicates() {
    let h = Harness::new();
    h.seed(CONV, &["one", "two"]);
    h.open_live(CONV).await;

    let history = wait_messages(&h.handle, |m| m.len() == 2).await;
    assert_eq!(confirmed_ids(&history), vec![1, 2]);

    // The gateway redelivers message 2, then the peer posts message 3.
    let second = h.api.messages(CONV)[1].clone();
    h.hub
        .publish_event(CONV, &ChannelEvent::MessageCreated { message: second });
    h.peer_posts(CONV, "three");

    let timeline = wait_messages(&h.handle, |m| m.len() == 3).await;
    assert_eq!(confirmed_ids(&timeline), vec![1, 2, 3]);
    assert_eq!(contents(&timeline), vec!["one", "two", "three"]);

    // Refreshing and further posts keep ids unique.
    let before = h.api.fetch_queries().len();
    h.handle.refresh().await.unwrap();
    wait_until("refresh query", || h.api.fetch_queries().len() > before).await;
    h.peer_posts(CONV, "four");
    let timeline = wait_messages(&h.handle, |m| m.len() == 4).await;
    assert_eq!(confirmed_ids(&timeline), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn paginated_history_then_catch_up() {
    let h = Harness::new();
    h.api.set_page_size(2);
    h.seed(CONV, &["a", "b", "c", "d", "e"]);
    h.open_live(CONV).await;

    let timeline = wait_messages(&h.handle, |m| m.len() == 5).await;
    assert_eq!(contents(&timeline), vec!["a", "b", "c", "d", "e"]);

    wait_until("catch-up query", || {
        h.api
            .fetch_queries()
            .iter()
            .any(|(_, q)| q.after == Some(MessageId::new(5)))
    })
    .await;
    let pages: Vec<u32> = h
        .api
        .fetch_queries()
        .iter()
        .filter(|(_, q)| q.after.is_none())
        .map(|(_, q)| q.page)
        .collect();
    assert_eq!(pages, vec![0, 1, 2]);
}

#[tokio::test]
async fn switching_conversations_ignores_the_old_one() {
    let first = ConversationId::new(1);
    let second = ConversationId::new(2);
    let h = Harness::new();
    h.seed(first, &["a1", "a2"]);
    h.seed(second, &["b1"]);

    // Switch before the first conversation has finished loading.
    h.handle.open_conversation(first).await.unwrap();
    h.open_live(second).await;

    let timeline = wait_messages(&h.handle, |m| contents(m) == ["b1"]).await;
    assert!(timeline.iter().all(|m| m.body().conversation_id == second));
    wait_until("old subscription dropped", || {
        h.hub.subscriber_count(&topic_for(first)) == 0
    })
    .await;

    h.peer_posts(first, "a3");
    h.peer_posts(second, "b2");
    let timeline = wait_messages(&h.handle, |m| m.len() == 2).await;
    assert_eq!(contents(&timeline), vec!["b1", "b2"]);
}

#[tokio::test]
async fn late_history_for_a_closed_conversation_is_ignored() {
    let first = ConversationId::new(1);
    let second = ConversationId::new(2);
    let h = Harness::new();
    h.seed(first, &["a1", "a2"]);
    h.seed(second, &["b1"]);

    h.api.hold_fetches(first);
    h.handle.open_conversation(first).await.unwrap();
    wait_until("held fetch", || {
        h.api.fetch_queries().iter().any(|(c, _)| *c == first)
    })
    .await;
    let status = wait_status(&h.handle, |s| s.conversation == Some(first)).await;
    assert_eq!(status.phase, SyncPhase::Loading);

    h.open_live(second).await;
    wait_messages(&h.handle, |m| contents(m) == ["b1"]).await;
    let live = h.handle.status().borrow().clone();

    h.api.release_fetches(first);
    h.peer_posts(second, "b2");
    let timeline = wait_messages(&h.handle, |m| m.len() == 2).await;
    assert_eq!(contents(&timeline), vec!["b1", "b2"]);
    assert!(timeline.iter().all(|m| m.body().conversation_id == second));
    assert_eq!(*h.handle.status().borrow(), live);
}

#[tokio::test]
async fn reopening_the_same_conversation_is_a_no_op() {
    let h = Harness::new();
    h.seed(CONV, &["hello"]);
    h.open_live(CONV).await;
    let attempts = h.hub.subscribe_attempts();

    h.handle.open_conversation(CONV).await.unwrap();
    h.peer_posts(CONV, "still here");
    wait_messages(&h.handle, |m| m.len() == 2).await;
    assert_eq!(h.hub.subscribe_attempts(), attempts);
    assert_eq!(h.hub.subscriber_count(&topic_for(CONV)), 1);
}

#[tokio::test]
async fn fetch_error_is_surfaced_and_refresh_recovers() {
    let h = Harness::new();
    h.seed(CONV, &["one", "two"]);
    // Initial fetch and the catch-up after connecting both fail.
    h.api.fail_next_fetches(2);
    h.handle.open_conversation(CONV).await.unwrap();

    let status = wait_status(&h.handle, |s| s.fetch_error.is_some()).await;
    assert_eq!(status.conversation, Some(CONV));
    wait_until("both failures consumed", || h.api.fetch_queries().len() == 2).await;
    assert!(h.handle.snapshot().is_empty());

    h.handle.refresh().await.unwrap();
    let timeline = wait_messages(&h.handle, |m| m.len() == 2).await;
    assert_eq!(confirmed_ids(&timeline), vec![1, 2]);
    let status = wait_status(&h.handle, |s| s.fetch_error.is_none()).await;
    assert_eq!(status.phase, SyncPhase::Live);
}

#[tokio::test]
async fn close_resets_published_state() {
    let h = Harness::new();
    h.seed(CONV, &["one"]);
    h.open_live(CONV).await;
    wait_messages(&h.handle, |m| m.len() == 1).await;

    h.handle.close_conversation().await.unwrap();
    let status = wait_status(&h.handle, |s| s.phase == SyncPhase::Closed).await;
    assert_eq!(status.conversation, None);
    wait_messages(&h.handle, <[_]>::is_empty).await;
    assert_eq!(*h.handle.connection_state().borrow(), ConnectionState::Idle);
    wait_until("unsubscribed", || h.hub.subscriber_count(&topic_for(CONV)) == 0).await;
}

#[tokio::test]
async fn rejected_subscription_stays_loading() {
    let h = Harness::new();
    h.seed(CONV, &["one"]);
    h.hub.reject_next("not a participant");
    h.handle.open_conversation(CONV).await.unwrap();

    common::wait_connection(&h.handle, ConnectionState::Errored).await;
    wait_messages(&h.handle, |m| m.len() == 1).await;
    let status = h.handle.status().borrow().clone();
    assert_eq!(status.phase, SyncPhase::Loading);
    assert_eq!(h.hub.subscribe_attempts(), 1);
}
