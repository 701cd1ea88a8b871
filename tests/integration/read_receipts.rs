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

//! Integration tests for read receipts in both directions.
//!
//! These tests validate:
//! - Marking messages visible updates the timeline at once but reaches the
//!   API as one debounced boundary
//! - The boundary never moves backwards
//! - A failed flush is retried on the next boundary change or the next visit
//! - A peer's receipt marks our own messages read up to its boundary

mod common;

use std::time::Duration;

use threadsync_proto::conversation::ConversationId;
use threadsync_proto::message::{Message, MessageId};

use common::{Harness, wait_messages, wait_until};

const CONV: ConversationId = ConversationId::new(42);

fn ids(raw: &[u64]) -> Vec<MessageId> {
    raw.iter().copied().map(MessageId::new).collect()
}

fn read_flags(messages: &[Message]) -> Vec<bool> {
    messages.iter().map(Message::is_read).collect()
}

async fn live_with_three(h: &Harness) {
    h.seed(CONV, &["one", "two", "three"]);
    h.open_live(CONV).await;
    wait_messages(&h.handle, |m| m.len() == 3).await;
}

#[tokio::test(start_paused = true)]
async fn visible_messages_flush_as_one_boundary() {
    let h = Harness::new();
    live_with_three(&h).await;

    h.handle.mark_read(ids(&[1])).await.unwrap();
    let timeline = wait_messages(&h.handle, |m| m[0].is_read()).await;
    assert_eq!(read_flags(&timeline), vec![true, false, false]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    h.handle.mark_read(ids(&[3, 2])).await.unwrap();
    wait_messages(&h.handle, |m| read_flags(m) == [true, true, true]).await;
    assert!(h.api.read_boundaries(CONV).is_empty(), "still debouncing");

    wait_until("flush", || !h.api.read_boundaries(CONV).is_empty()).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.api.read_boundaries(CONV), ids(&[3]));
}

#[tokio::test(start_paused = true)]
async fn boundary_never_moves_backwards() {
    let h = Harness::new();
    live_with_three(&h).await;

    h.handle.mark_read(ids(&[2])).await.unwrap();
    wait_until("first flush", || h.api.read_boundaries(CONV) == ids(&[2])).await;

    h.handle.mark_read(ids(&[1])).await.unwrap();
    h.handle.mark_read(ids(&[99])).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.api.read_boundaries(CONV), ids(&[2]));
    assert_eq!(read_flags(&h.handle.snapshot()), vec![true, true, false]);
}

#[tokio::test(start_paused = true)]
async fn failed_flush_is_retried_on_next_change() {
    let h = Harness::new();
    live_with_three(&h).await;
    h.api.fail_next_receipts(1);

    h.handle.mark_read(ids(&[1])).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.api.read_boundaries(CONV).is_empty());

    h.handle.mark_read(ids(&[2])).await.unwrap();
    wait_until("retried flush", || h.api.read_boundaries(CONV) == ids(&[2])).await;
}

#[tokio::test(start_paused = true)]
async fn failed_flush_is_retried_on_next_visit() {
    let h = Harness::new();
    live_with_three(&h).await;
    h.api.fail_next_receipts(1);

    h.handle.mark_read(ids(&[3])).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.api.read_boundaries(CONV).is_empty());

    h.handle.close_conversation().await.unwrap();
    h.open_live(CONV).await;
    wait_until("flush on revisit", || h.api.read_boundaries(CONV) == ids(&[3])).await;
}

#[tokio::test]
async fn peer_receipt_marks_own_messages_read() {
    let h = Harness::new();
    h.seed(CONV, &["hello"]);
    h.open_live(CONV).await;

    let first = h.handle.send("first").await.unwrap().outcome().await.unwrap();
    let second = h.handle.send("second").await.unwrap().outcome().await.unwrap();
    wait_messages(&h.handle, |m| m.len() == 3 && m.iter().all(|m| m.confirmed_id().is_some()))
        .await;

    h.api.publish_read(CONV, common::PEER, first);
    let timeline = wait_messages(&h.handle, |m| m[1].is_read()).await;
    // The peer's own message is not ours to mark.
    assert_eq!(read_flags(&timeline), vec![false, true, false]);

    h.api.publish_read(CONV, common::PEER, second);
    let timeline = wait_messages(&h.handle, |m| m[2].is_read()).await;
    assert_eq!(read_flags(&timeline), vec![false, true, true]);
}
