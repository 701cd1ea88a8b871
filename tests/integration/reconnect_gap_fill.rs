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

//! Integration tests for channel outages and gap filling.
//!
//! These tests validate:
//! - The channel reconnects on its own after the hub drops it
//! - Messages posted while disconnected are fetched after reconnect, anchored
//!   at the last id seen before the outage
//! - Every message appears exactly once, whichever path delivered it
//! - A failed gap fill is reported and a refresh retries the same anchor
//! - A degenerate jitter setting does not stop reconnecting

mod common;

use threadsync::channel::ConnectionState;
use threadsync_proto::conversation::ConversationId;
use threadsync_proto::message::MessageId;

use common::{
    Harness, confirmed_ids, contents, wait_connection, wait_messages, wait_status, wait_until,
};

const CONV: ConversationId = ConversationId::new(42);

fn gap_queries(h: &Harness, after: u64) -> Vec<u32> {
    h.api
        .fetch_queries()
        .iter()
        .filter(|(_, q)| q.after == Some(MessageId::new(after)))
        .map(|(_, q)| q.page)
        .collect()
}

/// Opens `CONV` and waits for the catch-up query that follows the first
/// connect, so later anchored queries can be told apart from it.
async fn open_caught_up(h: &Harness) -> usize {
    h.open_live(CONV).await;
    wait_until("catch-up query", || !gap_queries(h, 1).is_empty()).await;
    gap_queries(h, 1).len()
}

#[tokio::test]
async fn outage_is_filled_after_reconnect() {
    let h = Harness::new();
    h.seed(CONV, &["one"]);
    let before = open_caught_up(&h).await;

    h.hub.set_offline(true);
    wait_connection(&h.handle, ConnectionState::Errored).await;
    h.peer_posts(CONV, "two");
    h.peer_posts(CONV, "three");

    h.hub.set_offline(false);
    wait_connection(&h.handle, ConnectionState::Connected).await;
    let timeline = wait_messages(&h.handle, |m| m.len() == 3).await;
    assert_eq!(confirmed_ids(&timeline), vec![1, 2, 3]);
    assert_eq!(contents(&timeline), vec!["one", "two", "three"]);
    assert!(
        gap_queries(&h, 1).len() > before,
        "gap fill anchored at last seen id"
    );

    h.peer_posts(CONV, "four");
    let timeline = wait_messages(&h.handle, |m| m.len() == 4).await;
    assert_eq!(confirmed_ids(&timeline), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn nan_jitter_still_reconnects() {
    let h = Harness::with_config(|c| c.backoff.jitter = f64::NAN);
    h.seed(CONV, &["one"]);
    open_caught_up(&h).await;

    h.hub.set_offline(true);
    wait_connection(&h.handle, ConnectionState::Errored).await;
    h.peer_posts(CONV, "two");
    h.hub.set_offline(false);

    wait_connection(&h.handle, ConnectionState::Connected).await;
    let timeline = wait_messages(&h.handle, |m| m.len() == 2).await;
    assert_eq!(confirmed_ids(&timeline), vec![1, 2]);
}

#[tokio::test]
async fn dropped_subscription_reconnects_without_duplicates() {
    let h = Harness::new();
    h.seed(CONV, &["one"]);
    let before = open_caught_up(&h).await;
    let attempts = h.hub.subscribe_attempts();

    h.hub.drop_all();
    h.peer_posts(CONV, "two");
    wait_until("resubscribed", || h.hub.subscribe_attempts() > attempts).await;
    wait_connection(&h.handle, ConnectionState::Connected).await;
    h.peer_posts(CONV, "three");

    let timeline = wait_messages(&h.handle, |m| m.len() == 3).await;
    assert_eq!(confirmed_ids(&timeline), vec![1, 2, 3]);

    // Let any in-flight gap fill land, then check nothing doubled.
    wait_until("gap fill issued", || gap_queries(&h, 1).len() > before).await;
    h.peer_posts(CONV, "four");
    let timeline = wait_messages(&h.handle, |m| m.len() == 4).await;
    assert_eq!(confirmed_ids(&timeline), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn long_outage_is_paged_in() {
    let h = Harness::new();
    h.api.set_page_size(2);
    h.seed(CONV, &["one"]);
    let before = open_caught_up(&h).await;

    h.hub.set_offline(true);
    wait_connection(&h.handle, ConnectionState::Errored).await;
    for n in 2..=6 {
        h.peer_posts(CONV, &format!("missed {n}"));
    }
    h.hub.set_offline(false);

    let timeline = wait_messages(&h.handle, |m| m.len() == 6).await;
    assert_eq!(confirmed_ids(&timeline), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(gap_queries(&h, 1)[before..], [0, 1, 2]);
}

#[tokio::test]
async fn failed_gap_fill_is_retried_by_refresh() {
    let h = Harness::new();
    h.seed(CONV, &["one"]);
    let before = open_caught_up(&h).await;

    h.hub.set_offline(true);
    wait_connection(&h.handle, ConnectionState::Errored).await;
    h.peer_posts(CONV, "two");
    h.api.fail_next_fetches(1);
    h.hub.set_offline(false);

    let status = wait_status(&h.handle, |s| s.fetch_error.is_some()).await;
    assert_eq!(status.conversation, Some(CONV));
    assert_eq!(confirmed_ids(&h.handle.snapshot()), vec![1]);

    h.handle.refresh().await.unwrap();
    let timeline = wait_messages(&h.handle, |m| m.len() == 2).await;
    assert_eq!(contents(&timeline), vec!["one", "two"]);
    wait_status(&h.handle, |s| s.fetch_error.is_none()).await;
    assert_eq!(
        gap_queries(&h, 1).len(),
        before + 2,
        "refresh reused the outage anchor"
    );
}
