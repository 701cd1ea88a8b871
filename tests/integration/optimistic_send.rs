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

//! Integration tests for optimistic sends through the coordinator.
//!
//! These tests validate:
//! - Invalid content never reaches the timeline or the API
//! - A send is confirmed exactly once when the echo beats the response
//! - A stalled send fails in place after the send timeout and can be retried
//! - Rejected sends can be discarded
//! - Concurrent sends all confirm, in server order
//! - Closing the conversation cancels outstanding tickets

mod common;

use std::time::Duration;

use threadsync::api::memory::SendMode;
use threadsync::coordinator::SyncError;
use threadsync::send::SendFailedError;
use threadsync_proto::conversation::ConversationId;
use threadsync_proto::message::{DeliveryState, Message, ValidationError};

use common::{Harness, ME, contents, wait_messages};

const CONV: ConversationId = ConversationId::new(42);

fn states(messages: &[Message]) -> Vec<DeliveryState> {
    messages.iter().map(Message::delivery_state).collect()
}

#[tokio::test]
async fn blank_content_is_rejected_before_any_io() {
    let h = Harness::new();
    h.open_live(CONV).await;

    for blank in ["", "   ", "\n\t"] {
        assert_eq!(
            h.handle.send(blank).await.unwrap_err(),
            SyncError::Validation(ValidationError::Empty)
        );
    }
    assert!(h.handle.snapshot().is_empty());
    assert!(h.api.sent_requests().is_empty());
}

#[tokio::test]
async fn echo_before_response_confirms_once() {
    for echo_client_ref in [false, true] {
        let h = Harness::new();
        h.api.set_echo_client_ref(echo_client_ref);
        h.open_live(CONV).await;

        let ticket = h.handle.send("  is it available?  ").await.unwrap();
        let provisional_id = ticket.provisional_id();
        let id = ticket.outcome().await.unwrap();

        let timeline = wait_messages(&h.handle, |m| {
            m.len() == 1 && m[0].delivery_state() == DeliveryState::Sent
        })
        .await;
        assert_eq!(timeline[0].confirmed_id(), Some(id));
        assert_eq!(timeline[0].body().content, "is it available?");
        assert_eq!(timeline[0].body().sender_id, ME);

        let requests = h.api.sent_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.client_ref, provisional_id);
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_send_times_out_then_retry_succeeds() {
    let h = Harness::new();
    h.open_live(CONV).await;
    h.api.set_send_mode(SendMode::Stall);

    let ticket = h.handle.send("hello").await.unwrap();
    let provisional_id = ticket.provisional_id();
    let pending = wait_messages(&h.handle, |m| !m.is_empty()).await;
    assert_eq!(states(&pending), vec![DeliveryState::Pending]);

    assert_eq!(
        ticket.outcome().await.unwrap_err(),
        SendFailedError::TimedOut(Duration::from_secs(15))
    );
    let failed = wait_messages(&h.handle, |m| {
        states(m) == [DeliveryState::Failed]
    })
    .await;
    assert_eq!(contents(&failed), vec!["hello"]);

    h.api.set_send_mode(SendMode::Accept);
    let retry = h.handle.retry(provisional_id).await.unwrap();
    assert_ne!(retry.provisional_id(), provisional_id);
    retry.outcome().await.unwrap();

    let timeline = wait_messages(&h.handle, |m| states(m) == [DeliveryState::Sent]).await;
    assert_eq!(contents(&timeline), vec!["hello"]);

    let requests = h.api.sent_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|(_, r)| r.content == "hello"));
    assert_eq!(
        h.handle.retry(provisional_id).await.unwrap_err(),
        SyncError::UnknownMessage(provisional_id)
    );
}

#[tokio::test]
async fn rejected_send_can_be_discarded() {
    let h = Harness::new();
    h.seed(CONV, &["offer?"]);
    h.open_live(CONV).await;
    h.api.set_send_mode(SendMode::Reject("content blocked".into()));

    let ticket = h.handle.send("buy now").await.unwrap();
    let provisional_id = ticket.provisional_id();
    assert!(matches!(
        ticket.outcome().await,
        Err(SendFailedError::Rejected(reason)) if reason.contains("content blocked")
    ));
    wait_messages(&h.handle, |m| {
        states(m) == [DeliveryState::Sent, DeliveryState::Failed]
    })
    .await;

    h.handle.discard(provisional_id).await.unwrap();
    let timeline = wait_messages(&h.handle, |m| m.len() == 1).await;
    assert_eq!(contents(&timeline), vec!["offer?"]);
    assert_eq!(
        h.handle.discard(provisional_id).await.unwrap_err(),
        SyncError::UnknownMessage(provisional_id)
    );
}

#[tokio::test]
async fn concurrent_sends_all_confirm_in_order() {
    let h = Harness::new();
    h.open_live(CONV).await;

    let mut tickets = Vec::new();
    for content in ["first", "second", "third"] {
        tickets.push(h.handle.send(content).await.unwrap());
    }
    let mut ids = Vec::new();
    for ticket in tickets {
        ids.push(ticket.outcome().await.unwrap());
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    let timeline = wait_messages(&h.handle, |m| {
        m.len() == 3 && m.iter().all(|m| m.delivery_state() == DeliveryState::Sent)
    })
    .await;
    assert_eq!(contents(&timeline), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn closing_cancels_outstanding_sends() {
    let h = Harness::new();
    h.open_live(CONV).await;
    h.api.set_send_mode(SendMode::Stall);

    let ticket = h.handle.send("never answered").await.unwrap();
    h.handle.close_conversation().await.unwrap();
    assert_eq!(ticket.outcome().await.unwrap_err(), SendFailedError::Cancelled);
    assert_eq!(
        h.handle.send("after close").await.unwrap_err(),
        SyncError::NotOpen
    );
}
