//! Property-based tests for the message store and reconciliation.
//!
//! Uses proptest to verify:
//! 1. Merging the same confirmed messages in any order, with duplicates,
//!    yields the same timeline.
//! 2. The timeline is always ordered by `(created_at, id)` with no
//!    duplicate confirmed ids.
//! 3. Local placeholders are confirmed exactly once however their channel
//!    echo and send response interleave.
//! 4. The read boundary only ever moves forward.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use proptest::prelude::*;
use threadsync::receipts::{ReadBoundary, ReadReceiptTracker};
use threadsync::reconcile::{ReconciliationEngine, Source};
use threadsync::store::MessageStore;
use threadsync_proto::api::WireMessage;
use threadsync_proto::conversation::{ConversationId, UserId};
use threadsync_proto::message::{
    ConfirmedMessage, Message, MessageBody, MessageId, PendingMessage, ProvisionalId, Timestamp,
};

const CONV: ConversationId = ConversationId::new(42);
const ME: UserId = UserId::new(1);
const PEER: UserId = UserId::new(2);

// --- Strategies ---

/// Distinct confirmed messages: ids `1..=n`, arbitrary (possibly equal)
/// timestamps, either sender.
fn arb_history() -> impl Strategy<Value = Vec<WireMessage>> {
    prop::collection::vec((0u64..10_000, any::<bool>()), 1..40).prop_map(|rows| {
        rows.into_iter()
            .zip(1u64..)
            .map(|((ts, mine), id)| WireMessage {
                id: MessageId::new(id),
                conversation_id: CONV,
                sender_id: if mine { ME } else { PEER },
                content: format!("message {id}"),
                created_at: Timestamp::from_millis(ts),
                read: false,
                client_ref: None,
            })
            .collect()
    })
}

/// The history plus redeliveries, some flagged read, in shuffled order.
fn arb_deliveries() -> impl Strategy<Value = (Vec<WireMessage>, Vec<WireMessage>)> {
    arb_history().prop_flat_map(|history| {
        let len = history.len();
        let redeliveries = prop::collection::vec((0..len, any::<bool>()), 0..len * 2);
        (Just(history), redeliveries).prop_flat_map(|(history, redeliveries)| {
            let mut all = history.clone();
            for (index, read) in redeliveries {
                let mut copy = history[index].clone();
                copy.read = read;
                all.push(copy);
            }
            (Just(all.clone()), Just(all).prop_shuffle())
        })
    })
}

fn merged(items: Vec<WireMessage>) -> MessageStore {
    let mut store = MessageStore::new(CONV);
    ReconciliationEngine::new(CONV, ME).merge(&mut store, Source::History, items);
    store
}

fn order_key(message: &Message) -> (Timestamp, u64) {
    (
        message.created_at(),
        message.confirmed_id().map_or(u64::MAX, MessageId::get),
    )
}

// --- Property tests ---

proptest! {
    /// Delivery order and duplicates do not change the final timeline.
    #[test]
    fn merge_converges_for_any_order((in_order, shuffled) in arb_deliveries()) {
        let a = merged(in_order);
        let b = merged(shuffled);
        prop_assert_eq!(a.list(), b.list());
    }

    /// The timeline is sorted and every confirmed id appears once.
    #[test]
    fn timeline_is_ordered_and_unique((_, shuffled) in arb_deliveries()) {
        let distinct: std::collections::HashSet<_> = shuffled.iter().map(|m| m.id).collect();
        let store = merged(shuffled);
        let list = store.list();

        prop_assert_eq!(list.len(), distinct.len());
        prop_assert!(list.windows(2).all(|w| order_key(&w[0]) <= order_key(&w[1])));
        let ids: std::collections::HashSet<_> =
            list.iter().filter_map(Message::confirmed_id).collect();
        prop_assert_eq!(ids, distinct);
    }

    /// Each placeholder ends up confirmed exactly once, whether its echo
    /// (no client_ref) or its send response (with client_ref) lands first.
    #[test]
    fn echo_and_response_interleavings_confirm_once(
        sends in prop::collection::vec((0u64..5_000, 0u64..5_000), 1..12),
        order in any::<u64>(),
    ) {
        let engine = ReconciliationEngine::new(CONV, ME);
        let mut store = MessageStore::new(CONV);
        let mut arrivals = Vec::new();

        for (n, (ts, delay)) in (1u64..).zip(&sends) {
            let provisional_id = ProvisionalId::new();
            let body = MessageBody {
                conversation_id: CONV,
                sender_id: ME,
                content: format!("send {n}"),
                created_at: Timestamp::from_millis(*ts),
            };
            store.upsert(Message::Pending(PendingMessage {
                provisional_id,
                body: body.clone(),
                failure: None,
            }));
            let echoed_at = body.created_at.saturating_add_millis(*delay);
            let echo = WireMessage::from(&ConfirmedMessage {
                id: MessageId::new(n),
                body: MessageBody {
                    created_at: echoed_at,
                    ..body
                },
                read: false,
                client_ref: None,
            });
            let response = WireMessage {
                client_ref: Some(provisional_id),
                ..echo.clone()
            };
            arrivals.push((Source::Channel, echo));
            arrivals.push((Source::SendResponse, response));
        }

        // Deterministic pseudo-shuffle seeded by `order`.
        let mut seed = order | 1;
        for i in (1..arrivals.len()).rev() {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let j = usize::try_from(seed % (u64::try_from(i).unwrap() + 1)).unwrap();
            arrivals.swap(i, j);
        }

        let mut reconciled = 0;
        for (source, message) in arrivals {
            reconciled += engine.merge(&mut store, source, std::iter::once(message)).reconciled.len();
        }

        prop_assert_eq!(reconciled, sends.len());
        prop_assert_eq!(store.len(), sends.len());
        prop_assert!(store.iter().all(|m| m.confirmed_id().is_some()));
    }

    /// The boundary is the maximum of everything ever marked visible.
    #[test]
    fn read_boundary_is_monotonic(
        batches in prop::collection::vec(
            prop::collection::vec((1u64..200, 0u64..1_000), 0..5),
            1..20,
        ),
    ) {
        let mut tracker = ReadReceiptTracker::new(CONV, std::time::Duration::from_millis(500));
        let mut highest: Option<ReadBoundary> = None;

        for batch in batches {
            let messages: Vec<ConfirmedMessage> = batch
                .into_iter()
                .map(|(id, ts)| ConfirmedMessage {
                    id: MessageId::new(id),
                    body: MessageBody {
                        conversation_id: CONV,
                        sender_id: PEER,
                        content: String::new(),
                        created_at: Timestamp::from_millis(ts),
                    },
                    read: false,
                    client_ref: None,
                })
                .collect();
            let before = tracker.boundary();
            let batch_max = messages.iter().map(ReadBoundary::of).max();
            let moved = tracker.mark_visible(&messages);

            highest = highest.max(batch_max);
            prop_assert_eq!(tracker.boundary(), highest);
            prop_assert!(tracker.boundary() >= before);
            prop_assert_eq!(moved, tracker.boundary() != before);
        }
    }
}
