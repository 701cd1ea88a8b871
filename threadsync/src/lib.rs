//! `threadsync`: real-time conversation synchronization core.
//!
//! Keeps one conversation's timeline consistent across a paginated history
//! fetch, a live push channel and optimistic local sends, while tracking
//! connection health and read receipts. Start with
//! [`coordinator::SyncCoordinator::spawn`].

pub mod api;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod receipts;
pub mod reconcile;
pub mod send;
pub mod store;
