//! Shared data model and wire shapes for `threadsync`.

pub mod api;
pub mod channel;
pub mod codec;
pub mod conversation;
pub mod message;
