//! Relay message model for the pipeline relay.
//!
//! This crate provides the typed, timestamped messages sent to the observer
//! and the relay that frames events and forwards them to a [`MessageSink`].

mod relay;
mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use relay::{Delivery, MessageRelay, MessageSink};
pub use types::*;
