//! Background consumers.

pub mod event_consumer;

pub use event_consumer::{ConsumerHandle, ConsumerStats, EventConsumer};
