//! Event plumbing between the generation workers and the coordinator.
//!
//! Mechanics only: the event payloads live with the domain that emits them.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
