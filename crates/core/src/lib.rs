//! `genledger-core` — shared building blocks for the generation/billing crates.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): typed
//! identifiers, idempotency keys, optimistic versioning and the error taxonomy.

pub mod entity;
pub mod error;
pub mod id;
pub mod idempotency;
pub mod version;

pub use entity::Entity;
pub use error::{DomainError, DomainResult, ErrorKind};
pub use id::{ArtifactId, JobId, OwnerId, ReservationId};
pub use idempotency::{IdempotencyKey, SettlementOperation};
pub use version::ExpectedVersion;
