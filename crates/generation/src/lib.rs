//! `genledger-generation`
//!
//! **Responsibility:** the generation job entity, its progress model and the
//! seams to the external generator.
//!
//! - No IO: the model invocation, persistence and the ledger are collaborators.
//! - The job's billing state is a cached projection of its ledger reservation.

pub mod event;
pub mod generator;
pub mod job;
pub mod progress;
pub mod request;
pub mod tokens;

pub use event::{
    CompletionEvent, FailureEvent, GenerationEvent, PlanEvent, ProgressEvent, ProgressUnit,
    StartEvent,
};
pub use generator::{GenerationError, Generator, ProgressSink};
pub use job::{BillingState, GenerationJob, JobStatus};
pub use progress::Progress;
pub use request::{GeneratedContent, GenerationRequest};
pub use tokens::{CharRatioEstimator, TokenEstimator};
