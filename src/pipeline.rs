//! Ordered step execution over a mutable [`MessagingContext`].
//!
//! A run walks the normal steps in order. The first failed step diverts the
//! context to the error steps and ends the run; a stop ends it successfully.

pub mod context;
pub mod failure;
pub mod registry;
pub mod runner;
pub mod step;

pub use context::{BusinessPayload, ContextEntity, ContextError, MessagingContext, ReplyContent};
pub use failure::{FailureCategory, ProcessingError};
pub use registry::{ComponentRegistry, RegistryError};
pub use runner::{Pipeline, PipelineOutcome, StepConfiguration};
pub use step::{Condition, ConditionalStep, Step, StepError, StepResult};
