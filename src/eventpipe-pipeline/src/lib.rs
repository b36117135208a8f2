//! Runs the consumer side of the pipeline: startup connectivity checks, the
//! broker consumer task, aggregated health and cooperative shutdown.

pub mod error;
pub mod orchestrator;
pub mod signals;

pub use error::PipelineError;
pub use orchestrator::{PipelineHandle, PipelineOrchestrator};
pub use signals::setup_shutdown_hooks;
