/*
 * Gradmap Orchestration - concurrent batch job engine
 *
 * Turns a request of (image, gradient) pairs into a tracked job and runs it
 * on a bounded worker pool.
 *
 * Architecture:
 * - Job State Machine (queued -> processing -> completed | failed | cancelled)
 * - Job Registry (single orchestrator task owns every job)
 * - Batch Executor (rayon pool, bounded dispatch, cooperative cancellation)
 * - Progress Broadcaster (per-job fan-out to pluggable sinks)
 * - Sandbox validation of every file reference
 */

// Public modules
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod registry;
pub mod request;

// Re-exports
pub use broadcaster::{
    CallbackSink, JobEvent, ProgressBroadcaster, ProgressSink, SinkError, SubscriptionId,
};
pub use config::EngineConfig;
pub use error::{OrchestratorError, Result, ValidationError};
pub use executor::{BatchExecutor, BatchOutcome};
pub use job::{Job, JobId, JobSnapshot, JobStatus};
pub use registry::JobRegistry;
pub use request::{prepare, resolve_within, JobOptions, PreparedJob, TaskSpec};
