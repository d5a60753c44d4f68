//! `pipeflow-pipeline`: DAG execution of inference pipelines.
//!
//! A [`Pipeline`] is built once from a validated definition and then serves
//! requests concurrently. Each request gets its own [`PipelineScheduler`]
//! that walks the graph: node sessions collect their inputs, execute when
//! ready (custom nodes through `pipeflow-plugin`, model nodes through an
//! [`InferenceBackend`]) and hand their results to the dependants.
//! Demultiplexers fan a session out into shards; gathering nodes stack them
//! back together.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────┐      ┌──────────────┐      ┌──────────┐
//!  inputs ────▶│  entry   │─────▶│  demux  ×N   │─────▶│   exit   │────▶ response
//!              └──────────┘      └──────┬───────┘      └────▲─────┘
//!                                       │ shard 0..N        │ gather
//!                                       ▼                   │
//!                                ┌──────────────┐           │
//!                                │ custom/model │───────────┘
//!                                └──────────────┘
//!        completions ──▶ CompletionQueue ──▶ PipelineScheduler (one per request)
//! ```

pub mod backend;
pub mod completion;
pub mod error;
pub mod metadata;
pub mod node;
pub mod pipeline;
pub mod scheduler;
pub mod session;
pub mod slots;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use backend::{InferenceBackend, InferenceDone, LocalBackend, LocalModel, ModelFn, ModelRunner};
pub use completion::{CompletionQueue, SessionEvent};
pub use error::{PipelineError, Result};
pub use metadata::{CollapseDetails, SessionMetadata, ShardLevel};
pub use node::{ExecuteStatus, Node, NodeImpl, SessionResults};
pub use pipeline::{Dependant, Pipeline, RequestOutcome};
pub use scheduler::{PipelineScheduler, SchedulerState};
pub use session::{NodeSession, SessionState};
pub use slots::{ExecutionSlots, SlotGuard};
