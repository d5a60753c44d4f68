//! `pipeflow-types`: vocabulary shared by every pipeflow crate.
//!
//! Consumed by `pipeflow-plugin` (tensor specs and precisions crossing the
//! plugin ABI), `pipeflow-pipeline` (tensors, pipeline definitions, scheduler
//! configuration) and `pipeflow-node` (definition file loading).

pub mod config;
pub mod error;
pub mod graph;
pub mod tensor;

pub use config::{BackendConfig, SchedulerConfig};
pub use error::{PipeflowError, Result};
pub use graph::{Connection, DemultiplyCount, Mapping, NodeDefinition, NodeKind, PipelineDefinition};
pub use tensor::{Dimension, Precision, Tensor, TensorMap, TensorSpec, TensorStorage};
