//! `pipeflow-plugin`: the custom node boundary.
//!
//! Custom nodes are libraries implementing a small C ABI (see [`abi`]).
//! This crate resolves those libraries, keeps one initialized internal
//! manager per pipeline node, and moves tensors across the boundary without
//! copying: plugin-produced buffers are wrapped in [`PluginBuffer`], which
//! hands them back through the plugin's `release` when the engine is done.
//!
//! ```text
//!   engine                         │ plugin (C ABI)
//!   ───────────────────────────────┼──────────────────────────────
//!   PluginInstance::initialize ───▶│ initialize(&state, params)
//!   NodePlugin::execute ──────────▶│ execute(inputs, &outputs, state)
//!        outputs → PluginBuffer  ◀─│   (pool or heap buffers)
//!   drop(PluginBuffer) ───────────▶│ release(ptr, state)
//!   drop(last handle) ────────────▶│ deinitialize(state)
//! ```

pub mod abi;
pub mod buffer;
pub mod buffer_pool;
pub mod builtin;
pub mod error;
pub mod instance;
pub mod library;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use buffer::PluginBuffer;
pub use buffer_pool::BufferPool;
pub use error::{PluginError, Result};
pub use instance::{NodePlugin, PluginInstance};
pub use library::{LibraryFns, LibraryRegistry, NodeLibrary};
