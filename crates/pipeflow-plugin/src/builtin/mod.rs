//! Custom node libraries linked into the engine.
//!
//! They implement the same C ABI a dynamically loaded library would and
//! double as reference implementations of the plugin contract.

pub mod add_sub;
pub mod replicate;

mod support;
