//! Ripple propagation engine
//!
//! The execution core of a reactive dataflow runtime: a priority-
//! multiplexed scheduler, a small instruction interpreter and a drain
//! driver that carries injected values through a prebuilt node graph.

pub mod engine;
pub mod error;
pub mod node;
mod queue;
pub mod stack;
pub mod storage;
pub mod types;

pub use engine::{DrainReport, Engine, LaunchSpec};
pub use error::{Error, FnError, Result};
pub use node::{
    Check, ComputeFn, FilterFn, MovSource, MovTarget, Node, NodeBuilder, NodeHandle, Step, StepKind,
};
pub use stack::{CallContext, StackView};
pub use storage::RefStorage;
pub use types::*;
