//! Engine errors

use thiserror::Error;

use crate::types::{RefId, RegId, UnitId};

/// Engine result type
pub type Result<T> = std::result::Result<T, Error>;

/// Failure channel for user functions.
///
/// An `Err` from a `filter`, `compute` or `run` function becomes the
/// node-local `fail` flag plus a diagnostic record; it never aborts the
/// drain.
pub type FnError = Box<dyn std::error::Error + Send + Sync>;

/// Structural corruption.
///
/// These cannot arise from correct graph-construction code and abort the
/// drain when they do.
#[derive(Debug, Error)]
pub enum Error {
    #[error("register {reg} not mapped in node {node}")]
    RegisterNotFound { node: UnitId, reg: RegId },

    #[error("ref cell not found: {0}")]
    RefNotFound(RefId),
}
