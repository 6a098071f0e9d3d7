//! Caller-facing error classification.

use serde::{Deserialize, Serialize};

/// Coarse error category reported to callers of the tool surface.
///
/// Every crate-level error maps onto exactly one kind so adapters can
/// report failures uniformly without matching on concrete error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or missing parameters, including "no active session".
    Validation,
    /// Session or file absent.
    NotFound,
    /// Session name collision.
    DuplicateName,
    /// Subprocess or filesystem failure.
    Execution,
    /// A subprocess exceeded its timeout. A subtype of `Execution`.
    Timeout,
    /// Text generation failed or returned an unusable response.
    SummaryGeneration,
    /// Storage or serialization failure inside the broker itself.
    Internal,
}
