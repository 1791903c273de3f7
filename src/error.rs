//! The handful of genuinely fallible entry points in the crate.
//!
//! Everything else in the error taxonomy of the design (invalid ops, unknown
//! parents, property-apply failures, ...) is reported via `tracing` and/or a
//! signal, not a `Result` — see each module's own handling for that.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tasks entry '{0}' has no (string) name")]
    TaskMissingName(String),
}
