// src/error.rs
//! Error handling for the render pipeline.
//!
//! - Enum discriminants are cheap to match; allocations only happen on error paths.
//! - Failures inside the render path are caught at the coordinator boundary and
//!   logged — they never propagate back to `update_parameter` callers or to the
//!   scheduler. Works with `?`, async, threads, `tokio`.

use thiserror::Error;

/// Main error type — lightweight, Send + Sync + 'static, perfect for async use.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The external compiler errored or produced unusable output.
    /// Never cached; the display keeps the previous mesh for that cycle.
    #[error("compile failed: {0}")]
    Compile(String),

    /// The sink's owner was dropped while a render was pending.
    /// Expected during teardown; renders abort silently.
    #[error("render sink is no longer reachable")]
    SinkUnreachable,

    /// No deferred-wait capability (no ambient tokio runtime). Changes are
    /// still recorded; callers fall back to forced/manual triggering.
    #[error("no async runtime available for deferred scheduling")]
    SchedulingUnavailable,

    /// A render was requested with no source text to compile.
    #[error("no source text available to render")]
    EmptySource,
}

impl Error {
    /// Wrap an arbitrary compiler failure message.
    #[inline]
    pub fn compile<S: Into<String>>(msg: S) -> Self {
        Self::Compile(msg.into())
    }

    #[inline]
    pub fn is_compile(&self) -> bool {
        matches!(self, Error::Compile(_))
    }
}

/// Convenient `Result` alias — use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, Error>;
