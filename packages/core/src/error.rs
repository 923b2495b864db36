//! Error kinds surfaced by the reactive runtime.
//!
//! Errors raised inside computations are routed to the nearest owner carrying
//! an error handler (see [`crate::on_error`]); an unhandled error re-raises at
//! the host boundary. A computation that errored keeps its previous committed
//! value, so downstream observers never see a torn state.

use thiserror::Error;

/// Everything that can go wrong inside the runtime.
#[derive(Debug, Clone, Error)]
pub enum ReactiveError {
    /// A computation read its own value while it was running.
    #[error("computation read its own value while running")]
    CircularDependency,

    /// The scheduler ran more than the allowed number of passes without the
    /// eager queues settling. Almost always an effect writing a value it also
    /// observes without an equality predicate to break the cycle.
    #[error("scheduler exceeded {0} passes without settling")]
    RunawayClock(u64),

    /// A task was scheduled with arguments that make no sense, e.g. an action
    /// whose input type does not match the value flowing through the pipeline.
    #[error("invalid task source: {0}")]
    InvalidTaskSource(&'static str),

    /// Attempt to dispose the implicit unowned root. The unowned root exists
    /// so that top-level signals have somewhere to live; it has no disposer.
    #[error("the unowned root cannot be disposed")]
    DisposedUnowned,

    /// An application-level failure reported from a computation or cleanup
    /// through [`crate::throw_error`].
    #[error("host failure: {0}")]
    Host(String),
}

/// Control-flow marker raised by [`crate::suspend`]. Not an error: the nearest
/// suspense boundary consumes it and swaps in its fallback. If no boundary is
/// in scope the suspension degrades into [`ReactiveError::Host`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suspended;
