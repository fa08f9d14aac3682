//! Core contract between a batch worker and a message queue.
//!
//! Why: make batched consumption boring and predictable.
//! - Handlers state a verdict; no hidden acknowledgement or implicit success.
//! - The worker enforces pacing (parallel fetch lanes, jittered backoff) and
//!   lifecycle (run, graceful stop).
//! - The queue client owns lease semantics and the poison-message policy;
//!   transport stays behind the trait boundary. Responsibilities do not bleed
//!   across layers.
pub mod backoff;
pub mod batch;
pub mod queue;
pub mod worker;

pub use backoff::Backoff;
pub use batch::{Batch, Error, ErrorKind, Message};
pub use queue::{QueueClient, QueueDriver, Retrieval};
pub use tokio_util::sync::CancellationToken;
pub use worker::{Worker, WorkerBuilder, WorkerWithGracefulShutdown};

#[cfg(feature = "rt-tokio")]
pub use worker::WorkerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Verdict a handler wants to persist for a whole batch.
///
/// Why: force explicitness so operators and code can reason about progress.
/// Choose the smallest honest outcome instead of masking failures.
/// - `Complete`: the batch was handled; marked messages are deleted and the
///   rest go back for redelivery.
/// - `Retry`: the batch failed as a whole; every message goes back,
///   marked or not.
pub enum BatchResult {
    /// Delete every message marked processed, retry the rest.
    Complete,
    /// Make every message in the batch redeliverable.
    Retry,
}

/// Trait implemented by functions that process one batch of messages.
///
/// The `M` type parameter determines whether the handler expects a shared
/// [`HandlerContext`] in addition to the [`Batch`]. The handler marks the
/// messages it got through via [`Batch::mark_processed`] and returns a
/// [`BatchResult`] for the batch as a whole.
pub trait BatchHandler<M>: Send + Sync + Clone + 'static {
    /// Type of the shared context provided to the handler.
    type Context: Send + 'static;

    /// Future returned by the handler.
    type Future: Future<Output = BatchResult> + Send;

    /// Invoke the handler with the batch and worker context.
    fn call(self, batch: Batch, context: Self::Context) -> Self::Future;
}

/// Explicitly opt-in to receive shared context (e.g., pools, config).
///
/// Why: separate data from environment. Context is cloned per cycle to avoid
/// shared mutable state and surprising coupling.
pub struct HandlerContext<S>(pub S);

impl<F, Fut> BatchHandler<()> for F
where
    F: FnOnce(Batch) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = BatchResult> + Send,
{
    type Context = ();
    type Future = Fut;

    fn call(self, batch: Batch, _context: Self::Context) -> Self::Future {
        self(batch)
    }
}

impl<F, Fut, S> BatchHandler<HandlerContext<S>> for F
where
    S: Send + 'static,
    F: FnOnce(Batch, HandlerContext<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = BatchResult> + Send,
{
    type Context = S;
    type Future = Fut;

    fn call(self, batch: Batch, context: Self::Context) -> Self::Future {
        self(batch, HandlerContext(context))
    }
}
