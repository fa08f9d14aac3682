//! Poll loop engine and builder.
//!
//! Parallel fetch lanes, one batch per cycle, jittered backoff between
//! cycles, explicit resolution. Lifecycle transitions are consumed by type:
//! a built worker runs once, a started worker stops once.
use crate::{
    BatchHandler, BatchResult,
    backoff::Backoff,
    batch::Batch,
    queue::{QueueClient, Retrieval as _},
};
use futures::FutureExt as _;

/// Visibility timeout requested for every fetch lane.
///
/// Long enough to cover handling a whole batch; independent of the
/// per-message retry visibility, which only governs redelivery.
const FETCH_LEASE: std::time::Duration = std::time::Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
struct Settings {
    parallelism: usize,
    max_retries: u32,
    retry_visibility: std::time::Duration,
    max_backoff: std::time::Duration,
    run_on_empty: bool,
}

/// Worker + queue client + handler + pacing knobs.
pub struct Worker<Q, F, M>
where
    Q: QueueClient,
    F: BatchHandler<M>,
{
    client: Q,
    handler: F,
    context: F::Context,
    settings: Settings,
    marker: std::marker::PhantomData<fn() -> M>,
}

impl<Q, F, M> Worker<Q, F, M>
where
    Q: QueueClient + Sync,
    F: BatchHandler<M>,
    F::Context: Clone + Sync,
{
    /// Add a stop signal; the in-flight cycle finishes before the loop
    /// exits.
    pub fn with_graceful_shutdown(
        self,
        token: tokio_util::sync::CancellationToken,
    ) -> WorkerWithGracefulShutdown<Q, F, M> {
        let Self {
            client,
            handler,
            context,
            settings,
            marker,
        } = self;
        WorkerWithGracefulShutdown {
            client,
            handler,
            context,
            settings,
            token,
            marker,
        }
    }

    /// Drive the poll loop inline, forever.
    pub fn run(self) -> impl Future<Output = ()> + Send {
        run_worker(
            self.client,
            self.handler,
            self.context,
            self.settings,
            tokio_util::sync::CancellationToken::new(),
        )
    }
}

#[cfg(feature = "rt-tokio")]
impl<Q, F, M> Worker<Q, F, M>
where
    Q: QueueClient + Sync + 'static,
    F: BatchHandler<M>,
    F::Context: Clone + Sync,
    M: 'static,
{
    /// Spawn the poll loop onto the Tokio runtime and hand back its
    /// lifecycle handle.
    pub fn start(self) -> WorkerHandle {
        let token = tokio_util::sync::CancellationToken::new();
        let handle = tokio::spawn(self.with_graceful_shutdown(token.clone()).run());
        WorkerHandle { token, handle }
    }
}

/// Worker variant that reacts to a cancellation token and exits cleanly.
pub struct WorkerWithGracefulShutdown<Q, F, M>
where
    Q: QueueClient,
    F: BatchHandler<M>,
{
    client: Q,
    handler: F,
    context: F::Context,
    settings: Settings,
    token: tokio_util::sync::CancellationToken,
    marker: std::marker::PhantomData<fn() -> M>,
}

impl<Q, F, M> WorkerWithGracefulShutdown<Q, F, M>
where
    Q: QueueClient + Sync,
    F: BatchHandler<M>,
    F::Context: Clone + Sync,
{
    /// Run until the token is cancelled, then let the current cycle wind
    /// down.
    pub fn run(self) -> impl Future<Output = ()> + Send {
        run_worker(
            self.client,
            self.handler,
            self.context,
            self.settings,
            self.token,
        )
    }
}

/// Running worker spawned via [`Worker::start`].
///
/// Dropping the handle requests a stop without waiting for it.
#[cfg(feature = "rt-tokio")]
pub struct WorkerHandle {
    token: tokio_util::sync::CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

#[cfg(feature = "rt-tokio")]
impl WorkerHandle {
    /// Request a stop without waiting for the loop to exit.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Stop the worker: no new cycle starts, the in-flight cycle finishes
    /// naturally, and this returns once the background task has exited.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Err(error) = (&mut self.handle).await {
            tracing::error!(error = %error, "worker task panicked");
        }
    }
}

#[cfg(feature = "rt-tokio")]
impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Core loop: fan out fetch lanes, hand the merged batch to the handler,
/// resolve, back off, repeat.
async fn run_worker<Q, F, M>(
    client: Q,
    handler: F,
    context: F::Context,
    settings: Settings,
    token: tokio_util::sync::CancellationToken,
) where
    Q: QueueClient + Sync,
    F: BatchHandler<M>,
    F::Context: Clone + Sync,
{
    let mut backoff = Backoff::new(settings.max_backoff);

    loop {
        if token.is_cancelled() {
            break;
        }

        let productive = run_cycle(&client, &handler, &context, &settings, &token).await;
        let wait = backoff.next_delay(productive);

        let delay = futures_timer::Delay::new(wait).fuse();
        let cancelled = token.cancelled().fuse();
        futures::pin_mut!(delay, cancelled);
        futures::select! {
            _ = delay => {}
            _ = cancelled => break,
        }
    }

    tracing::trace!("poll loop stopped");
}

/// One cycle. Returns whether the cycle did productive work: a non-empty
/// batch that the handler completed and the queue acknowledged.
async fn run_cycle<Q, F, M>(
    client: &Q,
    handler: &F,
    context: &F::Context,
    settings: &Settings,
    token: &tokio_util::sync::CancellationToken,
) -> bool
where
    Q: QueueClient + Sync,
    F: BatchHandler<M>,
    F::Context: Clone + Sync,
{
    let fetches = (0..settings.parallelism).map(|_| client.fetch(FETCH_LEASE, token.clone()));
    let lanes = futures::future::join_all(fetches).await;

    // Every successful lane is released before anything else happens to the
    // cycle, failed lanes or not.
    let mut messages = Vec::new();
    let mut fetch_failed = false;
    for lane in lanes {
        match lane {
            Ok(retrieval) => messages.extend(retrieval.release().await),
            Err(error) => {
                if token.is_cancelled() {
                    tracing::trace!("fetch interrupted by shutdown");
                } else {
                    tracing::error!(error = %error, "Failed to fetch messages");
                }
                fetch_failed = true;
            }
        }
    }

    if fetch_failed {
        // Messages from intact lanes stay leased queue-side and come back
        // once their visibility timeout lapses.
        return false;
    }

    if messages.is_empty() {
        if settings.run_on_empty {
            tracing::trace!("Start batch handler (empty batch)");
            let _ = handler
                .clone()
                .call(Batch::new(Vec::new()), context.clone())
                .await;
            tracing::trace!("Finish batch handler");
        }
        return false;
    }

    let batch = Batch::new(messages);
    tracing::trace!(messages = batch.messages().len(), "Start batch handler");
    let verdict = handler.clone().call(batch.clone(), context.clone()).await;
    tracing::trace!(verdict = ?verdict, "Finish batch handler");

    let resolved = match verdict {
        BatchResult::Complete => {
            batch
                .complete(client, settings.max_retries, settings.retry_visibility)
                .await
        }
        BatchResult::Retry => {
            batch
                .retry_all(client, settings.max_retries, settings.retry_visibility)
                .await
        }
    };

    match resolved {
        Ok(()) => matches!(verdict, BatchResult::Complete),
        Err(error) => {
            if token.is_cancelled() {
                tracing::trace!("batch resolution interrupted by shutdown");
            } else {
                tracing::error!(error = %error, "Failed to resolve batch");
            }
            false
        }
    }
}

/// Builder for `Worker`. Prefer explicit configuration over defaults.
pub struct WorkerBuilder<Handler = (), M = (), Ctx = ()> {
    parallelism: usize,
    max_retries: u32,
    retry_visibility: std::time::Duration,
    max_backoff: std::time::Duration,
    run_on_empty: bool,
    handler: Handler,
    context: Ctx,
    marker: std::marker::PhantomData<fn() -> M>,
}

impl WorkerBuilder {
    /// Builder with the default pacing: two fetch lanes, five retries, one
    /// second retry visibility, one minute backoff ceiling, no empty-batch
    /// invocations.
    pub fn new() -> WorkerBuilder<(), (), ()> {
        WorkerBuilder {
            parallelism: 2,
            max_retries: 5,
            retry_visibility: std::time::Duration::from_secs(1),
            max_backoff: std::time::Duration::from_secs(60),
            run_on_empty: false,
            handler: (),
            context: (),
            marker: std::marker::PhantomData,
        }
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<Handler, M, Ctx> WorkerBuilder<Handler, M, Ctx> {
    /// Number of concurrent fetch lanes per cycle (at least one).
    pub fn parallelism(self, lanes: usize) -> Self {
        Self {
            parallelism: lanes.max(1),
            ..self
        }
    }

    /// Retry ceiling reported to the queue client on redelivery.
    pub fn max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Visibility timeout requested when a message goes back for redelivery.
    pub fn retry_visibility(self, retry_visibility: std::time::Duration) -> Self {
        Self {
            retry_visibility,
            ..self
        }
    }

    /// Ceiling on the backoff delay between non-productive cycles.
    pub fn max_backoff(self, max_backoff: std::time::Duration) -> Self {
        Self {
            max_backoff,
            ..self
        }
    }

    /// Invoke the handler with an empty sentinel batch on empty cycles.
    pub fn run_on_empty(self, run_on_empty: bool) -> Self {
        Self {
            run_on_empty,
            ..self
        }
    }
}

impl<Ctx> WorkerBuilder<(), (), Ctx> {
    /// Provide the batch handler.
    pub fn handler<F, M>(self, handler: F) -> WorkerBuilder<F, M, Ctx>
    where
        F: BatchHandler<M>,
    {
        let Self {
            parallelism,
            max_retries,
            retry_visibility,
            max_backoff,
            run_on_empty,
            handler: _,
            context,
            marker: _,
        } = self;
        WorkerBuilder {
            parallelism,
            max_retries,
            retry_visibility,
            max_backoff,
            run_on_empty,
            handler,
            context,
            marker: std::marker::PhantomData,
        }
    }
}

impl<Handler, M> WorkerBuilder<Handler, M, ()> {
    /// Attach shared context cloned for each cycle.
    pub fn context<Ctx>(self, context: Ctx) -> WorkerBuilder<Handler, M, Ctx>
    where
        Ctx: Clone + Send,
    {
        let Self {
            parallelism,
            max_retries,
            retry_visibility,
            max_backoff,
            run_on_empty,
            handler,
            context: _,
            marker,
        } = self;
        WorkerBuilder {
            parallelism,
            max_retries,
            retry_visibility,
            max_backoff,
            run_on_empty,
            handler,
            context,
            marker,
        }
    }
}

impl<Handler, M> WorkerBuilder<Handler, M, Handler::Context>
where
    Handler: BatchHandler<M>,
{
    /// Finalize the worker with the queue client it will consume from.
    pub fn build<Q>(self, client: Q) -> Worker<Q, Handler, M>
    where
        Q: QueueClient,
    {
        let Self {
            parallelism,
            max_retries,
            retry_visibility,
            max_backoff,
            run_on_empty,
            handler,
            context,
            marker: _,
        } = self;
        Worker {
            client,
            handler,
            context,
            settings: Settings {
                parallelism,
                max_retries,
                retry_visibility,
                max_backoff,
                run_on_empty,
            },
            marker: std::marker::PhantomData,
        }
    }
}
