//! Batches of fetched messages and their resolution.
//!
//! A batch is built once per cycle from every lane's messages, handed to the
//! handler as a unit, then resolved exactly once: marked messages are
//! deleted, unmarked messages go back for redelivery. Nothing is dropped
//! silently.
use futures::StreamExt as _;

use crate::queue::QueueClient;

/// Attempt number reported on the first redelivery.
const FIRST_ATTEMPT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Immutable message as fetched from the queue.
///
/// The identifier addresses delete/retry calls; the payload is opaque to the
/// worker.
pub struct Message {
    id: String,
    payload: Vec<u8>,
}

impl Message {
    /// Build a message from its queue identifier and raw payload.
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }

    /// Queue identifier used for acknowledge/retry addressing.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categorization of failures raised while working with a batch.
pub enum ErrorKind {
    /// Errors originating from queue interactions.
    Queue,
    /// A message that does not belong to the batch was marked.
    ForeignMessage,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + 'static>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn foreign_message(id: &str) -> Self {
        Self {
            kind: ErrorKind::ForeignMessage,
            inner: Box::new(ForeignMessageError { id: id.to_owned() }),
        }
    }

    fn resolution(
        attempted: usize,
        failures: Vec<Box<dyn std::error::Error + Send + 'static>>,
    ) -> Self {
        Self {
            kind: ErrorKind::Queue,
            inner: Box::new(ResolutionFailures {
                attempted,
                failures,
            }),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug)]
struct ForeignMessageError {
    id: String,
}

impl std::fmt::Display for ForeignMessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "message {} does not belong to this batch", self.id)
    }
}

impl std::error::Error for ForeignMessageError {}

#[derive(Debug)]
struct ResolutionFailures {
    attempted: usize,
    failures: Vec<Box<dyn std::error::Error + Send + 'static>>,
}

impl std::fmt::Display for ResolutionFailures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} queue calls failed while resolving the batch",
            self.failures.len(),
            self.attempted
        )?;
        if let Some(first) = self.failures.first() {
            write!(f, ": {first}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ResolutionFailures {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|error| error.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[derive(Clone)]
/// Messages fetched in one cycle, handed to the handler as a unit.
///
/// Cloning is shallow: the worker keeps one handle while the handler marks
/// messages through another. A batch lives for exactly one cycle and is
/// resolved exactly once, by [`Batch::complete`] or [`Batch::retry_all`].
pub struct Batch {
    inner: std::sync::Arc<BatchInner>,
}

struct BatchInner {
    messages: Vec<Message>,
    handled: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl Batch {
    pub(crate) fn new(messages: Vec<Message>) -> Self {
        Self {
            inner: std::sync::Arc::new(BatchInner {
                messages,
                handled: std::sync::Mutex::new(std::collections::HashSet::new()),
            }),
        }
    }

    /// Ordered view of the batch, stable for the cycle's duration.
    ///
    /// Lane order first, retrieval order within a lane second.
    pub fn messages(&self) -> &[Message] {
        &self.inner.messages
    }

    /// Mark one message as successfully processed.
    ///
    /// Idempotent; marking twice does not double-delete. Marking a message
    /// the batch does not contain is a handler defect and fails with
    /// [`ErrorKind::ForeignMessage`].
    pub fn mark_processed(&self, message: &Message) -> Result<(), Error> {
        if !self.contains(message) {
            return Err(Error::foreign_message(message.id()));
        }
        self.lock_handled().insert(message.id().to_owned());
        Ok(())
    }

    /// Mark every message in the batch as processed.
    pub fn mark_all_processed(&self) {
        let mut handled = self.lock_handled();
        for message in &self.inner.messages {
            handled.insert(message.id().to_owned());
        }
    }

    /// Resolve after a [`BatchResult::Complete`] verdict: delete every
    /// message marked processed, send every unmarked message back for
    /// redelivery as attempt 1.
    ///
    /// Unmarked messages are treated as not-yet-handled, never as done; a
    /// handler that skips messages gets them redelivered.
    ///
    /// [`BatchResult::Complete`]: crate::BatchResult::Complete
    pub async fn complete<Q>(
        &self,
        client: &Q,
        max_retries: u32,
        retry_visibility: std::time::Duration,
    ) -> Result<(), Error>
    where
        Q: QueueClient + Sync,
    {
        let deletable = self.lock_handled().clone();
        self.resolve(client, deletable, max_retries, retry_visibility)
            .await
    }

    /// Resolve after a [`BatchResult::Retry`] verdict: every message goes
    /// back for redelivery, marked or not.
    ///
    /// [`BatchResult::Retry`]: crate::BatchResult::Retry
    pub async fn retry_all<Q>(
        &self,
        client: &Q,
        max_retries: u32,
        retry_visibility: std::time::Duration,
    ) -> Result<(), Error>
    where
        Q: QueueClient + Sync,
    {
        self.resolve(
            client,
            std::collections::HashSet::new(),
            max_retries,
            retry_visibility,
        )
        .await
    }

    /// Issue the per-message queue calls concurrently, attempting every
    /// message even after individual failures.
    async fn resolve<Q>(
        &self,
        client: &Q,
        deletable: std::collections::HashSet<String>,
        max_retries: u32,
        retry_visibility: std::time::Duration,
    ) -> Result<(), Error>
    where
        Q: QueueClient + Sync,
    {
        let mut calls = futures::stream::FuturesUnordered::new();
        for message in &self.inner.messages {
            let delete = deletable.contains(message.id());
            calls.push(async move {
                if delete {
                    client.delete(message).await
                } else {
                    client
                        .retry(message, FIRST_ATTEMPT, max_retries, retry_visibility)
                        .await
                }
            });
        }

        let attempted = calls.len();
        let mut failures: Vec<Box<dyn std::error::Error + Send + 'static>> = Vec::new();
        while let Some(result) = calls.next().await {
            if let Err(error) = result {
                failures.push(Box::new(error));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::resolution(attempted, failures))
        }
    }

    fn contains(&self, message: &Message) -> bool {
        self.inner
            .messages
            .iter()
            .any(|candidate| candidate.id() == message.id())
    }

    fn lock_handled(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::HashSet<String>> {
        // Handler and worker touch the set sequentially; the lock exists for
        // Send safety, so a poisoned guard is still usable.
        self.inner
            .handled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
