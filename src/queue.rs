//! Queue-facing traits: lease messages in parallel lanes, settle outcomes.
//!
//! Small surface, strong separation: the worker drives; the queue stores.
//!
//! Why:
//! - The queue owns lease semantics and the retry-ceiling policy (transport
//!   knows best).
//! - Releasing a lane consumes `self` and is the only way to reach its
//!   messages, so exactly-once release holds by type.
//! - Fetch takes `&self` because the worker issues several lanes per cycle
//!   against one client.
mod tmp {
    use crate::batch::Message;

    /// Queue marker carrying the queue-specific error type.
    pub trait QueueDriver: Send {
        type Error: std::error::Error + Send + 'static;
    }

    /// Scoped result of one retrieval lane.
    ///
    /// Why: lane-local resources (a per-call client handle, a lease scope)
    /// must be given back exactly once per cycle, whether or not the
    /// messages end up acknowledged.
    #[trait_variant::make(Retrieval: Send)]
    pub trait LocalRetrieval {
        type Driver: QueueDriver;

        /// Release lane-local resources and hand back the fetched messages.
        ///
        /// The messages themselves stay leased queue-side until deleted or
        /// retried.
        #[allow(unused)]
        async fn release(self) -> Vec<Message>;
    }

    /// Queue operations the worker needs.
    #[trait_variant::make(QueueClient: Send)]
    pub trait LocalQueueClient {
        type Driver: QueueDriver;
        type Lane: Retrieval<Driver = Self::Driver> + Send + 'static;

        /// Lease zero or more messages for `visibility_timeout`.
        ///
        /// Called concurrently, once per lane. Implementations should return
        /// promptly once `token` is cancelled instead of blocking out a long
        /// poll.
        #[allow(unused)]
        async fn fetch(
            &self,
            visibility_timeout: std::time::Duration,
            token: tokio_util::sync::CancellationToken,
        ) -> Result<Self::Lane, <Self::Driver as QueueDriver>::Error>;

        /// Permanently remove a processed message.
        #[allow(unused)]
        async fn delete(
            &self,
            message: &Message,
        ) -> Result<(), <Self::Driver as QueueDriver>::Error>;

        /// Make `message` redeliverable after `visibility_timeout`.
        ///
        /// What happens once `attempt` passes `max_retries` (re-lease,
        /// dead-letter, drop) is the implementation's decision.
        #[allow(unused)]
        async fn retry(
            &self,
            message: &Message,
            attempt: u32,
            max_retries: u32,
            visibility_timeout: std::time::Duration,
        ) -> Result<(), <Self::Driver as QueueDriver>::Error>;
    }
}

pub use tmp::{QueueClient, QueueDriver, Retrieval};
