use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use taba::{
    Batch, BatchResult, CancellationToken, Message, QueueClient, QueueDriver, Retrieval,
    WorkerBuilder,
};

struct MemoryDriver;

impl QueueDriver for MemoryDriver {
    type Error = MemoryError;
}

#[derive(Debug)]
struct MemoryError;

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("in-memory queue failure")
    }
}

impl std::error::Error for MemoryError {}

struct MemoryLane(Vec<Message>);

impl Retrieval for MemoryLane {
    type Driver = MemoryDriver;

    async fn release(self) -> Vec<Message> {
        self.0
    }
}

/// Toy queue: popped messages are gone unless the worker retries them.
#[derive(Clone, Default)]
struct MemoryQueue {
    messages: Arc<Mutex<VecDeque<Message>>>,
}

impl MemoryQueue {
    fn enqueue(&self, message: Message) {
        self.messages.lock().unwrap().push_back(message);
    }
}

impl QueueClient for MemoryQueue {
    type Driver = MemoryDriver;
    type Lane = MemoryLane;

    async fn fetch(
        &self,
        _visibility_timeout: std::time::Duration,
        _token: CancellationToken,
    ) -> Result<Self::Lane, MemoryError> {
        let mut queue = self.messages.lock().unwrap();
        let take = queue.len().min(4);
        Ok(MemoryLane(queue.drain(..take).collect()))
    }

    async fn delete(&self, message: &Message) -> Result<(), MemoryError> {
        tracing::debug!(id = message.id(), "deleted");
        Ok(())
    }

    async fn retry(
        &self,
        message: &Message,
        attempt: u32,
        max_retries: u32,
        _visibility_timeout: std::time::Duration,
    ) -> Result<(), MemoryError> {
        if attempt > max_retries {
            tracing::warn!(id = message.id(), "dropping poison message");
            return Ok(());
        }
        self.messages.lock().unwrap().push_back(message.clone());
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let queue = MemoryQueue::default();
    let handle = WorkerBuilder::new()
        .parallelism(2)
        .handler(batch_handler)
        .build(queue.clone())
        .start();

    let producer_queue = queue.clone();
    let producer = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(500));
        for n in 0..32u32 {
            interval.tick().await;
            tracing::info!("Enqueue message {}", n);
            producer_queue.enqueue(Message::new(format!("msg-{n}"), n.to_le_bytes()));
        }
    });

    let _ = tokio::signal::ctrl_c().await;
    producer.abort();
    handle.stop().await;
}

async fn batch_handler(batch: Batch) -> BatchResult {
    for message in batch.messages() {
        tracing::info!(id = message.id(), bytes = message.payload().len(), "processing");
    }
    batch.mark_all_processed();
    BatchResult::Complete
}
