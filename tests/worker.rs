//! End-to-end loop behavior against a scripted queue client.

use std::sync::{Arc, Mutex};

use taba::{
    Batch, BatchResult, CancellationToken, Message, QueueClient, QueueDriver, Retrieval,
    WorkerBuilder,
};

struct ScriptDriver;

impl QueueDriver for ScriptDriver {
    type Error = ScriptError;
}

#[derive(Debug)]
struct ScriptError;

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("scripted queue failure")
    }
}

impl std::error::Error for ScriptError {}

struct ScriptLane(Vec<Message>);

impl Retrieval for ScriptLane {
    type Driver = ScriptDriver;

    async fn release(self) -> Vec<Message> {
        self.0
    }
}

/// Hands out pre-scripted lanes in order, empty lanes once the script runs
/// dry, and records every acknowledge call.
#[derive(Clone, Default)]
struct ScriptedClient {
    lanes: Arc<Mutex<std::collections::VecDeque<Vec<Message>>>>,
    fetches: Arc<Mutex<usize>>,
    deleted: Arc<Mutex<Vec<String>>>,
    retried: Arc<Mutex<Vec<(String, u32)>>>,
}

impl ScriptedClient {
    fn push_lane(&self, ids: &[&str]) {
        let messages = ids
            .iter()
            .map(|id| Message::new(*id, Vec::new()))
            .collect();
        self.lanes.lock().unwrap().push_back(messages);
    }
}

impl QueueClient for ScriptedClient {
    type Driver = ScriptDriver;
    type Lane = ScriptLane;

    async fn fetch(
        &self,
        _visibility_timeout: std::time::Duration,
        _token: CancellationToken,
    ) -> Result<Self::Lane, ScriptError> {
        *self.fetches.lock().unwrap() += 1;
        let next = self.lanes.lock().unwrap().pop_front().unwrap_or_default();
        Ok(ScriptLane(next))
    }

    async fn delete(&self, message: &Message) -> Result<(), ScriptError> {
        self.deleted.lock().unwrap().push(message.id().to_owned());
        Ok(())
    }

    async fn retry(
        &self,
        message: &Message,
        attempt: u32,
        _max_retries: u32,
        _visibility_timeout: std::time::Duration,
    ) -> Result<(), ScriptError> {
        self.retried
            .lock()
            .unwrap()
            .push((message.id().to_owned(), attempt));
        Ok(())
    }
}

#[tokio::test]
async fn merges_lanes_in_order_and_resolves_partial_success() {
    let client = ScriptedClient::default();
    client.push_lane(&["a1", "a2", "a3"]);
    client.push_lane(&["b1", "b2", "b3"]);

    let token = CancellationToken::new();
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();

    let handler = {
        let token = token.clone();
        let seen = seen.clone();
        move |batch: Batch| {
            let token = token.clone();
            let seen = seen.clone();
            async move {
                for message in batch.messages() {
                    seen.lock().unwrap().push(message.id().to_owned());
                    if matches!(message.id(), "a1" | "a3" | "b2") {
                        batch.mark_processed(message).unwrap();
                    }
                }
                token.cancel();
                BatchResult::Complete
            }
        }
    };

    WorkerBuilder::new()
        .parallelism(2)
        .handler(handler)
        .build(client.clone())
        .with_graceful_shutdown(token)
        .run()
        .await;

    assert_eq!(
        *seen.lock().unwrap(),
        ["a1", "a2", "a3", "b1", "b2", "b3"]
    );

    let mut deleted = client.deleted.lock().unwrap().clone();
    deleted.sort();
    assert_eq!(deleted, ["a1", "a3", "b2"]);

    let mut retried = client.retried.lock().unwrap().clone();
    retried.sort();
    assert_eq!(
        retried,
        vec![
            ("a2".to_string(), 1),
            ("b1".to_string(), 1),
            ("b3".to_string(), 1)
        ]
    );
}

#[tokio::test]
async fn failed_verdict_retries_every_message() {
    let client = ScriptedClient::default();
    client.push_lane(&["m1", "m2", "m3", "m4"]);

    let token = CancellationToken::new();
    let handler = {
        let token = token.clone();
        move |batch: Batch| {
            let token = token.clone();
            async move {
                // Marks must not matter on the failure path.
                let messages = batch.messages().to_vec();
                batch.mark_processed(&messages[0]).unwrap();
                batch.mark_processed(&messages[1]).unwrap();
                token.cancel();
                BatchResult::Retry
            }
        }
    };

    WorkerBuilder::new()
        .parallelism(1)
        .handler(handler)
        .build(client.clone())
        .with_graceful_shutdown(token)
        .run()
        .await;

    assert!(client.deleted.lock().unwrap().is_empty());

    let mut retried = client.retried.lock().unwrap().clone();
    retried.sort();
    assert_eq!(
        retried,
        vec![
            ("m1".to_string(), 1),
            ("m2".to_string(), 1),
            ("m3".to_string(), 1),
            ("m4".to_string(), 1)
        ]
    );
}

#[tokio::test]
async fn shared_context_reaches_the_handler() {
    let client = ScriptedClient::default();
    client.push_lane(&["c1"]);

    let token = CancellationToken::new();
    let counter: Arc<Mutex<usize>> = Arc::default();

    let handler = {
        let token = token.clone();
        move |batch: Batch, taba::HandlerContext(counter): taba::HandlerContext<Arc<Mutex<usize>>>| {
            let token = token.clone();
            async move {
                *counter.lock().unwrap() += 1;
                batch.mark_all_processed();
                token.cancel();
                BatchResult::Complete
            }
        }
    };

    WorkerBuilder::new()
        .parallelism(1)
        .context(counter.clone())
        .handler(handler)
        .build(client.clone())
        .with_graceful_shutdown(token)
        .run()
        .await;

    assert_eq!(*counter.lock().unwrap(), 1);
    assert_eq!(*client.deleted.lock().unwrap(), ["c1"]);
    assert!(client.retried.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_cycles_never_invoke_the_handler() {
    let client = ScriptedClient::default();
    let invocations: Arc<Mutex<usize>> = Arc::default();

    let handler = {
        let invocations = invocations.clone();
        move |_batch: Batch| {
            let invocations = invocations.clone();
            async move {
                *invocations.lock().unwrap() += 1;
                BatchResult::Complete
            }
        }
    };

    let token = CancellationToken::new();
    let run = tokio::spawn(
        WorkerBuilder::new()
            .parallelism(3)
            .handler(handler)
            .build(client.clone())
            .with_graceful_shutdown(token.clone())
            .run(),
    );

    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    token.cancel();
    run.await.unwrap();

    assert_eq!(*invocations.lock().unwrap(), 0);
    // At least one full fan-out happened before the stop.
    assert!(*client.fetches.lock().unwrap() >= 3);
    assert!(client.deleted.lock().unwrap().is_empty());
    assert!(client.retried.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_sentinel_batch_reaches_the_handler_when_enabled() {
    let client = ScriptedClient::default();
    let token = CancellationToken::new();
    let sizes: Arc<Mutex<Vec<usize>>> = Arc::default();

    let handler = {
        let token = token.clone();
        let sizes = sizes.clone();
        move |batch: Batch| {
            let token = token.clone();
            let sizes = sizes.clone();
            async move {
                sizes.lock().unwrap().push(batch.messages().len());
                token.cancel();
                BatchResult::Complete
            }
        }
    };

    WorkerBuilder::new()
        .run_on_empty(true)
        .handler(handler)
        .build(client.clone())
        .with_graceful_shutdown(token)
        .run()
        .await;

    assert_eq!(*sizes.lock().unwrap(), [0]);
    assert!(client.deleted.lock().unwrap().is_empty());
    assert!(client.retried.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stop_interrupts_the_backoff_delay() {
    let client = ScriptedClient::default();
    let handler = |_batch: Batch| async move { BatchResult::Complete };

    let handle = WorkerBuilder::new()
        .max_backoff(std::time::Duration::from_secs(60))
        .handler(handler)
        .build(client.clone())
        .start();

    // Let the loop settle into a backoff delay.
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    tokio::time::timeout(std::time::Duration::from_secs(2), handle.stop())
        .await
        .expect("stop should interrupt the backoff delay");

    // No retrieval round starts after the stop.
    let fetched_after = *client.fetches.lock().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(*client.fetches.lock().unwrap(), fetched_after);
}
