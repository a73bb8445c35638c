//! Per-request serialized delivery of snapshots to the engine.
//!
//! Each request id gets its own queue and worker task, so snapshots of the
//! same request are handled one at a time and in arrival order while
//! independent requests proceed in parallel. A semaphore caps how many
//! snapshots are being handled at once.
//!
//! Because the engine is snapshot-idempotent, a worker that finds several
//! queued snapshots for its request only handles the newest one; everyone
//! waiting on the older ones receives that result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tracing::{debug, error, warn};

use alertbridge_core::{AccessRequest, RequestId};

use crate::engine::{HandleOutcome, SyncEngine};
use crate::error::EngineError;

pub type HandleResult = Result<HandleOutcome, EngineError>;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of snapshots handled at the same time.
    pub max_concurrency: usize,
    /// Deadline for a single handling attempt.
    pub handle_timeout: Duration,
    /// Attempts per snapshot, including the first. Only retryable errors are retried.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(),
            handle_timeout: Duration::from_secs(30),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Twice the available parallelism.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

struct Job {
    request: AccessRequest,
    reply: Option<oneshot::Sender<HandleResult>>,
}

type Queues = Arc<Mutex<HashMap<RequestId, mpsc::UnboundedSender<Job>>>>;

pub struct Dispatcher {
    engine: Arc<SyncEngine>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    queues: Queues,
}

impl Dispatcher {
    pub fn new(engine: Arc<SyncEngine>, config: DispatcherConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            engine,
            config,
            permits,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue a snapshot without waiting for it to be handled.
    pub async fn submit(&self, request: AccessRequest) {
        self.enqueue(Job {
            request,
            reply: None,
        })
        .await;
    }

    /// Queue a snapshot and wait for the final result, retries included.
    pub async fn submit_and_wait(&self, request: AccessRequest) -> HandleResult {
        let (tx, rx) = oneshot::channel();
        let id = request.id.clone();
        self.enqueue(Job {
            request,
            reply: Some(tx),
        })
        .await;

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                // Only happens if the worker panicked.
                error!("Worker for request {} exited without replying", id);
                Err(EngineError::Dispatch {
                    reason: "worker exited without replying",
                })
            }
        }
    }

    /// Number of requests that currently have a live worker.
    pub async fn active_requests(&self) -> usize {
        self.queues.lock().await.len()
    }

    async fn enqueue(&self, job: Job) {
        let mut queues = self.queues.lock().await;
        let id = job.request.id.clone();

        let job = match queues.get(&id) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                // The worker is gone; start a fresh one below.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive until the worker starts, so this cannot fail.
        let _ = tx.send(job);
        queues.insert(id.clone(), tx);

        let worker = Worker {
            id,
            rx,
            engine: self.engine.clone(),
            config: self.config.clone(),
            permits: self.permits.clone(),
            queues: self.queues.clone(),
        };
        tokio::spawn(worker.run());
    }
}

struct Worker {
    id: RequestId,
    rx: mpsc::UnboundedReceiver<Job>,
    engine: Arc<SyncEngine>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    queues: Queues,
}

impl Worker {
    async fn run(mut self) {
        while let Some(batch) = self.next_batch().await {
            let mut replies = Vec::new();
            let mut latest = None;
            for job in batch {
                replies.extend(job.reply);
                latest = Some(job.request);
            }
            let Some(request) = latest else { continue };

            if replies.len() > 1 {
                debug!(
                    "Coalesced {} snapshots for request {}",
                    replies.len(),
                    self.id
                );
            }

            let result = self.handle_with_retries(&request).await;
            for reply in replies {
                let _ = reply.send(result.clone());
            }
        }
    }

    /// Everything queued right now, or `None` once the queue is empty and
    /// this worker has deregistered itself.
    async fn next_batch(&mut self) -> Option<Vec<Job>> {
        let mut batch = Vec::new();
        while let Ok(job) = self.rx.try_recv() {
            batch.push(job);
        }
        if !batch.is_empty() {
            return Some(batch);
        }

        // Senders only push while holding the queues lock, so an empty
        // channel checked under the lock stays empty.
        let mut queues = self.queues.lock().await;
        while let Ok(job) = self.rx.try_recv() {
            batch.push(job);
        }
        if batch.is_empty() {
            queues.remove(&self.id);
            None
        } else {
            Some(batch)
        }
    }

    async fn handle_with_retries(&self, request: &AccessRequest) -> HandleResult {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 1;

        loop {
            let result = {
                let _permit = match self.permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(EngineError::Dispatch {
                            reason: "concurrency limiter closed",
                        })
                    }
                };
                self.engine
                    .handle_within(request, self.config.handle_timeout)
                    .await
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    warn!(
                        "Handling request {} failed (attempt {}/{}), retrying in {:?}: {}",
                        self.id, attempt, self.config.max_attempts, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    error!(
                        "Giving up on request {} after {} attempts: {}",
                        self.id, attempt, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        "Request {} needs operator attention, not retrying: {}",
                        self.id, e
                    );
                    return Err(e);
                }
            }
        }
    }
}
