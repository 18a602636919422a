//! Job queue contract and the in-memory implementation.
//!
//! The queue carries job IDs only; job state lives in the `JobStore`.
//! Delayed enqueues back delay and digest waits: a job becomes visible
//! to `dequeue` only once its delay has elapsed.

use async_trait::async_trait;
use herald_core::error::HeraldResult;
use herald_core::types::JobId;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// FIFO-with-delays queue contract shared by all workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Make a job available for processing, optionally after a delay.
    async fn enqueue(&self, job_id: JobId, delay: Option<Duration>) -> HeraldResult<()>;
    /// Take the next visible job, or `None` when the queue is drained.
    /// The job stays in-flight until acked or nacked.
    async fn dequeue(&self) -> HeraldResult<Option<JobId>>;
    /// Remove a processed job from the in-flight set.
    async fn ack(&self, job_id: JobId) -> HeraldResult<()>;
    /// Return an in-flight job to the queue after a delay.
    async fn nack(&self, job_id: JobId, delay: Duration) -> HeraldResult<()>;
}

struct QueuedJob {
    job_id: JobId,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    waiting: Vec<QueuedJob>,
    in_flight: HashSet<JobId>,
}

/// In-memory queue with delayed visibility, for tests and embedded use.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Block until a job is enqueued, then return immediately. Workers
    /// use this between empty polls instead of a fixed sleep.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().waiting.len()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job_id: JobId, delay: Option<Duration>) -> HeraldResult<()> {
        let visible_at = Instant::now() + delay.unwrap_or(Duration::ZERO);
        {
            let mut state = self.state.lock().unwrap();
            state.waiting.push(QueuedJob { job_id, visible_at });
        }
        debug!(job_id = %job_id, delay_ms = delay.map(|d| d.as_millis()), "job enqueued");
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> HeraldResult<Option<JobId>> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let position = state.waiting.iter().position(|q| q.visible_at <= now);
        Ok(position.map(|i| {
            let queued = state.waiting.remove(i);
            state.in_flight.insert(queued.job_id);
            queued.job_id
        }))
    }

    async fn ack(&self, job_id: JobId) -> HeraldResult<()> {
        self.state.lock().unwrap().in_flight.remove(&job_id);
        Ok(())
    }

    async fn nack(&self, job_id: JobId, delay: Duration) -> HeraldResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.in_flight.remove(&job_id);
            state.waiting.push(QueuedJob {
                job_id,
                visible_at: Instant::now() + delay,
            });
        }
        self.notify.notify_one();
        Ok(())
    }
}
