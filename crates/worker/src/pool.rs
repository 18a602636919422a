//! Fixed-size pool of worker tasks draining the shared queue.

use crate::config::WorkerConfig;
use crate::processor::JobProcessor;
use crate::queue::JobQueue;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Spawns N worker tasks over one queue and processor, with graceful
/// shutdown via a cancellation token.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn start(
        processor: Arc<JobProcessor>,
        queue: Arc<dyn JobQueue>,
        config: WorkerConfig,
        concurrency: usize,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::with_capacity(concurrency);

        for worker in 0..concurrency {
            let processor = processor.clone();
            let queue = queue.clone();
            let token = shutdown.clone();
            let poll_interval = config.poll_interval;

            handles.push(tokio::spawn(async move {
                debug!(worker = worker, "worker task started");
                loop {
                    if token.is_cancelled() {
                        break;
                    }

                    match queue.dequeue().await {
                        Ok(Some(job_id)) => {
                            if let Err(e) = processor.process(job_id).await {
                                error!(worker = worker, job_id = %job_id, error = %e, "job processing failed");
                            }
                        }
                        Ok(None) => {
                            tokio::select! {
                                _ = token.cancelled() => break,
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                        }
                        Err(e) => {
                            error!(worker = worker, error = %e, "queue dequeue failed");
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
                debug!(worker = worker, "worker task stopped");
            }));
        }

        info!(concurrency = concurrency, "worker pool started");
        Self { handles, shutdown }
    }

    /// Signal all workers to stop and wait for them to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }
}
