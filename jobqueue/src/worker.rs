use std::sync::Arc;

use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::job::{
    runner::{Disposition, JobRunner},
    Job,
};

pub(crate) type SharedReceiver = Arc<Mutex<mpsc::Receiver<Job>>>;

/// The fixed set of workers consuming from a queue.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        workers: usize,
        receiver: SharedReceiver,
        runner: JobRunner,
        cancellation_token: CancellationToken,
    ) -> Self {
        let handles = (0..workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    receiver.clone(),
                    runner.clone(),
                    cancellation_token.clone(),
                ))
            })
            .collect();
        Self { handles }
    }

    /// Waits for every worker to finish the job it is currently processing and exit.
    pub(crate) async fn join(self) -> Result<(), tokio::task::JoinError> {
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .collect()
    }
}

/// Processes one job at a time until cancelled or the queue is closed.
///
/// Cancellation is only observed while waiting for the next job: a job being processed, retry
/// backoff included, always runs to completion.
async fn worker_loop(
    worker_id: usize,
    receiver: SharedReceiver,
    runner: JobRunner,
    cancellation_token: CancellationToken,
) {
    tracing::debug!(worker_id, "Worker {worker_id} started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                tracing::debug!(worker_id, "Worker {worker_id} stopped due to cancellation");
                break;
            }
            job = next_job(&receiver) => job,
        };

        match job {
            Some(job) => match runner.process(job, worker_id).await {
                Disposition::Completed(job) | Disposition::Failed(job) => tracing::trace!(
                    worker_id,
                    job_id = %job.id,
                    status = %job.status,
                    "Worker {worker_id} finished job {}",
                    job.id
                ),
                Disposition::Requeued => {}
            },
            None => {
                tracing::debug!(worker_id, "Worker {worker_id} stopped, queue closed");
                break;
            }
        }
    }
}

async fn next_job(receiver: &Mutex<mpsc::Receiver<Job>>) -> Option<Job> {
    receiver.lock().await.recv().await
}
