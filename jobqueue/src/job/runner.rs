use std::{
    fmt::Display,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinError,
};
use tracing::{instrument, Instrument};

use crate::{
    backoff::Strategy,
    handler::{HandlerError, HandlerRegistry, JobHandler},
    stats::StatsAggregator,
};

use super::Job;

const REQUEUE_FULL: &str = "failed to requeue: queue is full";
const REQUEUE_STOPPED: &str = "failed to requeue: queue is stopped";
const BACKOFF_PANICKED: &str = "failed to requeue: backoff strategy panicked";

/// What became of a job after a worker processed it.
#[derive(Debug)]
pub(crate) enum Disposition {
    Completed(Job),
    Failed(Job),
    /// The job went back into the queue for another attempt.
    Requeued,
}

/// Dispatches jobs to their handlers and decides whether failed jobs are retried.
#[derive(Clone)]
pub(crate) struct JobRunner {
    registry: Arc<HandlerRegistry>,
    stats: Arc<StatsAggregator>,
    sender: mpsc::Sender<Job>,
    backoff: Arc<dyn Strategy + Send + Sync>,
}

impl JobRunner {
    pub(crate) fn new(
        registry: Arc<HandlerRegistry>,
        stats: Arc<StatsAggregator>,
        sender: mpsc::Sender<Job>,
        backoff: Arc<dyn Strategy + Send + Sync>,
    ) -> Self {
        Self {
            registry,
            stats,
            sender,
            backoff,
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type))]
    pub(crate) async fn process(&self, mut job: Job, worker_id: usize) -> Disposition {
        job.begin_attempt();
        tracing::debug!(
            attempt = job.attempts,
            "Worker {worker_id} processing job {} (type: {})",
            job.id,
            job.job_type
        );

        let Some(handler) = self.registry.get(&job.job_type) else {
            tracing::error!("No handler registered for job type {}", job.job_type);
            job.mark_failed(format!("no handler registered for job type: {}", job.job_type));
            self.stats.record_failed();
            return Disposition::Failed(job);
        };

        let result = {
            let _active = self.stats.enter_active();
            invoke(handler, &job).await
        };

        match result {
            Ok(()) => {
                job.mark_completed();
                self.stats.record_processed();
                tracing::info!(attempt = job.attempts, "Job {} completed successfully", job.id);
                Disposition::Completed(job)
            }
            Err(failure) => self.handle_failure(job, failure).await,
        }
    }

    async fn handle_failure(&self, mut job: Job, failure: Failure) -> Disposition {
        let job_id = job.id;
        if !job.has_retries_remaining() {
            tracing::error!(
                ?failure,
                attempt = job.attempts,
                max_retry = job.max_retry,
                "Job {job_id} failed permanently after {} attempts: {failure}",
                job.attempts,
            );
            job.mark_failed(failure.to_string());
            self.stats.record_failed();
            return Disposition::Failed(job);
        }

        // Runs on the worker task, outside the handler's panic guard.
        let attempts = job.attempts;
        let Ok(delay) = catch_unwind(AssertUnwindSafe(|| self.backoff.backoff(attempts))) else {
            tracing::error!(?failure, "Backoff strategy panicked while retrying job {job_id}");
            job.mark_failed(BACKOFF_PANICKED);
            self.stats.record_failed();
            return Disposition::Failed(job);
        };
        tracing::warn!(
            ?failure,
            attempt = job.attempts,
            max_retry = job.max_retry,
            ?delay,
            "Job {job_id} failed, retrying ({}/{}) in {delay:?}: {failure}",
            job.attempts,
            job.max_retry,
        );
        job.mark_retrying(failure.to_string());

        self.requeue_after(job, delay).await
    }

    /// Sleeps on the current worker, then puts the job back at the end of the queue.
    async fn requeue_after(&self, job: Job, delay: Duration) -> Disposition {
        tokio::time::sleep(delay).await;

        let (mut job, reason) = match self.sender.try_send(job) {
            Ok(()) => {
                self.stats.record_retried();
                return Disposition::Requeued;
            }
            Err(TrySendError::Full(job)) => (job, REQUEUE_FULL),
            Err(TrySendError::Closed(job)) => (job, REQUEUE_STOPPED),
        };
        tracing::error!("Failed to requeue job {}: {reason}", job.id);
        job.mark_failed(reason);
        self.stats.record_failed();
        Disposition::Failed(job)
    }
}

/// Runs the handler on its own task so that a panic is reported as a failure rather than taking
/// down the worker.
async fn invoke(handler: Arc<dyn JobHandler>, job: &Job) -> Result<(), Failure> {
    let job = job.clone();
    tokio::spawn(async move { handler.handle(&job).await }.in_current_span())
        .await?
        .map_err(Failure::from)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Handler,
    Panic,
}

#[derive(Debug)]
struct Failure {
    kind: FailureKind,
    message: String,
}

impl Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FailureKind::Handler => f.write_str(&self.message),
            FailureKind::Panic => write!(f, "handler panicked: {}", self.message),
        }
    }
}

impl From<HandlerError> for Failure {
    fn from(value: HandlerError) -> Self {
        Self {
            kind: FailureKind::Handler,
            message: value.to_string(),
        }
    }
}

impl From<JoinError> for Failure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            kind: FailureKind::Panic,
            message,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use tokio::time::Instant;

    use super::*;
    use crate::{
        backoff::{BackoffStrategy, DEFAULT_BACKOFF},
        handler::{FnHandler, MockJobHandler},
        job::JobStatus,
    };

    struct Harness {
        runner: JobRunner,
        registry: Arc<HandlerRegistry>,
        stats: Arc<StatsAggregator>,
        receiver: mpsc::Receiver<Job>,
    }

    fn harness(capacity: usize) -> Harness {
        let registry = Arc::new(HandlerRegistry::new());
        let stats = Arc::new(StatsAggregator::default());
        let (sender, receiver) = mpsc::channel(capacity);
        let runner = JobRunner::new(
            registry.clone(),
            stats.clone(),
            sender,
            Arc::new(DEFAULT_BACKOFF),
        );
        Harness {
            runner,
            registry,
            stats,
            receiver,
        }
    }

    fn always_fail() -> Arc<dyn JobHandler> {
        Arc::new(FnHandler::new(|_job: &Job| Err("boom".into())))
    }

    #[tokio::test]
    async fn successful_job_completes_on_first_attempt() {
        let h = harness(10);
        let mut handler = MockJobHandler::new();
        handler
            .expect_handle()
            .withf(|job| job.job_type == "noop" && job.attempts == 1)
            .times(1)
            .returning(|_| Ok(()));
        h.registry.register("noop", Arc::new(handler));

        let disposition = h
            .runner
            .process(Job::raw_job().with_job_type("noop"), 0)
            .await;

        assert_matches!(disposition, Disposition::Completed(job) => {
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.attempts, 1);
            assert_eq!(job.error, None);
        });
        let stats = h.stats.snapshot();
        assert_eq!((stats.processed, stats.failed, stats.retried), (1, 0, 0));
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn missing_handler_fails_without_retrying() {
        let h = harness(10);

        let disposition = h
            .runner
            .process(Job::raw_job().with_job_type("unknown"), 0)
            .await;

        assert_matches!(disposition, Disposition::Failed(job) => {
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(
                job.error.as_deref(),
                Some("no handler registered for job type: unknown")
            );
        });
        let stats = h.stats.snapshot();
        assert_eq!((stats.failed, stats.retried), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_is_requeued_after_backoff() {
        let mut h = harness(10);
        h.registry.register("always_fail", always_fail());
        let job = Job::raw_job()
            .with_job_type("always_fail")
            .with_max_retry(2);
        let job_id = job.id;

        let started = Instant::now();
        let disposition = h.runner.process(job, 0).await;

        assert_matches!(disposition, Disposition::Requeued);
        assert!(started.elapsed() >= Duration::from_secs(1));
        let requeued = h.receiver.try_recv().unwrap();
        assert_eq!(requeued.id, job_id);
        assert_eq!(requeued.status, JobStatus::Retrying);
        assert_eq!(requeued.attempts, 1);
        assert_eq!(requeued.error.as_deref(), Some("boom"));
        assert_eq!(h.stats.snapshot().retried, 1);

        let disposition = h.runner.process(requeued, 0).await;
        assert_matches!(disposition, Disposition::Failed(job) => {
            assert_eq!(job.attempts, 2);
            assert_eq!(job.error.as_deref(), Some("boom"));
        });
        let stats = h.stats.snapshot();
        assert_eq!((stats.failed, stats.retried, stats.processed), (1, 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_quadratically_with_attempts() {
        let mut h = harness(10);
        h.registry.register("always_fail", always_fail());
        let mut job = Job::raw_job()
            .with_job_type("always_fail")
            .with_max_retry(4);

        for expected in [1, 4, 9] {
            let started = Instant::now();
            assert_matches!(h.runner.process(job, 0).await, Disposition::Requeued);
            let elapsed = started.elapsed();
            assert!(elapsed >= Duration::from_secs(expected));
            assert!(elapsed < Duration::from_secs(expected) + Duration::from_millis(50));
            job = h.receiver.try_recv().unwrap();
        }

        assert_matches!(h.runner.process(job, 0).await, Disposition::Failed(job) => {
            assert_eq!(job.attempts, 4);
        });
    }

    #[tokio::test]
    async fn requeue_into_full_queue_fails_the_job() {
        let registry = Arc::new(HandlerRegistry::new());
        let stats = Arc::new(StatsAggregator::default());
        let (sender, _receiver) = mpsc::channel(1);
        sender.try_send(Job::raw_job()).unwrap();
        let runner = JobRunner::new(
            registry.clone(),
            stats.clone(),
            sender,
            Arc::new(BackoffStrategy::constant(Duration::ZERO)),
        );
        registry.register("always_fail", always_fail());

        let disposition = runner
            .process(Job::raw_job().with_job_type("always_fail"), 0)
            .await;

        assert_matches!(disposition, Disposition::Failed(job) => {
            assert_eq!(job.attempts, 1);
            assert_eq!(job.error.as_deref(), Some(REQUEUE_FULL));
        });
        let stats = stats.snapshot();
        assert_eq!((stats.failed, stats.retried), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_into_closed_queue_fails_the_job() {
        let mut h = harness(10);
        h.registry.register("always_fail", always_fail());
        h.receiver.close();

        let disposition = h
            .runner
            .process(Job::raw_job().with_job_type("always_fail"), 0)
            .await;

        assert_matches!(disposition, Disposition::Failed(job) => {
            assert_eq!(job.error.as_deref(), Some(REQUEUE_STOPPED));
        });
    }

    struct Broken;

    impl Strategy for Broken {
        fn backoff(&self, _attempt: u32) -> Duration {
            panic!("broken backoff")
        }
    }

    #[tokio::test]
    async fn panicking_backoff_fails_the_job_instead_of_the_worker() {
        let registry = Arc::new(HandlerRegistry::new());
        let stats = Arc::new(StatsAggregator::default());
        let (sender, mut receiver) = mpsc::channel(10);
        let runner = JobRunner::new(registry.clone(), stats.clone(), sender, Arc::new(Broken));
        registry.register("always_fail", always_fail());

        let disposition = runner
            .process(Job::raw_job().with_job_type("always_fail"), 0)
            .await;

        assert_matches!(disposition, Disposition::Failed(job) => {
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.error.as_deref(), Some(BACKOFF_PANICKED));
        });
        assert!(receiver.try_recv().is_err());
        let stats = stats.snapshot();
        assert_eq!((stats.failed, stats.retried, stats.active), (1, 0, 0));
    }

    #[tokio::test]
    async fn panicking_handler_is_a_failure() {
        let h = harness(10);
        h.registry.register(
            "panics",
            Arc::new(FnHandler::new(|_job: &Job| panic!("kaboom"))),
        );

        let disposition = h
            .runner
            .process(Job::raw_job().with_job_type("panics").with_max_retry(1), 0)
            .await;

        assert_matches!(disposition, Disposition::Failed(job) => {
            assert_eq!(job.error.as_deref(), Some("handler panicked: kaboom"));
        });
        let stats = h.stats.snapshot();
        assert_eq!((stats.failed, stats.active), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn job_that_recovers_counts_retries_but_no_failure() {
        let mut h = harness(10);
        let attempts = Arc::new(Mutex::new(Vec::new()));
        h.registry.register(
            "flaky",
            Arc::new(FnHandler::new({
                let attempts = attempts.clone();
                move |job: &Job| {
                    attempts.lock().unwrap().push(job.attempts);
                    if job.attempts < 3 {
                        Err("not yet".into())
                    } else {
                        Ok(())
                    }
                }
            })),
        );

        let mut disposition = h
            .runner
            .process(Job::raw_job().with_job_type("flaky").with_max_retry(5), 0)
            .await;
        while let Disposition::Requeued = disposition {
            let job = h.receiver.try_recv().unwrap();
            disposition = h.runner.process(job, 0).await;
        }

        assert_matches!(disposition, Disposition::Completed(job) => {
            assert_eq!(job.attempts, 3);
            assert_eq!(job.error.as_deref(), Some("not yet"));
        });
        assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);
        let stats = h.stats.snapshot();
        assert_eq!((stats.processed, stats.retried, stats.failed), (1, 2, 0));
    }
}
