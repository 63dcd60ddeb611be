//! A bounded, in-process background job queue.
//!
//! Producers [`Queue::push`] jobs identified by a type name and a JSON payload. A fixed pool of
//! workers started with [`Queue::start`] takes jobs off the queue in FIFO order and runs the
//! [`JobHandler`] registered for the job's type. Failing jobs are retried after a backoff, by
//! default `attempts²` seconds, until their retry budget is spent.
//!
//! The queue is best effort: nothing is persisted and jobs still waiting when the queue is
//! stopped are dropped.
//!
//! # Example
//!
//! ```
//! # use jobqueue::prelude::*;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let queue = Queue::new(QueueConfig::default().with_workers(2)).unwrap();
//! queue.register_fn("noop", |_job: &Job| Ok(()));
//! queue.start().unwrap();
//!
//! queue.push("noop", Payload::new(), 3).unwrap();
//! # while queue.stats().processed == 0 {
//! #     tokio::time::sleep(std::time::Duration::from_millis(1)).await;
//! # }
//!
//! queue.stop().await.unwrap();
//! assert_eq!(queue.stats().processed, 1);
//! # });
//! ```
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::{CancellationToken, DropGuard};

pub mod backoff;
pub mod builtin;
pub mod config;
pub mod handler;
pub mod job;
pub mod prelude;
mod stats;
mod worker;

use backoff::{Strategy, DEFAULT_BACKOFF};
use config::{ConfigError, QueueConfig};
use handler::{FnHandler, HandlerError, HandlerRegistry, JobHandler};
use job::{runner::JobRunner, Job, JobId, Payload};
use stats::StatsAggregator;
pub use stats::QueueStats;
use worker::{SharedReceiver, WorkerPool};

/// Handle to a job queue.
///
/// Cloning is cheap and every clone refers to the same queue, so a clone can be handed to each
/// producer.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    config: QueueConfig,
    sender: mpsc::Sender<Job>,
    receiver: SharedReceiver,
    registry: Arc<HandlerRegistry>,
    stats: Arc<StatsAggregator>,
    backoff: Arc<dyn Strategy + Send + Sync>,
    cancellation_token: CancellationToken,
    /// Stops the workers once the last handle is dropped without [`Queue::stop`].
    _shutdown_on_drop: DropGuard,
    state: Mutex<State>,
}

#[derive(Debug)]
enum State {
    Idle,
    Running(WorkerPool),
    Stopped,
}

impl Queue {
    /// Creates a queue using the default `attempts²` seconds retry backoff.
    ///
    /// Jobs can be pushed straight away, they are processed once [`Queue::start`] is called.
    pub fn new(config: QueueConfig) -> Result<Self, QueueError> {
        Self::with_backoff(config, DEFAULT_BACKOFF)
    }

    pub fn with_backoff(
        config: QueueConfig,
        backoff: impl Strategy + Send + Sync + 'static,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel(config.buffer_size);
        let cancellation_token = CancellationToken::new();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                sender,
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                registry: Default::default(),
                stats: Default::default(),
                backoff: Arc::new(backoff),
                _shutdown_on_drop: cancellation_token.clone().drop_guard(),
                cancellation_token,
                state: Mutex::new(State::Idle),
            }),
        })
    }

    /// Registers the handler for `job_type`, replacing any handler registered before.
    ///
    /// Handlers can be registered before or after the queue is started.
    pub fn register_handler(&self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        let job_type = job_type.into();
        tracing::debug!(queue = self.name(), "Registering handler for job type {job_type}");
        if self
            .inner
            .registry
            .register(job_type.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::debug!(queue = self.name(), "Replaced handler for job type {job_type}");
        }
    }

    /// Registers a synchronous closure as the handler for `job_type`.
    pub fn register_fn<F>(&self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register_handler(job_type, FnHandler::new(handler));
    }

    /// Enqueues a job without waiting.
    ///
    /// Fails with [`QueueError::QueueFull`] when the queue is at capacity and with
    /// [`QueueError::Stopped`] once the queue has been stopped.
    pub fn push(
        &self,
        job_type: impl Into<String>,
        payload: Payload,
        max_retry: u32,
    ) -> Result<JobId, QueueError> {
        let job = Job::new(job_type, payload, max_retry);
        let job_id = job.id;
        match self.inner.sender.try_send(job) {
            Ok(()) => {
                tracing::debug!(queue = self.name(), %job_id, "Job {job_id} queued");
                Ok(job_id)
            }
            Err(TrySendError::Full(job)) => {
                tracing::warn!(
                    queue = self.name(),
                    "Rejected job of type {}: queue is full",
                    job.job_type
                );
                Err(QueueError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(QueueError::Stopped),
        }
    }

    /// Enqueues a job with the configured default retry ceiling.
    pub fn push_default(
        &self,
        job_type: impl Into<String>,
        payload: Payload,
    ) -> Result<JobId, QueueError> {
        self.push(job_type, payload, self.inner.config.max_retry)
    }

    /// Enqueues a job whose payload is serialized from `data`, which must encode to a JSON
    /// object.
    pub fn push_data<T: Serialize + ?Sized>(
        &self,
        job_type: impl Into<String>,
        data: &T,
        max_retry: u32,
    ) -> Result<JobId, QueueError> {
        match serde_json::to_value(data)? {
            serde_json::Value::Object(payload) => self.push(job_type, payload, max_retry),
            _ => Err(QueueError::PayloadNotObject),
        }
    }

    /// Pushes the job once `delay` has elapsed.
    ///
    /// The push happens on a detached task: if it fails, for example because the queue is full
    /// at that point, the failure is logged and the job is dropped. The returned handle can be
    /// ignored.
    pub fn push_delay(
        &self,
        job_type: impl Into<String>,
        payload: Payload,
        max_retry: u32,
        delay: Duration,
    ) -> JoinHandle<()> {
        let job_type = job_type.into();
        tracing::debug!(queue = self.name(), ?delay, "Delayed job of type {job_type} scheduled");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue
                .push(job_type.as_str(), payload, max_retry)
                .inspect_err(|err| {
                    tracing::error!(
                        ?err,
                        queue = queue.name(),
                        "Delayed push of job type {job_type} failed: {err}"
                    )
                });
        })
    }

    /// Spawns the worker pool on the current tokio runtime.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut state = self.lock_state();
        match *state {
            State::Running(_) => return Err(QueueError::AlreadyStarted),
            State::Stopped => return Err(QueueError::Stopped),
            State::Idle => {}
        }

        let runner = JobRunner::new(
            self.inner.registry.clone(),
            self.inner.stats.clone(),
            self.inner.sender.clone(),
            self.inner.backoff.clone(),
        );
        *state = State::Running(WorkerPool::spawn(
            self.inner.config.workers,
            self.inner.receiver.clone(),
            runner,
            self.inner.cancellation_token.clone(),
        ));
        tracing::info!(
            queue = self.name(),
            workers = self.inner.config.workers,
            "Queue '{}' started with {} workers",
            self.name(),
            self.inner.config.workers
        );
        Ok(())
    }

    /// Stops the queue.
    ///
    /// Workers are signalled to stop and no further jobs are accepted. Jobs still waiting in the
    /// queue are discarded. Returns once the jobs that were already being processed have
    /// finished.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let previous = std::mem::replace(&mut *self.lock_state(), State::Stopped);
        let pool = match previous {
            State::Stopped => return Ok(()),
            State::Idle => None,
            State::Running(pool) => Some(pool),
        };

        self.inner.cancellation_token.cancel();
        let discarded = {
            let mut receiver = self.inner.receiver.lock().await;
            receiver.close();
            let mut discarded = 0usize;
            while receiver.try_recv().is_ok() {
                discarded += 1;
            }
            discarded
        };
        tracing::info!(queue = self.name(), discarded, "Queue '{}' stopped", self.name());

        if let Some(pool) = pool {
            pool.join().await.map_err(|err| {
                tracing::error!(?err, queue = self.name(), "Worker failed to shut down: {err}");
                QueueError::GracefulShutdownFailed
            })?;
        }
        Ok(())
    }

    /// A copy of the queue's counters.
    pub fn stats(&self) -> QueueStats {
        self.inner.stats.snapshot()
    }

    /// Number of jobs waiting to be picked up by a worker.
    pub fn size(&self) -> usize {
        self.inner.sender.max_capacity() - self.inner.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.inner.sender.max_capacity()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), State::Running(_))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.inner.config)
            .field("size", &self.size())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full")]
    QueueFull,
    #[error("queue is stopped")]
    Stopped,
    #[error("queue has already been started")]
    AlreadyStarted,
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error encoding job payload")]
    EncodeError(#[from] serde_json::Error),
    #[error("Job payload must encode to a JSON object")]
    PayloadNotObject,
    #[error("Invalid queue configuration: {0}")]
    Config(#[from] ConfigError),
}
