//! Handlers perform the work of a job and are looked up by job type.
use std::{
    fmt::Debug,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use fxhash::FxHashMap;

use crate::job::Job;

/// The error returned by a failing handler.
///
/// Any error type can be returned from a handler using `?`, only its message is kept on the job.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Performs the work for a single job type.
///
/// A handler may be invoked again for the same job after a failure, with the same payload and an
/// incremented [`Job::attempts`], so it should tolerate being rerun.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Adapts a synchronous closure into a [`JobHandler`].
///
/// Created by [`crate::Queue::register_fn`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&Job) -> Result<(), HandlerError> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self(handler)
    }
}

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        (self.0)(job)
    }
}

/// Registry of handlers (job type -> handler).
///
/// Handlers can be registered while workers are already reading from the registry, registering
/// a second handler for a type replaces the first.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<FxHashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `job_type`, returning the handler it replaced, if any.
    pub fn register(
        &self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type.into(), handler)
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job_type)
    }

    /// The registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut job_types = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        job_types.sort();
        job_types
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
