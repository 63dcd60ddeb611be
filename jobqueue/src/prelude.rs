//! The purpose of this module is to alleviate the need to import many of the `[jobqueue]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobqueue::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::config::QueueConfig;
pub use crate::handler::{HandlerError, JobHandler};
pub use crate::job::{Job, JobId, JobStatus, Payload};
pub use crate::Queue;
pub use crate::QueueError;
pub use crate::QueueStats;
