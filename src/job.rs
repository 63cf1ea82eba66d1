//! Running a claimed job and driving its row to the next state.
//!
//! ```text
//! pending --claim--> running --success--> deleted
//!                       |----retry------> pending (run_at pushed out)
//!                       `----failure----> pending, or failed at max_attempts
//! ```
//!
//! "Running" is not stored anywhere; it is a pending row whose lock fields
//! name the worker.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use chrono::NaiveDateTime;

use crate::config::WorkerOptions;
use crate::error::{Error, Result};
use crate::handler::{Handler, HandlerRegistry, JobContext, PerformError};
use crate::store::JobStore;

/// What one call to `perform` amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Retry {
        reason: String,
        delay: Option<Duration>,
    },
    Failure {
        message: String,
    },
}

/// Where a run left the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Row deleted.
    Completed,
    /// Attempt counted, claimable again from `run_at`.
    RetryScheduled { attempts: i32, run_at: NaiveDateTime },
    /// Attempt counted. `permanent` once `max_attempts` is reached.
    Failed { attempts: i32, permanent: bool },
    /// The handler column could not be turned into a handler.
    Rejected,
}

/// Runs `handler` under a failure boundary: errors, retry requests and panics
/// all come back as an [`Outcome`].
pub fn execute(handler: &dyn Handler, ctx: &mut JobContext, fail_on_output: bool) -> Outcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler.perform(ctx)));

    let outcome = match result {
        Ok(Ok(())) => Outcome::Success,
        Ok(Err(PerformError::Retry { reason, delay })) => Outcome::Retry { reason, delay },
        Ok(Err(PerformError::Failed(message))) => Outcome::Failure { message },
        Err(payload) => Outcome::Failure {
            message: format!("handler panicked: {}", panic_message(payload.as_ref())),
        },
    };

    let output = ctx.take_output();
    if output.is_empty() {
        return outcome;
    }

    if !fail_on_output {
        log::info!("Job {} wrote: {}", ctx.id(), output.trim_end());
        return outcome;
    }

    match outcome {
        Outcome::Failure { .. } => outcome,
        _ => Outcome::Failure {
            message: format!("unexpected output: {}", output.trim_end()),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// A job this worker holds the lock on.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    id: String,
    worker: String,
}

impl ClaimedJob {
    /// Claims `id` for `worker`, or returns `None` if the claim was lost.
    pub fn claim(store: &mut JobStore, id: &str, worker: &str) -> Result<Option<ClaimedJob>> {
        if !store.try_claim(id, worker)? {
            return Ok(None);
        }

        Ok(Some(ClaimedJob {
            id: id.to_string(),
            worker: worker.to_string(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn run(
        &self,
        store: &mut JobStore,
        registry: &HandlerRegistry,
        options: &WorkerOptions,
    ) -> Result<Resolution> {
        let job = store
            .find(&self.id)?
            .ok_or_else(|| Error::NotFound(self.id.clone()))?;

        let handler = match registry.decode(&job.handler) {
            Ok(handler) => handler,
            Err(e) => {
                let message = format!("bad handler for job {}: {}", self.id, e);
                log::error!("{}", message);
                store.fail_permanently(&self.id, &message)?;
                store.release_lock(&self.id)?;
                return Ok(Resolution::Rejected);
            }
        };

        let mut ctx = JobContext::new(&self.id, job.attempts + 1);

        match execute(handler.as_ref(), &mut ctx, options.fail_on_output) {
            Outcome::Success => {
                store.delete(&self.id)?;
                log::info!("Completed job {}.", self.id);
                Ok(Resolution::Completed)
            }
            Outcome::Retry { reason, delay } => {
                let attempts = store
                    .attempts(&self.id)?
                    .ok_or_else(|| Error::NotFound(self.id.clone()))?
                    + 1;
                let message = format!(
                    "Caught retry request \"{}\" on attempt {}/{}.",
                    reason, attempts, options.max_attempts
                );

                if attempts >= options.max_attempts {
                    log::warn!("Job {}: {} Giving up.", self.id, message);
                    return self.finish_with_error(store, &message, handler.as_ref(), options);
                }

                let delay = delay.unwrap_or(options.retry_delay);
                log::warn!(
                    "Job {}: {} Trying again in {} seconds.",
                    self.id,
                    message,
                    delay.as_secs()
                );
                let run_at = store.retry_later(&self.id, delay)?;
                store.release_lock(&self.id)?;

                Ok(Resolution::RetryScheduled { attempts, run_at })
            }
            Outcome::Failure { message } => {
                self.finish_with_error(store, &message, handler.as_ref(), options)
            }
        }
    }

    fn finish_with_error(
        &self,
        store: &mut JobStore,
        error: &str,
        handler: &dyn Handler,
        options: &WorkerOptions,
    ) -> Result<Resolution> {
        let record = store
            .record_failure(&self.id, error, options.max_attempts)?
            .ok_or_else(|| Error::NotFound(self.id.clone()))?;
        log::error!("Failure in job {}: {}", self.id, error);

        // Once the row is failed the callback has no second chance, so run it
        // even if the release fails.
        let released = store.release_lock(&self.id);

        if record.failed {
            log::error!(
                "Job {} failed permanently after {} attempts.",
                self.id,
                record.attempts
            );
            let notified =
                panic::catch_unwind(AssertUnwindSafe(|| handler.on_permanent_failure(error)));
            if notified.is_err() {
                log::error!("Failure callback for job {} panicked.", self.id);
            }
        }

        released.inspect_err(|e| log::error!("Failed to release lock for job {}. {}", self.id, e))?;

        Ok(Resolution::Failed {
            attempts: record.attempts,
            permanent: record.failed,
        })
    }
}
