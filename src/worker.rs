use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::watch;

use crate::config::WorkerOptions;
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::job::ClaimedJob;
use crate::store::JobStore;

/// Summary of a finished `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerReport {
    pub iterations: u64,
    pub jobs_run: u64,
    /// The loop ended because the store could not be polled.
    pub aborted: bool,
}

/// Polls one queue, claims one job at a time and runs it.
///
/// Workers share nothing but the table. Any number of them, in any number of
/// processes, can serve the same queue.
pub struct Worker {
    name: String,
    store: JobStore,
    registry: HandlerRegistry,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(store: JobStore, registry: HandlerRegistry, options: WorkerOptions) -> Self {
        Worker {
            name: options.worker_name(),
            store,
            registry,
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&mut self) -> &mut JobStore {
        &mut self.store
    }

    /// Picks a due job and claims it.
    ///
    /// Candidates are shuffled before claiming so that workers polling the
    /// same queue do not all fight over the same row.
    pub fn claim_next(&mut self) -> Result<Option<ClaimedJob>> {
        let mut candidates = self.store.find_candidates(
            &self.options.queue,
            &self.name,
            self.options.max_attempts,
            self.options.batch_size,
            self.options.order,
        )?;

        candidates.shuffle(&mut rand::thread_rng());

        for id in candidates {
            if let Some(job) = ClaimedJob::claim(&mut self.store, &id, &self.name)? {
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    /// Runs until `count` polling iterations are spent (forever when 0) or
    /// `shutdown` turns true.
    ///
    /// A failing job never stops the loop. An error while finding or claiming
    /// work does, after being logged.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> WorkerReport {
        log::info!(
            "Starting worker {} on queue {}.",
            self.name,
            self.options.queue
        );

        let mut report = WorkerReport::default();
        let mut stopped = false;

        while self.options.count == 0 || report.iterations < self.options.count {
            let stopping = *shutdown.borrow();
            if stopping {
                stopped = true;
                break;
            }

            report.iterations += 1;

            let job = match self.claim_next() {
                Ok(job) => job,
                Err(e) => {
                    log::error!("Unhandled error in worker {}: {}", self.name, e);
                    report.aborted = true;
                    break;
                }
            };

            let Some(job) = job else {
                log::debug!(
                    "Failed to get a job, queue {} may be empty.",
                    self.options.queue
                );
                pause(self.options.sleep, &mut shutdown).await;
                continue;
            };

            report.jobs_run += 1;
            if let Err(e) = job.run(&mut self.store, &self.registry, &self.options) {
                log::error!("Error while running job {}: {}", job.id(), e);
            }
        }

        if stopped {
            log::info!("Worker {} received shutdown, releasing locks.", self.name);
            if let Err(e) = self.store.release_locks_held_by(&self.name) {
                log::error!("Failed to release locks held by {}: {}", self.name, e);
            }
        }

        log::info!(
            "Worker {} shutting down after running {} jobs, over {} polling iterations.",
            self.name,
            report.jobs_run,
            report.iterations
        );

        report
    }
}

/// Sleeps for `duration`, returning early if `shutdown` turns true.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = async {
            // A dropped sender can never signal; sleep out the interval instead.
            if shutdown.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
