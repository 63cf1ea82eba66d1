use chrono::NaiveDateTime;

use crate::error::{Error, Result};
use crate::handler::{encode, NamedHandler};
use crate::models::BulkEnqueued;
use crate::store::JobStore;

impl JobStore {
    /// Queues one handler and returns the new job's id.
    pub fn enqueue<H: NamedHandler>(
        &mut self,
        handler: &H,
        queue: &str,
        run_at: Option<NaiveDateTime>,
    ) -> Result<String> {
        let raw = encode(handler).inspect_err(|e| {
            log::error!("Failed to serialize {} handler. {}", H::KIND, e);
        })?;

        self.enqueue_raw(raw, queue, run_at)
    }

    /// Queues an already-serialized handler.
    pub fn enqueue_raw(
        &mut self,
        handler: String,
        queue: &str,
        run_at: Option<NaiveDateTime>,
    ) -> Result<String> {
        let (ids, affected) = self
            .insert(std::slice::from_ref(&handler), queue, run_at)
            .inspect_err(|e| log::error!("Failed to enqueue new job. {}", e))?;

        match ids.into_iter().next() {
            Some(id) if affected > 0 => {
                log::debug!("Enqueued job {} on queue {}.", id, queue);
                Ok(id)
            }
            _ => {
                log::error!("Failed to enqueue new job.");
                Err(Error::NotEnqueued)
            }
        }
    }

    pub fn bulk_enqueue<H: NamedHandler>(
        &mut self,
        handlers: &[H],
        queue: &str,
        run_at: Option<NaiveDateTime>,
    ) -> Result<BulkEnqueued> {
        let raw = handlers
            .iter()
            .map(encode)
            .collect::<Result<Vec<_>, _>>()
            .inspect_err(|e| log::error!("Failed to serialize {} handlers. {}", H::KIND, e))?;

        self.bulk_enqueue_raw(&raw, queue, run_at)
    }

    /// A batch that writes only some of its rows is logged but still `Ok`;
    /// check [`BulkEnqueued::is_partial`].
    pub fn bulk_enqueue_raw(
        &mut self,
        handlers: &[String],
        queue: &str,
        run_at: Option<NaiveDateTime>,
    ) -> Result<BulkEnqueued> {
        let (ids, inserted) = self
            .insert(handlers, queue, run_at)
            .inspect_err(|e| log::error!("Failed to enqueue new jobs. {}", e))?;

        if inserted < 1 {
            log::error!("Failed to enqueue new jobs.");
            return Err(Error::NotEnqueued);
        }

        let result = BulkEnqueued {
            ids,
            requested: handlers.len(),
            inserted,
        };

        if result.is_partial() {
            log::error!(
                "Failed to enqueue some new jobs ({} of {} written).",
                result.inserted,
                result.requested
            );
        } else {
            log::debug!("Enqueued {} jobs on queue {}.", inserted, queue);
        }

        Ok(result)
    }
}
