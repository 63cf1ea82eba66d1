//! Row ownership.
//!
//! A worker owns a job while `locked_at`/`locked_by` name it. Taking
//! ownership is one conditional `UPDATE`, and that statement's atomicity is
//! the only mutual exclusion between workers: whoever sees a row affected
//! holds the job, everyone else moves on.
//!
//! There is no lease. A worker that dies holding a lock leaves the row locked
//! until someone calls [`JobStore::release_locks_held_by`] for it.

use diesel::prelude::*;
use diesel::sql_types::{Text, Timestamp};

use crate::error::Result;
use crate::store::{now, JobStore};

impl JobStore {
    /// Tries to take `id` for `worker`.
    ///
    /// Succeeds when the row is unlocked or already held by `worker`, and not
    /// failed. `false` means someone else won the race, the job failed in the
    /// meantime, or it is gone; callers treat all three alike.
    pub fn try_claim(&mut self, id: &str, worker: &str) -> Result<bool> {
        log::debug!("Attempting to acquire lock for job {} on {}.", id, worker);

        let affected = diesel::sql_query(format!(
            "UPDATE {} SET locked_at = ?, locked_by = ?
             WHERE id = ? AND (locked_at IS NULL OR locked_by = ?) AND failed_at IS NULL",
            self.table
        ))
        .bind::<Timestamp, _>(now())
        .bind::<Text, _>(worker)
        .bind::<Text, _>(id)
        .bind::<Text, _>(worker)
        .execute(&mut self.connection)?;

        if affected == 0 {
            log::debug!("Failed to acquire lock for job {}.", id);
            return Ok(false);
        }

        Ok(true)
    }

    pub fn release_lock(&mut self, id: &str) -> Result<()> {
        diesel::sql_query(format!(
            "UPDATE {} SET locked_at = NULL, locked_by = NULL WHERE id = ?",
            self.table
        ))
        .bind::<Text, _>(id)
        .execute(&mut self.connection)?;

        Ok(())
    }

    /// Clears every lock held by `worker`. Returns how many rows were released.
    pub fn release_locks_held_by(&mut self, worker: &str) -> Result<usize> {
        let released = diesel::sql_query(format!(
            "UPDATE {} SET locked_at = NULL, locked_by = NULL WHERE locked_by = ?",
            self.table
        ))
        .bind::<Text, _>(worker)
        .execute(&mut self.connection)?;

        if released > 0 {
            log::info!("Released {} locks held by {}.", released, worker);
        }

        Ok(released)
    }
}
