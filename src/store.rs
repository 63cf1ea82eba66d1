use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Nullable, Text, Timestamp};
use diesel::sqlite::{Sqlite, SqliteConnection};
use uuid::Uuid;

use crate::config::{validate_table_name, CandidateOrder, Config};
use crate::database::{create_table, establish_connection, quote_table};
use crate::error::{Error, Result};
use crate::models::{
    AttemptsRow, FailureRow, HandlerRow, Job, JobIdRow, Status, StatusRow,
};

pub(crate) fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Rows per `INSERT`. Each row binds five parameters and SQLite accepts at
/// most 32766 per statement.
pub const INSERT_CHUNK_ROWS: usize = 32766 / 5;

/// Longest delay honoured; anything beyond it is clamped. Keeps `run_at`
/// within four-digit years so stored timestamps compare as text.
const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + delay`, with the delay clamped to `MAX_DELAY`.
pub fn deadline(now: NaiveDateTime, delay: Duration) -> NaiveDateTime {
    TimeDelta::from_std(delay.min(MAX_DELAY))
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
}

/// The job table: one connection and one (configurable) table name.
///
/// Every method is a single statement, except that very large inserts are
/// split into several inside one transaction.
pub struct JobStore {
    pub(crate) connection: SqliteConnection,
    pub(crate) table_name: String,
    pub(crate) table: String,
}

/// What `record_failure` left on the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub attempts: i32,
    /// True when this update is the one that marked the job failed.
    pub failed: bool,
}

impl JobStore {
    pub fn new(connection: SqliteConnection, table_name: &str) -> Result<Self> {
        validate_table_name(table_name)?;

        Ok(JobStore {
            connection,
            table_name: table_name.to_string(),
            table: quote_table(table_name),
        })
    }

    pub fn connect(config: &Config) -> Result<Self> {
        let connection = establish_connection(config)?;
        JobStore::new(connection, &config.table_name)
    }

    /// A private in-memory store with the table already created.
    pub fn open_in_memory() -> Result<Self> {
        let mut store = JobStore::connect(&Config::new(":memory:"))?;
        store.create_table()?;
        Ok(store)
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn create_table(&mut self) -> Result<()> {
        create_table(&mut self.connection, &self.table_name)
    }

    /// Inserts every handler and returns the generated ids alongside the number
    /// of rows the database reports as written.
    ///
    /// Each chunk of [`INSERT_CHUNK_ROWS`] rows is one multi-row statement;
    /// the chunks share a transaction, so a batch lands whole or not at all.
    pub fn insert(
        &mut self,
        handlers: &[String],
        queue: &str,
        run_at: Option<NaiveDateTime>,
    ) -> Result<(Vec<String>, usize)> {
        if handlers.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let created_at = now();
        let ids: Vec<String> = handlers
            .iter()
            .map(|_| Uuid::new_v4().to_string())
            .collect();
        let table = &self.table;

        let affected = self.connection.transaction::<_, Error, _>(|conn| {
            let mut affected = 0;

            for (ids, handlers) in ids
                .chunks(INSERT_CHUNK_ROWS)
                .zip(handlers.chunks(INSERT_CHUNK_ROWS))
            {
                let placeholders = vec!["(?, ?, ?, ?, 0, ?)"; handlers.len()].join(", ");
                let sql = format!(
                    "INSERT INTO {} (id, handler, queue, run_at, attempts, created_at) VALUES {}",
                    table, placeholders
                );

                let mut query = diesel::sql_query(sql).into_boxed::<Sqlite>();
                for (id, handler) in ids.iter().zip(handlers) {
                    query = query
                        .bind::<Text, _>(id.clone())
                        .bind::<Text, _>(handler.clone())
                        .bind::<Text, _>(queue.to_string())
                        .bind::<Nullable<Timestamp>, _>(run_at)
                        .bind::<Timestamp, _>(created_at);
                }

                affected += query.execute(conn)?;
            }

            Ok(affected)
        })?;

        Ok((ids, affected))
    }

    pub fn find(&mut self, id: &str) -> Result<Option<Job>> {
        let job = diesel::sql_query(format!("SELECT * FROM {} WHERE id = ?", self.table))
            .bind::<Text, _>(id)
            .get_result::<Job>(&mut self.connection)
            .optional()?;

        Ok(job)
    }

    pub fn handler(&mut self, id: &str) -> Result<Option<String>> {
        let row = diesel::sql_query(format!("SELECT handler FROM {} WHERE id = ?", self.table))
            .bind::<Text, _>(id)
            .get_result::<HandlerRow>(&mut self.connection)
            .optional()?;

        Ok(row.map(|row| row.handler))
    }

    pub fn attempts(&mut self, id: &str) -> Result<Option<i32>> {
        let row = diesel::sql_query(format!("SELECT attempts FROM {} WHERE id = ?", self.table))
            .bind::<Text, _>(id)
            .get_result::<AttemptsRow>(&mut self.connection)
            .optional()?;

        Ok(row.map(|row| row.attempts))
    }

    pub fn status(&mut self, queue: &str) -> Result<Status> {
        let row = diesel::sql_query(format!(
            "SELECT COUNT(*) AS total,
                    COUNT(failed_at) AS failed,
                    COUNT(CASE WHEN locked_at IS NOT NULL AND failed_at IS NULL THEN 1 END) AS locked
             FROM {}
             WHERE queue = ?",
            self.table
        ))
        .bind::<Text, _>(queue)
        .get_result::<StatusRow>(&mut self.connection)?;

        Ok(row.into())
    }

    /// Ids of rows `worker` could claim right now: due, not failed, under the
    /// attempt limit, and either unlocked or already locked by `worker`.
    pub fn find_candidates(
        &mut self,
        queue: &str,
        worker: &str,
        max_attempts: i32,
        limit: i64,
        order: CandidateOrder,
    ) -> Result<Vec<String>> {
        let rows = diesel::sql_query(format!(
            "SELECT id FROM {}
             WHERE queue = ?
               AND (run_at IS NULL OR run_at <= ?)
               AND (locked_at IS NULL OR locked_by = ?)
               AND failed_at IS NULL
               AND attempts < ?
             ORDER BY {}
             LIMIT ?",
            self.table,
            order.order_by()
        ))
        .bind::<Text, _>(queue)
        .bind::<Timestamp, _>(now())
        .bind::<Text, _>(worker)
        .bind::<Integer, _>(max_attempts)
        .bind::<BigInt, _>(limit)
        .load::<JobIdRow>(&mut self.connection)?;

        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    pub fn delete(&mut self, id: &str) -> Result<usize> {
        let affected = diesel::sql_query(format!("DELETE FROM {} WHERE id = ?", self.table))
            .bind::<Text, _>(id)
            .execute(&mut self.connection)?;

        Ok(affected)
    }

    /// Counts an attempt and pushes `run_at` out by `delay`. Returns the new `run_at`.
    pub fn retry_later(&mut self, id: &str, delay: Duration) -> Result<NaiveDateTime> {
        let run_at = deadline(now(), delay);

        diesel::sql_query(format!(
            "UPDATE {} SET run_at = ?, attempts = attempts + 1 WHERE id = ?",
            self.table
        ))
        .bind::<Timestamp, _>(run_at)
        .bind::<Text, _>(id)
        .execute(&mut self.connection)?;

        Ok(run_at)
    }

    /// Counts a failed attempt and, in the same statement, marks the job failed
    /// once the new attempt count reaches `max_attempts`.
    ///
    /// Returns `None` when the row no longer exists.
    pub fn record_failure(
        &mut self,
        id: &str,
        error: &str,
        max_attempts: i32,
    ) -> Result<Option<FailureRecord>> {
        let row = diesel::sql_query(format!(
            "UPDATE {} SET
                attempts = attempts + 1,
                failed_at = CASE WHEN attempts + 1 >= ? THEN ? ELSE NULL END,
                error = CASE WHEN attempts + 1 >= ? THEN ? ELSE NULL END
             WHERE id = ? AND failed_at IS NULL
             RETURNING attempts, failed_at IS NOT NULL AS failed",
            self.table
        ))
        .bind::<Integer, _>(max_attempts)
        .bind::<Timestamp, _>(now())
        .bind::<Integer, _>(max_attempts)
        .bind::<Text, _>(error)
        .bind::<Text, _>(id)
        .get_result::<FailureRow>(&mut self.connection)
        .optional()?;

        Ok(row.map(|row| FailureRecord {
            attempts: row.attempts,
            failed: row.failed,
        }))
    }

    /// Marks a job failed regardless of how many attempts it has left.
    pub fn fail_permanently(&mut self, id: &str, error: &str) -> Result<usize> {
        let affected = diesel::sql_query(format!(
            "UPDATE {} SET attempts = attempts + 1, failed_at = ?, error = ?
             WHERE id = ? AND failed_at IS NULL",
            self.table
        ))
        .bind::<Timestamp, _>(now())
        .bind::<Text, _>(error)
        .bind::<Text, _>(id)
        .execute(&mut self.connection)?;

        Ok(affected)
    }
}
