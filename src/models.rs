// src/models.rs

use crate::schema::jobs;
use chrono::NaiveDateTime;
use diesel::sql_types::{BigInt, Bool, Integer};
use serde::{Deserialize, Serialize};

/// A full job row, as kept for operator inspection.
#[derive(QueryableByName, Debug, Clone)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: String,
    pub handler: String,
    pub queue: String,
    pub attempts: i32,
    pub run_at: Option<NaiveDateTime>,
    pub locked_at: Option<NaiveDateTime>,
    pub locked_by: Option<String>,
    pub failed_at: Option<NaiveDateTime>,
    pub error: Option<String>,
    pub created_at: NaiveDateTime,
}

impl Job {
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }
}

#[derive(QueryableByName, Debug)]
#[diesel(table_name = jobs)]
pub(crate) struct JobIdRow {
    pub id: String,
}

#[derive(QueryableByName, Debug)]
#[diesel(table_name = jobs)]
pub(crate) struct HandlerRow {
    pub handler: String,
}

#[derive(QueryableByName, Debug)]
#[diesel(table_name = jobs)]
pub(crate) struct AttemptsRow {
    pub attempts: i32,
}

/// What a failure update left behind.
#[derive(QueryableByName, Debug)]
pub(crate) struct FailureRow {
    #[diesel(sql_type = Integer)]
    pub attempts: i32,
    #[diesel(sql_type = Bool)]
    pub failed: bool,
}

#[derive(QueryableByName, Debug)]
pub(crate) struct StatusRow {
    #[diesel(sql_type = BigInt)]
    pub total: i64,
    #[diesel(sql_type = BigInt)]
    pub failed: i64,
    #[diesel(sql_type = BigInt)]
    pub locked: i64,
}

/// Aggregate counts for one queue.
///
/// `locked` only counts rows that are not failed, so
/// `outstanding + locked + failed == total` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub outstanding: i64,
    pub locked: i64,
    pub failed: i64,
    pub total: i64,
}

impl From<StatusRow> for Status {
    fn from(row: StatusRow) -> Self {
        Status {
            outstanding: row.total - row.locked - row.failed,
            locked: row.locked,
            failed: row.failed,
            total: row.total,
        }
    }
}

/// Result of a bulk insert: how many rows were asked for and how many landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkEnqueued {
    pub ids: Vec<String>,
    pub requested: usize,
    pub inserted: usize,
}

impl BulkEnqueued {
    pub fn is_partial(&self) -> bool {
        self.inserted != self.requested
    }
}
