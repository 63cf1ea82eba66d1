//! A database-backed delayed job queue.
//!
//! Producers insert serialized handlers into a shared table. Workers poll
//! that table, claim one row at a time with a conditional `UPDATE`, run the
//! handler and then delete the row, schedule a retry, or mark it failed.
//! Delivery is at-least-once.

#[macro_use]
extern crate diesel;

pub mod api;
pub mod builtin;
mod claim;
pub mod config;
pub mod database;
pub mod error;
pub mod handler;
pub mod job;
pub mod logger;
pub mod models;
mod queue;
pub mod schema;
pub mod store;
pub mod worker;

pub use config::{CandidateOrder, Config, WorkerOptions};
pub use error::{ConfigError, Error, Result};
pub use handler::{Handler, HandlerRegistry, JobContext, NamedHandler, PerformError};
pub use job::{ClaimedJob, Outcome, Resolution};
pub use models::{BulkEnqueued, Job, Status};
pub use store::JobStore;
pub use worker::{Worker, WorkerReport};
