#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use delayq::{
    Config, Handler, HandlerRegistry, JobContext, JobStore, NamedHandler, PerformError, Worker,
    WorkerOptions, WorkerReport,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::watch;

/// A file-backed database that disappears with the value.
pub struct TestDb {
    _dir: TempDir,
    pub config: Config,
}

impl TestDb {
    pub fn new() -> Self {
        TestDb::with_table("jobs")
    }

    pub fn with_table(table: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("delayq.db");
        let config = Config::new(path.to_string_lossy().into_owned())
            .with_table(table)
            .unwrap();

        JobStore::connect(&config).unwrap().create_table().unwrap();

        TestDb { _dir: dir, config }
    }

    pub fn store(&self) -> JobStore {
        JobStore::connect(&self.config).unwrap()
    }

    pub fn worker(&self, options: WorkerOptions) -> Worker {
        Worker::new(self.store(), registry(), options.with_sleep(Duration::ZERO))
    }
}

pub async fn run(worker: &mut Worker) -> WorkerReport {
    let (_tx, rx) = watch::channel(false);
    worker.run(rx).await
}

pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::with_builtins();
    registry
        .register::<Hello>()
        .register::<Failing>()
        .register::<Panicking>()
        .register::<RetryOnce>()
        .register::<RetryLater>()
        .register::<Notifying>()
        .register::<Tally>();
    registry
}

#[derive(Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
}

impl Handler for Hello {
    fn perform(&self, ctx: &mut JobContext) -> Result<(), PerformError> {
        writeln!(ctx, "Hello {}!", self.name)?;
        Ok(())
    }
}

impl NamedHandler for Hello {
    const KIND: &'static str = "hello";
}

#[derive(Serialize, Deserialize)]
pub struct Failing;

impl Handler for Failing {
    fn perform(&self, _ctx: &mut JobContext) -> Result<(), PerformError> {
        Err(PerformError::failed("Uh oh"))
    }
}

impl NamedHandler for Failing {
    const KIND: &'static str = "failing";
}

#[derive(Serialize, Deserialize)]
pub struct Panicking;

impl Handler for Panicking {
    fn perform(&self, _ctx: &mut JobContext) -> Result<(), PerformError> {
        panic!("Should email this");
    }
}

impl NamedHandler for Panicking {
    const KIND: &'static str = "panicking";
}

/// Asks for an immediate retry on its first run, then succeeds.
#[derive(Serialize, Deserialize)]
pub struct RetryOnce;

impl Handler for RetryOnce {
    fn perform(&self, ctx: &mut JobContext) -> Result<(), PerformError> {
        if ctx.attempt() == 1 {
            return Err(PerformError::retry_in("not yet", Duration::ZERO));
        }
        Ok(())
    }
}

impl NamedHandler for RetryOnce {
    const KIND: &'static str = "retry_once";
}

/// Always asks for a retry, optionally with a delay.
#[derive(Serialize, Deserialize)]
pub struct RetryLater {
    pub seconds: Option<u64>,
}

impl Handler for RetryLater {
    fn perform(&self, _ctx: &mut JobContext) -> Result<(), PerformError> {
        Err(match self.seconds {
            Some(seconds) => PerformError::retry_in("busy", Duration::from_secs(seconds)),
            None => PerformError::retry("busy"),
        })
    }
}

impl NamedHandler for RetryLater {
    const KIND: &'static str = "retry_later";
}

pub static NOTIFIED: AtomicUsize = AtomicUsize::new(0);

/// Fails every time and counts permanent-failure callbacks.
#[derive(Serialize, Deserialize)]
pub struct Notifying;

impl Handler for Notifying {
    fn perform(&self, _ctx: &mut JobContext) -> Result<(), PerformError> {
        Err(PerformError::failed("Should email this"))
    }

    fn on_permanent_failure(&self, _error: &str) {
        NOTIFIED.fetch_add(1, Ordering::SeqCst);
    }
}

impl NamedHandler for Notifying {
    const KIND: &'static str = "notifying";
}

pub static TALLY: Mutex<Option<HashMap<String, usize>>> = Mutex::new(None);

/// Records how many times each tag ran.
#[derive(Serialize, Deserialize)]
pub struct Tally {
    pub tag: String,
}

impl Handler for Tally {
    fn perform(&self, _ctx: &mut JobContext) -> Result<(), PerformError> {
        let mut tally = TALLY.lock().unwrap();
        *tally
            .get_or_insert_with(HashMap::new)
            .entry(self.tag.clone())
            .or_default() += 1;
        Ok(())
    }
}

impl NamedHandler for Tally {
    const KIND: &'static str = "tally";
}

pub fn tally_of(tag: &str) -> usize {
    TALLY
        .lock()
        .unwrap()
        .as_ref()
        .and_then(|tally| tally.get(tag).copied())
        .unwrap_or(0)
}
