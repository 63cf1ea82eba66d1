use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use log::LevelFilter;

use crate::error::ConfigError;

pub const DEFAULT_TABLE: &str = "jobs";
pub const DEFAULT_QUEUE: &str = "default";

/// Everything a store or worker needs to reach the database.
///
/// Built once per process and handed to whatever needs it; nothing here is
/// global, so two workers in one process can point at different tables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub table_name: String,
    pub log_level: LevelFilter,
    pub connect_retries: u32,
    pub connect_backoff: Duration,
}

impl Config {
    pub fn new(database_url: impl Into<String>) -> Self {
        Config {
            database_url: database_url.into(),
            table_name: DEFAULT_TABLE.to_string(),
            log_level: LevelFilter::Info,
            connect_retries: 3,
            connect_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_table(mut self, table_name: impl Into<String>) -> Result<Self, ConfigError> {
        let table_name = table_name.into();
        validate_table_name(&table_name)?;
        self.table_name = table_name;
        Ok(self)
    }

    /// Reads `DATABASE_URL`, `DELAYQ_TABLE`, `DELAYQ_LOG_LEVEL` and
    /// `DELAYQ_CONNECT_RETRIES`, after loading any `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?;
        let mut config = Config::new(database_url);

        if let Ok(table_name) = env::var("DELAYQ_TABLE") {
            config = config.with_table(table_name)?;
        }

        if let Ok(level) = env::var("DELAYQ_LOG_LEVEL") {
            config.log_level = parse_var("DELAYQ_LOG_LEVEL", &level)?;
        }

        if let Ok(retries) = env::var("DELAYQ_CONNECT_RETRIES") {
            config.connect_retries = parse_var("DELAYQ_CONNECT_RETRIES", &retries)?;
        }

        Ok(config)
    }
}

fn parse_var<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidVar {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

pub fn validate_table_name(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidTableName(name.to_string()))
    }
}

/// How the worker orders candidate rows before shuffling them.
///
/// Newest-first leaves some old jobs behind under load; oldest-first can leave
/// everything behind when the head of the queue keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidateOrder {
    #[default]
    NewestFirst,
    OldestFirst,
    Random,
}

impl CandidateOrder {
    pub(crate) fn order_by(self) -> &'static str {
        match self {
            CandidateOrder::NewestFirst => "created_at DESC",
            CandidateOrder::OldestFirst => "created_at ASC",
            CandidateOrder::Random => "RANDOM()",
        }
    }
}

impl FromStr for CandidateOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" | "newest-first" => Ok(CandidateOrder::NewestFirst),
            "oldest" | "oldest-first" => Ok(CandidateOrder::OldestFirst),
            "random" => Ok(CandidateOrder::Random),
            other => Err(format!(
                "unknown order {other:?}, expected newest, oldest or random"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub queue: String,
    /// Polling iterations to run; 0 runs until shut down.
    pub count: u64,
    /// Pause after a poll that found nothing to claim.
    pub sleep: Duration,
    pub max_attempts: i32,
    /// Delay applied when a handler asks for a retry without naming one.
    pub retry_delay: Duration,
    pub fail_on_output: bool,
    /// Identity written to `locked_by`; defaults to host and pid.
    pub name: Option<String>,
    pub batch_size: i64,
    pub order: CandidateOrder,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            queue: DEFAULT_QUEUE.to_string(),
            count: 0,
            sleep: Duration::from_secs(5),
            max_attempts: 5,
            retry_delay: Duration::from_secs(7200),
            fail_on_output: false,
            name: None,
            batch_size: 10,
            order: CandidateOrder::NewestFirst,
        }
    }
}

impl WorkerOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_fail_on_output(mut self, fail_on_output: bool) -> Self {
        self.fail_on_output = fail_on_output;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_order(mut self, order: CandidateOrder) -> Self {
        self.order = order;
        self
    }

    /// The identity this worker claims rows under.
    pub fn worker_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => default_worker_name(),
        }
    }
}

fn default_worker_name() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());

    format!("host::{} pid::{}", hostname, std::process::id())
}
