use std::thread;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::config::{validate_table_name, Config};
use crate::error::{Error, Result};

/// How long SQLite waits on a competing writer before giving up.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Opens a connection, retrying a bounded number of times with a linear backoff.
pub fn establish_connection(config: &Config) -> Result<SqliteConnection> {
    let attempts = config.connect_retries + 1;
    let mut attempt = 1;

    loop {
        match SqliteConnection::establish(&config.database_url) {
            Ok(mut connection) => {
                connection.batch_execute(&format!(
                    "PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}; PRAGMA journal_mode = WAL;"
                ))?;
                return Ok(connection);
            }
            Err(e) if attempt < attempts => {
                log::warn!(
                    "Failed to connect to {} (attempt {}/{}). {}",
                    config.database_url,
                    attempt,
                    attempts,
                    e
                );
                thread::sleep(config.connect_backoff * attempt);
                attempt += 1;
            }
            Err(source) => {
                return Err(Error::Connection {
                    url: config.database_url.clone(),
                    attempts,
                    source,
                })
            }
        }
    }
}

pub(crate) fn quote_table(table: &str) -> String {
    format!("\"{}\"", table)
}

/// Creates the job table and its polling index if they do not exist yet.
pub fn create_table(connection: &mut SqliteConnection, table: &str) -> Result<()> {
    validate_table_name(table)?;
    let quoted = quote_table(table);

    connection.batch_execute(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {quoted} (
            id TEXT PRIMARY KEY NOT NULL,
            handler TEXT NOT NULL,
            queue TEXT NOT NULL DEFAULT 'default',
            attempts INTEGER NOT NULL DEFAULT 0,
            run_at TIMESTAMP NULL,
            locked_at TIMESTAMP NULL,
            locked_by TEXT NULL,
            failed_at TIMESTAMP NULL,
            error TEXT NULL,
            created_at TIMESTAMP NOT NULL
        );
        CREATE INDEX IF NOT EXISTS "{table}_poll_idx" ON {quoted} (queue, failed_at, run_at);
        "#
    ))?;

    log::debug!("Ensured job table {} exists.", table);
    Ok(())
}
