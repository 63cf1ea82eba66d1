use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use clap::{Args, Parser, Subcommand};
use delayq::api::{router, AppState};
use delayq::handler::encode_raw;
use delayq::logger::init_logger;
use delayq::store::deadline;
use delayq::{CandidateOrder, Config, Error, HandlerRegistry, JobStore, Worker, WorkerOptions};
use tokio::sync::watch;

/// Database-backed delayed job queue.
#[derive(Parser)]
#[command(name = "delayq", version)]
#[command(about = "Enqueue jobs into a shared table and run workers against it")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP enqueue and status API.
    Serve {
        #[arg(long, env = "DELAYQ_BIND_ADDR", default_value = "127.0.0.1:7878")]
        addr: SocketAddr,
    },

    /// Run a worker against one queue.
    Work(WorkArgs),

    /// Print outstanding, locked, failed and total counts for a queue.
    Status {
        #[arg(long, default_value = "default")]
        queue: String,
    },

    /// Create the job table if it does not exist.
    Migrate,

    /// Release every lock held by a worker identity, e.g. after it crashed.
    ReleaseLocks {
        #[arg(long)]
        worker: String,
    },

    /// Queue a single handler.
    Enqueue {
        /// Handler kind, e.g. `echo` or `command`.
        kind: String,

        /// Handler payload as JSON.
        #[arg(long, default_value = "{}")]
        payload: String,

        #[arg(long, default_value = "default")]
        queue: String,

        /// Seconds to wait before the job becomes runnable.
        #[arg(long)]
        delay: Option<u64>,
    },
}

#[derive(Args)]
struct WorkArgs {
    #[arg(long, env = "DELAYQ_QUEUE", default_value = "default")]
    queue: String,

    /// Polling iterations to run; 0 runs until interrupted.
    #[arg(long, default_value_t = 0)]
    count: u64,

    /// Seconds to sleep after a poll that found nothing.
    #[arg(long, default_value_t = 5)]
    sleep: u64,

    #[arg(long, default_value_t = 5)]
    max_attempts: i32,

    /// Seconds to wait before retrying when a handler does not say.
    #[arg(long, default_value_t = 7200)]
    retry_delay: u64,

    /// Fail jobs that write any output.
    #[arg(long)]
    fail_on_output: bool,

    /// Identity to lock rows under (default: host and pid).
    #[arg(long, env = "DELAYQ_WORKER_NAME")]
    name: Option<String>,

    /// Candidate ordering: newest, oldest or random.
    #[arg(long, default_value = "newest")]
    order: CandidateOrder,
}

impl WorkArgs {
    fn into_options(self) -> WorkerOptions {
        let options = WorkerOptions::default()
            .with_queue(self.queue)
            .with_count(self.count)
            .with_sleep(Duration::from_secs(self.sleep))
            .with_max_attempts(self.max_attempts)
            .with_retry_delay(Duration::from_secs(self.retry_delay))
            .with_fail_on_output(self.fail_on_output)
            .with_order(self.order);

        match self.name {
            Some(name) => options.with_name(name),
            None => options,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logger(config.log_level) {
        eprintln!("Failed to install logger. {}", e);
    }

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: Config) -> delayq::Result<()> {
    match command {
        Commands::Serve { addr } => {
            let app = router(AppState::new(config));
            let listener = tokio::net::TcpListener::bind(addr).await?;

            log::info!("🚀 Server running on {}", addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let signal = shutdown_signal().await;
                    log::info!("Received {}... Shutting down.", signal);
                })
                .await?;
        }
        Commands::Work(args) => {
            let store = JobStore::connect(&config)?;
            let mut worker = Worker::new(store, HandlerRegistry::with_builtins(), args.into_options());

            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                let signal = shutdown_signal().await;
                log::info!("Received {}... Shutting down.", signal);
                let _ = tx.send(true);

                // The running job cannot be interrupted; a second signal abandons it.
                let signal = shutdown_signal().await;
                log::warn!("Received {} again, exiting without finishing the current job.", signal);
                std::process::exit(1);
            });

            let report = worker.run(rx).await;
            if report.aborted {
                return Err(Error::WorkerAborted(worker.name().to_string()));
            }
        }
        Commands::Status { queue } => {
            let mut store = JobStore::connect(&config)?;
            let status = store.status(&queue)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Migrate => {
            let mut store = JobStore::connect(&config)?;
            store.create_table()?;
            log::info!("Job table {} is ready.", store.table_name());
        }
        Commands::ReleaseLocks { worker } => {
            let mut store = JobStore::connect(&config)?;
            let released = store.release_locks_held_by(&worker)?;
            println!("{}", released);
        }
        Commands::Enqueue {
            kind,
            payload,
            queue,
            delay,
        } => {
            HandlerRegistry::with_builtins().ensure_known(&kind)?;
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            let handler = encode_raw(&kind, payload)?;
            let run_at = delay.map(run_at_after);

            let mut store = JobStore::connect(&config)?;
            let id = store.enqueue_raw(handler, &queue, run_at)?;
            println!("{}", id);
        }
    }

    Ok(())
}

fn run_at_after(seconds: u64) -> NaiveDateTime {
    deadline(Utc::now().naive_utc(), Duration::from_secs(seconds))
}

async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "SIGINT"
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM. {}", e);
                std::future::pending::<()>().await;
            }
        }
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        signal = interrupt => signal,
        signal = terminate => signal,
    }
}
