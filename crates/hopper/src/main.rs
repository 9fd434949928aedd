//! Hopper: background job queues
//!
//! Subcommands:
//! - `work`: run a worker loop over one or more queues
//! - `status`, `schedules`: inspect stored jobs and schedules
//! - `example`, `retry`, `clear`, `schedule`, `unschedule`, `flush`: manage them

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hopper_worker::WorkerOptions;

mod app;
mod commands;
mod jobs;

#[derive(Parser)]
#[command(name = "hopper")]
#[command(about = "Background job queues with a cron scheduler", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(long, global = true, env = "HOPPER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding queue state (defaults to the platform data dir)
    #[arg(long, global = true, env = "HOPPER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue example jobs across the high, default and low queues
    Example {
        /// Number of example jobs
        #[arg(long, default_value = "5")]
        count: usize,
    },

    /// Show job counts per status and queue
    Status,

    /// Retry a failed job, or every failed job with `all`
    Retry {
        /// Job id or `all`
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Delete completed and failed jobs older than the retention windows
    Clear {
        /// Hours to keep completed jobs (defaults to config)
        #[arg(long)]
        completed: Option<u64>,

        /// Hours to keep failed jobs (defaults to config)
        #[arg(long)]
        failed: Option<u64>,
    },

    /// List recurring schedules
    Schedules,

    /// Register a recurring job
    Schedule {
        /// Five-field cron expression, e.g. "*/5 * * * *"
        expression: String,

        /// Registered job type
        job_type: String,

        /// JSON payload
        #[arg(long)]
        payload: Option<String>,

        /// Queue to push onto
        #[arg(long)]
        queue: Option<String>,

        /// IANA timezone the expression is evaluated in
        #[arg(long)]
        timezone: Option<String>,

        /// Enqueue even while the previous run is still outstanding
        #[arg(long)]
        allow_overlap: bool,
    },

    /// Remove a recurring schedule
    Unschedule {
        /// Schedule id
        id: String,
    },

    /// Delete every job and schedule
    Flush {
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Run a worker
    Work {
        /// Comma-separated queues in priority order (defaults to all)
        #[arg(long, env = "HOPPER_QUEUE")]
        queue: Option<String>,

        /// Process a single job and exit
        #[arg(long)]
        once: bool,

        /// Default job timeout in seconds (0 disables)
        #[arg(long)]
        timeout: Option<u64>,

        /// Memory limit in megabytes (0 disables)
        #[arg(long)]
        memory: Option<u64>,

        /// Seconds to sleep when there is no work
        #[arg(long)]
        sleep: Option<u64>,

        /// Default maximum attempts
        #[arg(long)]
        tries: Option<u32>,

        /// Jobs to process before exiting for a restart
        #[arg(long)]
        max_jobs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hopper=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = app::load_config(cli.config.as_deref())?;
    let app = app::App::open(config, cli.data_dir).await?;

    match cli.command {
        Commands::Example { count } => commands::example(&app, count).await,
        Commands::Status => commands::status(&app).await,
        Commands::Retry { id } => commands::retry(&app, &id).await,
        Commands::Clear { completed, failed } => commands::clear(&app, completed, failed).await,
        Commands::Schedules => commands::schedules(&app).await,
        Commands::Schedule {
            expression,
            job_type,
            payload,
            queue,
            timezone,
            allow_overlap,
        } => {
            commands::schedule(
                &app,
                commands::ScheduleArgs {
                    expression,
                    job_type,
                    payload,
                    queue,
                    timezone,
                    allow_overlap,
                },
            )
            .await
        }
        Commands::Unschedule { id } => commands::unschedule(&app, &id).await,
        Commands::Flush { force } => commands::flush(&app, force).await,
        Commands::Work {
            queue,
            once,
            timeout,
            memory,
            sleep,
            tries,
            max_jobs,
        } => {
            let mut options = WorkerOptions::from(&app.manager.config().worker);
            if let Some(timeout) = timeout {
                options = options.timeout(timeout);
            }
            if let Some(memory) = memory {
                options = options.memory_limit(memory);
            }
            if let Some(sleep) = sleep {
                options = options.sleep(sleep);
            }
            if let Some(tries) = tries {
                options = options.tries(tries);
            }
            if let Some(max_jobs) = max_jobs {
                options = options.max_jobs(max_jobs);
            }
            let queues = commands::parse_queues(queue.as_deref());
            commands::work(app, queues, once, options).await
        }
    }
}
