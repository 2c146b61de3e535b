//! `smarties` — home-automation hub daemon and job administration.
//!
//! ```bash
//! # run the sweep loop until Ctrl-C, logging payloads of jobs keyed "lights"
//! smarties run --echo lights
//!
//! # schedule, inspect and cancel jobs against the same database
//! smarties schedule lights 5min '{"room":"hall","on":false}'
//! smarties jobs --key lights
//! smarties cancel lights
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use smarties_core::HubConfig;
use smarties_db::DbManager;
use smarties_scheduler::{CallbackRegistry, Scheduler, When};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "smarties", version, about = "Smarties home-automation hub")]
struct Cli {
    /// Configuration file (defaults to $SMARTIES_CONFIG, then ~/.smarties/smarties.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler loop until interrupted
    Run {
        /// Log the payload of every job fired for this key (repeatable)
        #[arg(long, value_name = "KEY")]
        echo: Vec<String>,
    },
    /// Persist a job for KEY
    Schedule {
        key: String,
        /// now, minute, 5min, 10min, 30min, hour, 12h, day, Unix seconds or RFC 3339
        when: String,
        /// JSON payload handed to the callback
        #[arg(default_value = "null")]
        payload: String,
    },
    /// Cancel every pending job for KEY
    Cancel { key: String },
    /// List stored jobs
    Jobs {
        #[arg(long)]
        key: Option<String>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "smarties=info,smarties_scheduler=info,smarties_db=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = HubConfig::load(cli.config.as_deref())?;
    config.ensure_db_dir()?;

    let db = Arc::new(
        DbManager::open(&config.database.path)
            .with_context(|| format!("opening {}", config.database.path))?,
    );
    let scheduler = Scheduler::new(
        db,
        Arc::new(CallbackRegistry::new()),
        &config.scheduler.schema_version,
    )?
    .with_tick(Duration::from_secs(config.scheduler.tick_secs));

    match cli.command {
        Command::Run { echo } => run(scheduler, echo).await,
        Command::Schedule { key, when, payload } => {
            let when: When = when.parse()?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let id = scheduler.schedule(&key, when, &payload)?;
            println!("scheduled job {id}");
            Ok(())
        }
        Command::Cancel { key } => {
            let count = scheduler.cancel(&key)?;
            println!("cancelled {count} job(s)");
            Ok(())
        }
        Command::Jobs { key, json } => {
            let jobs = scheduler.jobs(key.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
                return Ok(());
            }
            for job in jobs {
                println!(
                    "{:>6}  {:<9}  {}  {}…  {}",
                    job.id,
                    job.state,
                    job.trigger_date.to_rfc3339(),
                    &job.identifier[..12.min(job.identifier.len())],
                    job.payload
                );
            }
            Ok(())
        }
    }
}

async fn run(scheduler: Scheduler, echo: Vec<String>) -> Result<()> {
    for key in echo {
        let name = key.clone();
        scheduler.register(&key, move |payload| {
            info!(key = %name, %payload, "job fired");
            Ok(())
        });
    }

    let scheduler = Arc::new(scheduler);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    let _ = shutdown_tx.send(true);
    handle.await?;
    Ok(())
}
