//! taskroom CLI: run workers and crons, or poke at queues and markers.

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use taskroom::config::Config;
use taskroom::control::{ControlConfig, ControlPlane};
use taskroom::cron::Crons;
use taskroom::db::Db;
use taskroom::queue::{BATCH_QUEUE, HANDLER_QUEUE};
use taskroom::tasks::Registry;
use taskroom::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use taskroom::{Runtime, campaigns};

#[derive(Parser)]
#[command(name = "taskroom", version, about = "Task workers for a messaging flow server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run queue workers and crons until Ctrl-C
    Serve {
        /// Workers popping from the batch queue (overrides BATCH_WORKERS)
        #[arg(long)]
        batch_workers: Option<usize>,
        /// Workers popping from the handler queue (overrides HANDLER_WORKERS)
        #[arg(long)]
        handler_workers: Option<usize>,
    },
    /// Apply database migrations
    Migrate,
    /// Run one campaign event scan now
    Scan,
    /// Print the size of each queue
    Queues,
    /// Marker set operations
    Markers {
        #[command(subcommand)]
        action: MarkerAction,
    },
}

#[derive(Subcommand)]
enum MarkerAction {
    /// Remove every marker in a group
    Clear {
        /// Marker group, e.g. campaign_event
        group: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = telemetry(&config)?;

    match cli.command {
        Command::Serve {
            batch_workers,
            handler_workers,
        } => cmd_serve(&config, batch_workers, handler_workers).await,
        Command::Migrate => {
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Command::Scan => {
            let rt = Runtime::connect(&config).await?;
            let stats = campaigns::queue_event_fires(&rt).await?;
            println!(
                "Queued {} fire(s) in {} task(s), skipped {} already queued.",
                stats.queued, stats.tasks, stats.dupes
            );
            Ok(())
        }
        Command::Queues => {
            let rt = Runtime::connect(&config).await?;
            for queue in [BATCH_QUEUE, HANDLER_QUEUE] {
                println!("{:<10} {}", queue, rt.queue.size(queue).await?);
            }
            Ok(())
        }
        Command::Markers {
            action: MarkerAction::Clear { group },
        } => {
            let rt = Runtime::connect(&config).await?;
            rt.markers.clear(&group).await?;
            println!("Cleared markers in {group}.");
            Ok(())
        }
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "taskroom".to_string(),
        default_level: config.log_level.clone(),
    })?)
}

async fn cmd_serve(
    config: &Config,
    batch_workers: Option<usize>,
    handler_workers: Option<usize>,
) -> anyhow::Result<()> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    db.health_check().await?;

    let rt = Runtime::connect(config).await?;
    let control = ControlPlane::new(
        rt,
        Registry::with_core_tasks(),
        Crons::with_core_crons(),
        ControlConfig {
            batch_workers: batch_workers.unwrap_or(config.batch_workers),
            handler_workers: handler_workers.unwrap_or(config.handler_workers),
            ..ControlConfig::default()
        },
    );

    let ctrl = control.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    control.run().await?;
    Ok(())
}
