//! # Pod Provisioner CLI
//!
//! Runs provisioning workers against the PostgreSQL store and exposes the admin surface.
//! Adapters are the simulated backends until concrete hypervisor/DNS/mail/backup clients
//! are wired in.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pod_provisioner::adapters::simulated::SimulatedInfrastructure;
use pod_provisioner::config::ConfigManager;
use pod_provisioner::database;
use pod_provisioner::logging::init_structured_logging;
use pod_provisioner::orchestration::{LoggingNotifier, SubscriptionAggregator, WorkerPool};
use pod_provisioner::store::{PgProvisioningStore, ProvisioningStore};
use pod_provisioner::AdminService;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pod-provisioner")]
#[command(about = "Provision hosting pods from paid orders")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory (default: ./config)
    #[arg(short, long, env = "PODPROV_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run provisioning workers until interrupted
    Worker {
        /// Override `worker.worker_count`
        #[arg(short, long)]
        workers: Option<usize>,

        /// Drain claimable tasks once and exit
        #[arg(long)]
        once: bool,
    },

    /// Apply database migrations
    Migrate,

    /// Operator queries and interventions
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },
}

#[derive(Subcommand)]
enum AdminCommand {
    /// Task counts by type and status
    QueueDepth,
    /// A subscription and all of its tasks
    History { subscription_id: Uuid },
    /// Re-enqueue a failed task as a new generation
    Retry { task_id: Uuid },
    /// Dismiss a failed task
    Cancel {
        task_id: Uuid,
        #[arg(short, long, default_value = "dismissed by operator")]
        reason: String,
    },
    /// Tear a subscription down
    Deprovision {
        subscription_id: Uuid,
        #[arg(short, long, default_value = "customer cancellation")]
        reason: String,
    },
    /// Hold a subscription in suspended
    Suspend { subscription_id: Uuid },
    /// Lift a suspension
    Resume { subscription_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager =
        ConfigManager::load_from_directory(cli.config_dir).context("loading configuration")?;
    let config = manager.config();
    init_structured_logging(&config.logging);
    info!(environment = manager.environment(), "pod-provisioner starting");

    let pool = database::connect(&config.database)
        .await
        .context("connecting to database")?;

    if matches!(cli.command, Commands::Migrate) {
        database::run_migrations(&pool).await?;
        return Ok(());
    }
    if config.database.run_migrations {
        database::run_migrations(&pool).await?;
    }

    let store: Arc<dyn ProvisioningStore> = Arc::new(PgProvisioningStore::new(pool));

    match cli.command {
        Commands::Migrate => Ok(()),
        Commands::Worker { workers, once } => {
            let mut config = config.clone();
            if let Some(count) = workers {
                config.worker.worker_count = count;
            }
            config.validate()?;

            let infra = SimulatedInfrastructure::new();
            let pool = WorkerPool::from_config(
                &config,
                store,
                infra.adapters(),
                Arc::new(LoggingNotifier),
            );

            if once {
                let processed = pool.run_until_idle().await?;
                info!(processed, "Queue drained");
                return Ok(());
            }

            let signal_pool = pool.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                signal_pool.shutdown();
            });
            pool.run().await?;
            Ok(())
        }
        Commands::Admin { command } => {
            let aggregator = SubscriptionAggregator::with_logging_notifier(store.clone());
            let admin = AdminService::new(store, aggregator, config.execution.default_max_attempts);
            run_admin(&admin, command).await
        }
    }
}

async fn run_admin(admin: &AdminService, command: AdminCommand) -> Result<()> {
    match command {
        AdminCommand::QueueDepth => print_json(&admin.queue_depth().await?),
        AdminCommand::History { subscription_id } => {
            print_json(&admin.history(subscription_id).await?)
        }
        AdminCommand::Retry { task_id } => print_json(&admin.retry_failed(task_id).await?),
        AdminCommand::Cancel { task_id, reason } => {
            print_json(&admin.cancel_failed(task_id, &reason).await?)
        }
        AdminCommand::Deprovision {
            subscription_id,
            reason,
        } => {
            let outcome = admin.request_deprovision(subscription_id, &reason).await?;
            print_json(&serde_json::json!({
                "subscription": outcome.subscription,
                "cancelled": outcome.cancelled,
                "deprovision_task": outcome.deprovision_task,
            }))
        }
        AdminCommand::Suspend { subscription_id } => {
            print_json(&admin.suspend(subscription_id).await?)
        }
        AdminCommand::Resume { subscription_id } => {
            print_json(&admin.resume(subscription_id).await?)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
