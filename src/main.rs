use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::Configuration;
use common::ledger::{DeletionLedger, SqlDeletionLedger};
use common::metadata::SqlMetadataStore;
use common::{BlobStoreRegistry, Database};
use compactor::CompactorService;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "blobkeeper")]
#[command(about = "Blobkeeper - blob lifecycle and storage reclamation engine")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<BlobkeeperCommands>,
}

#[derive(Subcommand)]
enum BlobkeeperCommands {
    #[command(flatten)]
    Common(CommonCommands),
    /// Run one reclaim pass and exit
    Reclaim {
        /// Store to reclaim; every store when omitted
        store: Option<String>,
    },
    /// Run every cleanup policy once and exit
    Cleanup,
    /// Check quotas of every store and exit
    Quota,
    /// Re-record soft-deleted blobs the ledger has lost track of
    RebuildLedger {
        store: String,
    },
    /// Drop every pending ledger entry of a store without reclaiming
    PurgeLedger {
        store: String,
    },
}

impl Default for BlobkeeperCommands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

/// Open the database, ledger, metadata and stores in dependency order.
async fn build_service(
    config: &Configuration,
) -> Result<(CompactorService, Arc<dyn DeletionLedger>, Database)> {
    let db = Database::connect(&config.database.dsn)
        .await
        .context("Failed to connect to database")?;

    // A failed legacy migration is fatal
    let ledger: Arc<dyn DeletionLedger> = Arc::new(
        SqlDeletionLedger::new(db.clone())
            .await
            .context("Failed to initialize deletion ledger")?,
    );
    let metadata = Arc::new(
        SqlMetadataStore::new(db.clone())
            .await
            .context("Failed to initialize metadata store")?,
    );
    let registry = BlobStoreRegistry::from_config(config)
        .await
        .context("Failed to open blob stores")?;

    log::info!(
        "Opened {} blob store(s): {}",
        registry.len(),
        registry.names().collect::<Vec<_>>().join(", ")
    );

    let service = CompactorService::new(config, registry, ledger.clone(), metadata);
    Ok((service, ledger, db))
}

async fn run_once(command: BlobkeeperCommands, config: &Configuration) -> Result<()> {
    let (service, ledger, db) = build_service(config).await?;
    let cancel = CancellationToken::new();

    match command {
        BlobkeeperCommands::Reclaim { store } => {
            let stores: Vec<String> = match store {
                Some(store) => vec![store],
                None => config.effective_stores().into_keys().collect(),
            };
            for name in stores {
                let Some(reclaimer) = service.reclaimer(&name) else {
                    bail!("Unknown blob store '{name}'");
                };
                let result = reclaimer.reclaim(&cancel).await?;
                println!(
                    "{}: examined {}, hard deleted {}, cleared {}, retained {}, failed {}",
                    result.store_name,
                    result.examined,
                    result.hard_deleted,
                    result.cleared(),
                    result.retained(),
                    result.failed
                );
            }
        }
        BlobkeeperCommands::Cleanup => {
            let runs = service.cleanup().run(&cancel).await?;
            for run in runs {
                println!(
                    "{}/{} ({:?}): matched {}, deleted {}, blobs soft deleted {}{}",
                    run.repository,
                    run.policy,
                    run.mode,
                    run.matched,
                    run.progress.count,
                    run.progress.blobs_soft_deleted,
                    run.error
                        .map(|e| format!(", failed: {e}"))
                        .unwrap_or_default()
                );
            }
        }
        BlobkeeperCommands::Quota => {
            let mut violations = 0;
            for result in service.quota().check_all().await {
                match result {
                    Ok(result) => {
                        if result.is_violation {
                            violations += 1;
                        }
                        println!("{}: {}", result.store_name, result.message);
                    }
                    Err(e) => println!("error: {e}"),
                }
            }
            if violations > 0 {
                log::warn!("{violations} store(s) over quota");
            }
        }
        BlobkeeperCommands::RebuildLedger { store } => {
            let Some(reclaimer) = service.reclaimer(&store) else {
                bail!("Unknown blob store '{store}'");
            };
            let recorded = reclaimer.rebuild_ledger().await?;
            println!("{store}: recorded {recorded} soft-deleted blob(s)");
        }
        BlobkeeperCommands::PurgeLedger { store } => {
            if service.reclaimer(&store).is_none() {
                bail!("Unknown blob store '{store}'");
            }
            let purged = ledger.purge(&store).await?;
            log::warn!(
                "Purged {purged} ledger entries of store '{store}'; their content will not be reclaimed"
            );
            println!("{store}: purged {purged} ledger entries");
        }
        BlobkeeperCommands::Common(_) => {}
    }

    service.stop().await;
    db.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on CLI arguments
    utils::init_logging(&cli.common);

    // Load application configuration
    let config = utils::load_config(cli.common.config.as_ref())?;

    let command = cli.command.unwrap_or_default();
    match command {
        BlobkeeperCommands::Common(ref common_cmd) => {
            if utils::handle_common_command(common_cmd, &config).await? {
                return Ok(()); // Command handled, exit early
            }
        }
        other => {
            config.validate()?;
            return run_once(other, &config).await;
        }
    }

    config.validate()?;
    log::info!("Starting blobkeeper");
    log::info!("  Database DSN: {}", config.database.dsn);

    let (mut service, _ledger, db) = build_service(&config).await?;
    service.start();

    wait_for_shutdown_signal().await?;

    log::info!("Shutting down blobkeeper");
    service.stop().await;
    db.close().await;
    log::info!("Blobkeeper stopped");

    Ok(())
}
