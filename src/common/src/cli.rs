use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI arguments shared by every blobkeeper command
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Subcommands that only need configuration, not open stores
#[derive(Subcommand, Debug, Clone, Default)]
pub enum CommonCommands {
    /// Start the engine (default behavior)
    #[default]
    Start,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Initialize logging based on CLI arguments. `RUST_LOG` wins when set.
    pub fn init_logging(args: &CommonArgs) {
        let level = if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        // Ignore the error when a subscriber is already installed
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
            return Ok(());
        }

        println!("blobkeeper configuration:");
        println!("=========================");
        println!("Database DSN: {}", config.database.dsn);

        let mut stores: Vec<_> = config.effective_stores().into_iter().collect();
        stores.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, store) in stores {
            println!("Blob store '{name}': {}", store.dsn);
            if let Some(max) = store.max_size_bytes {
                println!("  max size: {max} bytes");
            }
            if let Some(max) = store.max_blob_count {
                println!("  max blob count: {max}");
            }
        }

        for repository in &config.repositories {
            println!(
                "Repository '{}' ({}) -> store '{}', policies: {:?}",
                repository.name,
                repository.format,
                repository.blob_store,
                repository.cleanup_policies
            );
        }
        for policy in &config.cleanup_policies {
            println!(
                "Cleanup policy '{}' (format {}, mode {:?}): {:?}",
                policy.name, policy.format, policy.mode, policy.criteria
            );
        }

        let compactor = &config.compactor;
        println!("Compactor enabled: {}", compactor.enabled);
        println!(
            "Reclaim: enabled={} interval={:?} batch_size={} dry_run={}",
            compactor.reclaim.enabled,
            compactor.reclaim.interval,
            compactor.reclaim.batch_size,
            compactor.reclaim.dry_run
        );
        println!(
            "Cleanup: enabled={} interval={:?} batch_size={}",
            compactor.cleanup.enabled, compactor.cleanup.interval, compactor.cleanup.batch_size
        );
        println!(
            "Quota check: enabled={} interval={:?}",
            compactor.quota.enabled, compactor.quota.interval
        );
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");
        config.validate()?;
        log::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Handle commands that don't require starting the engine
    pub async fn handle_common_command(
        command: &CommonCommands,
        config: &Configuration,
    ) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                Ok(true)
            }
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(true)
            }
            CommonCommands::Start => Ok(false),
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    #[test]
    fn test_common_commands_default() {
        assert!(matches!(CommonCommands::default(), CommonCommands::Start));
    }

    #[test]
    fn test_version_info() {
        let version = utils::version_info();
        assert!(version.contains(env!("CARGO_PKG_VERSION")));
    }

    #[tokio::test]
    async fn test_start_is_not_handled() {
        let config = Configuration::default();
        let handled = utils::handle_common_command(&CommonCommands::Start, &config)
            .await
            .unwrap();
        assert!(!handled);
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_config() {
        let mut config = Configuration::default();
        config.database.dsn.clear();

        let result = utils::handle_common_command(&CommonCommands::Validate, &config).await;
        assert!(result.is_err());
    }
}
