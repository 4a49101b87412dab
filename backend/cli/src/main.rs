mod console;
mod terminal_output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use modhost_config::{HostConfig, apply_all_defaults, load_and_prepare, resolve_config_path, write_config};
use modhost_plugins::{DirectorySource, ModDiscovery, ModManager, ShutdownCoordinator, ShutdownReason};

use terminal_output::{note_error, note_info, note_success, render_table};

#[derive(Parser)]
#[command(name = "modhost")]
#[command(about = "Hot-reloadable mod host")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// Config file (defaults to $MODHOST_CONFIG, then ~/.modhost/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the mods directory
    #[arg(short, long)]
    mods_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the host and read operator commands from stdin
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Skip loading discovered mods at startup
        #[arg(long)]
        no_autoload: bool,
    },
    /// List the mods available in the mods directory
    List {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Write a config file with every default filled in
    Init {
        /// Destination (defaults to the resolved config path)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, no_autoload } => {
            let host = prepare(&config).await?;
            let log_dir = host.log_dir();
            modhost_logging::init_logger(log_dir.as_deref(), host.log_level(), host.log_json());
            let autoload = should_autoload(&host, no_autoload);
            run_host(host, autoload).await?;
        }
        Commands::List { config } => {
            let host = prepare(&config).await?;
            list_available(&host.mods_dir())?;
        }
        Commands::Init { config, force } => {
            let path = resolve_config_path(config.as_deref());
            if path.exists() && !force {
                note_error(&format!("{} already exists (use --force to overwrite)", path.display()));
                return Ok(());
            }
            write_config(&apply_all_defaults(HostConfig::default()), &path).await?;
            note_success(&format!("wrote {}", path.display()));
        }
    }

    Ok(())
}

async fn prepare(args: &ConfigArgs) -> Result<HostConfig> {
    let path = resolve_config_path(args.config.as_deref());
    let mut host = load_and_prepare(&path)
        .await
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    if let Some(dir) = &args.mods_dir {
        host.mods_dir = Some(dir.display().to_string());
    }
    Ok(host)
}

/// `--no-autoload` can only turn autoload off; it never overrides a config
/// that already disabled it.
fn should_autoload(host: &HostConfig, no_autoload: bool) -> bool {
    host.autoload() && !no_autoload
}

async fn run_host(host: HostConfig, autoload: bool) -> Result<()> {
    let mods_dir = host.mods_dir();
    info!(mods_dir = %mods_dir.display(), autoload, "Starting mod host");

    let manager = ModManager::from_source(Arc::new(DirectorySource::new(&mods_dir)));
    let coordinator = ShutdownCoordinator::new();
    coordinator.listen_for_signals();

    if autoload {
        let report = manager.autoload().await.context("Failed to discover mods")?;
        note_info(&format!(
            "autoloaded {} of {} mod(s)",
            report.succeeded().count(),
            report.len()
        ));
        for (name, err) in report.failures() {
            note_error(&format!("{name}: {err:#}"));
        }
    }

    let operator = tokio::spawn(console::run(manager.clone(), coordinator.clone()));
    coordinator.supervise("operator console", operator);

    let reason = coordinator.run(&manager).await;
    info!(reason = %reason, "Mod host stopped");
    if let ShutdownReason::Fault(message) = reason {
        anyhow::bail!("host fault: {message}");
    }
    Ok(())
}

fn list_available(mods_dir: &Path) -> Result<()> {
    let names = DirectorySource::new(mods_dir).discover()?;
    if names.is_empty() {
        note_info(&format!("no mods in {}", mods_dir.display()));
        return Ok(());
    }
    let rows: Vec<Vec<String>> = names
        .into_iter()
        .map(|name| {
            let path = mods_dir.join(format!("{name}.json"));
            vec![name, path.display().to_string()]
        })
        .collect();
    print!("{}", render_table(&["MOD", "MANIFEST"], &rows));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autoload_needs_config_and_flag_to_agree() {
        let enabled = HostConfig::default();
        let disabled = HostConfig {
            autoload: Some(false),
            ..HostConfig::default()
        };

        assert!(should_autoload(&enabled, false));
        assert!(!should_autoload(&enabled, true));
        assert!(!should_autoload(&disabled, false));
        assert!(!should_autoload(&disabled, true));
    }
}
