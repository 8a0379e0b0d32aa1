use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use warren::config;
use warren::portmap::{IptablesEffector, PortForwardServer};
use warren::telemetry::{init_logging, MetricsRegistry};
use warren::tunnel::TunnelManager;

#[derive(Parser)]
#[command(name = "warren")]
#[command(about = "WireGuard tunnel manager with in-tunnel NAT-PMP port forwarding")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the management daemon
    Run {
        /// Path to warren.toml
        #[arg(short, long, default_value = "warren.toml")]
        config: PathBuf,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate warren.toml without starting the daemon
    Validate {
        /// Path to warren.toml
        #[arg(short, long, default_value = "warren.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run { config }) => {
            if let Err(e) = cmd_run(&config) {
                eprintln!("[ERROR] {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Validate { config } => {
                if let Err(e) = cmd_config_validate(&config) {
                    eprintln!("[ERROR] {}", e);
                    std::process::exit(1);
                }
            }
        },
        None => {
            // Default: run with warren.toml
            if let Err(e) = cmd_run(&PathBuf::from("warren.toml")) {
                eprintln!("[ERROR] {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn cmd_run(config_path: &PathBuf) -> Result<(), String> {
    use tokio::runtime::Runtime;

    let config =
        config::load(config_path).map_err(|e| format!("Failed to load config: {}", e))?;

    // Initialize logging (RUST_LOG env var takes priority)
    init_logging(Some(&config.log));

    let validation = config::validate(&config);
    validation.print_diagnostics();
    if validation.has_errors() {
        return Err("Validation failed with errors".to_string());
    }

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let metrics = Arc::new(MetricsRegistry::new());

        let manager = Arc::new(TunnelManager::new(config.tunnel.clone(), metrics.clone()));
        if let Err(e) = manager.ensure_interface() {
            warn!("failed to ensure tunnel interface: {}", e);
            warn!("make sure wireguard-tools is installed and the process has root privileges");
        }

        let port_forward = Arc::new(
            PortForwardServer::start(
                &config.tunnel,
                config.port_forward.clone(),
                Box::new(IptablesEffector::new()),
                metrics.clone(),
            )
            .await,
        );

        // Revoke a departed peer's mappings before its address can be reused.
        {
            let port_forward = port_forward.clone();
            manager.on_peer_removed(Box::new(move |addr| {
                port_forward.revoke_client(addr);
            }));
        }

        info!(
            "warren started: interface {}, {} peers",
            config.tunnel.interface,
            manager.peers().len()
        );

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("Failed to wait for ctrl-c: {}", e))?;

        info!("shutting down...");
        port_forward.stop().await;

        for (name, value) in metrics.export() {
            debug!("metric {} = {}", name, value);
        }

        Ok(())
    })
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let config =
        config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&config);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}
