//! Automation hub - test-device fleet controller
//!
//! This is the binary entry point. All logic lives in the workspace crates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use hub_app::config::{self, Settings, CONFIG_FILENAME};
use hub_core::logging::LogRole;
use hub_core::prelude::*;
use hub_device::{DeviceManager, ToolAvailability};

/// Automation hub - run apps under test across simulators, emulators and nodes
#[derive(Parser, Debug)]
#[command(name = "hub")]
#[command(about = "Test-device fleet controller", long_about = None)]
struct Args {
    /// Path to hub.toml
    #[arg(long, global = true, value_name = "PATH", default_value = CONFIG_FILENAME)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller: local managers, log ingestion and the node listener
    Master,

    /// Run a node that serves its local devices to a controller
    Node,

    /// List devices, or power one on or off
    Devices {
        #[command(subcommand)]
        action: Option<DeviceAction>,
    },

    /// Write a default config file
    InitConfig {
        /// Where to write it (defaults to --config)
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum DeviceAction {
    /// Boot a device
    Start { id: String },
    /// Shut a device down
    Stop { id: String },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let role = match args.command {
        Command::Master => LogRole::Master,
        Command::Node => LogRole::Node,
        _ => LogRole::Command,
    };
    hub_core::logging::init(role)?;

    let result = run(args).await;
    if let Err(ref e) = result {
        error!("Hub error: {:?}", e);
    }
    info!("Automation hub exiting");
    Ok(result?)
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Command::InitConfig { path } => {
            let path = path.unwrap_or(args.config);
            if config::init_config(&path)? {
                eprintln!("Wrote {}", path.display());
            } else {
                eprintln!("{} already exists, left untouched", path.display());
            }
            Ok(())
        }
        Command::Master => {
            let settings = load(&args.config)?;
            let tools = ToolAvailability::check().await;
            hub_app::run_master(settings, tools, shutdown_on_ctrl_c()).await
        }
        Command::Node => {
            let settings = load(&args.config)?;
            let tools = ToolAvailability::check().await;
            hub_app::run_node(settings, tools, shutdown_on_ctrl_c()).await
        }
        Command::Devices { action } => {
            let settings = load(&args.config)?;
            let tools = ToolAvailability::check().await;
            let host_ip = config::resolve_host_ip(&settings.hub);
            let managers = hub_app::local_managers(&settings, &tools, host_ip).await;

            match action {
                None => print_inventory(&managers).await,
                Some(DeviceAction::Start { id }) => {
                    owning_manager(&managers, &id).await?.start_device(&id).await?;
                    eprintln!("{id} booted");
                }
                Some(DeviceAction::Stop { id }) => {
                    owning_manager(&managers, &id).await?.stop_device(&id).await?;
                    eprintln!("{id} shut down");
                }
            }
            Ok(())
        }
    }
}

fn load(path: &Path) -> Result<Settings> {
    let settings = config::load_settings(path);
    config::validate_settings(&settings)?;
    Ok(settings)
}

/// Flips to `true` on the first Ctrl-C
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                let _ = tx.send(true);
            }
            Err(e) => {
                warn!("Cannot listen for Ctrl-C: {}", e);
                // Keep the sender alive so receivers don't see a closed channel
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

async fn owning_manager<'a>(
    managers: &'a [Arc<DeviceManager>],
    id: &str,
) -> Result<&'a Arc<DeviceManager>> {
    for manager in managers {
        if manager.find_device(id).await.is_some() {
            return Ok(manager);
        }
    }
    Err(Error::device_not_found(id))
}

async fn print_inventory(managers: &[Arc<DeviceManager>]) {
    if managers.is_empty() {
        println!("No device manager can run on this host.");
        return;
    }

    for manager in managers {
        println!("{}:", manager.name());
        let devices = manager.get_devices().await;
        if devices.is_empty() {
            println!("  (no devices)");
        }
        for device in devices {
            let info = device.info();
            println!(
                "  {:<40} {:<28} {:<10} {}",
                info.id,
                info.display_name(),
                device.state().lifecycle.to_string(),
                info.ip_address
            );
        }
    }
}
