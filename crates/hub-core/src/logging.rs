//! Logging for the hub processes.
//!
//! The controller and each node write separate daily files so a rack
//! running both on one machine keeps their histories apart. One-shot
//! commands share a third file and stay quiet on the terminal.

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

const DEFAULT_FILTER: &str = "automation_hub=info,hub_=info,warn";

/// Which hub process is logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRole {
    /// `hub master`: sessions, log ingestion, node listener
    Master,
    /// `hub node`: serves its local managers to a controller
    Node,
    /// Short commands (`devices`, `init-config`)
    Command,
}

impl LogRole {
    fn file_prefix(self) -> &'static str {
        match self {
            LogRole::Master => "master.log",
            LogRole::Node => "node.log",
            LogRole::Command => "hub.log",
        }
    }

    /// Long-running roles mirror their log on stderr
    fn mirrors_to_console(self) -> bool {
        matches!(self, LogRole::Master | LogRole::Node)
    }

    fn banner(self) -> &'static str {
        match self {
            LogRole::Master => "Automation hub controller starting",
            LogRole::Node => "Automation hub node starting",
            LogRole::Command => "Automation hub command",
        }
    }
}

/// Install the global subscriber for `role`.
///
/// `HUB_LOG` overrides the filter, e.g. `HUB_LOG=hub_node=trace hub node`.
pub fn init(role: LogRole) -> Result<()> {
    let log_dir = log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, role.file_prefix());
    let env_filter =
        EnvFilter::try_from_env("HUB_LOG").unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let console_layer = role.mirrors_to_console().then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_timer(fmt::time::ChronoLocal::new("%H:%M:%S%.3f".to_string()))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .with(console_layer)
        .init();

    tracing::info!("{} (pid {})", role.banner(), std::process::id());
    tracing::info!("Writing {}* under {}", role.file_prefix(), log_dir.display());

    Ok(())
}

fn log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("automation-hub")
        .join("logs")
}
