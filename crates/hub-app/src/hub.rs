//! Process entry points: the controller (`master`) and a remote `node`.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use hub_core::prelude::*;
use hub_device::{DeviceManager, ToolAvailability};

use crate::config::{parse_socket_addr, resolve_host_ip, Settings};
use crate::node_agent::NodeAgent;
use crate::node_listener::NodeListener;
use crate::node_service::NodeService;
use crate::remlog::{LogIngestionHandle, LogIngestionService};
use crate::session::SessionCoordinator;

/// Start every enabled manager whose tools are present.
///
/// Managers that cannot run are skipped with a warning.
pub async fn local_managers(
    settings: &Settings,
    tools: &ToolAvailability,
    host_ip: IpAddr,
) -> Vec<Arc<DeviceManager>> {
    let mut managers = Vec::new();

    for platform in settings.managers.enabled() {
        if let Some(reason) = tools.unavailable_message(platform) {
            warn!("Skipping {} manager: {}", platform, reason);
            continue;
        }

        let manager = DeviceManager::for_platform(platform, host_ip);
        if let Err(e) = manager.start().await {
            warn!("Failed to start {} manager: {}", manager.name(), e);
            continue;
        }
        if let Err(e) = manager.refresh_devices().await {
            warn!("Initial refresh of {} failed: {}", manager.name(), e);
        }
        managers.push(Arc::new(manager));
    }

    managers
}

async fn stop_managers(managers: &[Arc<DeviceManager>]) {
    for manager in managers {
        if let Err(e) = manager.stop().await {
            warn!("Failed to stop {} manager: {}", manager.name(), e);
        }
    }
}

/// Run the controller until `shutdown` flips to `true`
pub async fn run_master(
    settings: Settings,
    tools: ToolAvailability,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let host_ip = resolve_host_ip(&settings.hub);
    info!("Controller reachable by apps at {}", host_ip);

    let coordinator = Arc::new(
        SessionCoordinator::new(host_ip)
            .with_max_connection_wait(settings.hub.max_connection_wait()),
    );

    let managers = local_managers(&settings, &tools, host_ip).await;
    for manager in &managers {
        coordinator.register_manager(Arc::clone(manager)).await;
    }

    let log_ingestion = start_log_ingestion(&settings, &coordinator).await?;

    let node_addr = parse_socket_addr("hub.node_listen", &settings.hub.node_listen)?;
    let listener = TcpListener::bind(node_addr)
        .await
        .with_context(|| format!("Failed to bind node listener on {node_addr}"))?;
    let node_listener = Arc::new(NodeListener::new(Arc::clone(&coordinator), &settings.rpc));
    let listener_task = tokio::spawn(node_listener.serve(listener, shutdown.clone()));

    let mut refresh = tokio::time::interval(settings.hub.refresh_interval());
    refresh.tick().await;

    loop {
        tokio::select! {
            _ = refresh.tick() => coordinator.refresh_all().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Controller shutting down");
    coordinator.stop_all().await;
    if let Some(handle) = log_ingestion {
        handle.shutdown().await;
    }
    let _ = listener_task.await;
    stop_managers(&managers).await;
    Ok(())
}

async fn start_log_ingestion(
    settings: &Settings,
    coordinator: &Arc<SessionCoordinator>,
) -> Result<Option<LogIngestionHandle>> {
    if !settings.log_ingestion.enabled {
        info!("Log ingestion disabled");
        return Ok(None);
    }

    let bind = parse_socket_addr("log_ingestion.bind", &settings.log_ingestion.bind)?;
    let coordinator = Arc::clone(coordinator);
    let handle = LogIngestionService::run(bind, move |line| {
        coordinator.route_log_line(line);
    })
    .await?;
    Ok(Some(handle))
}

/// Run a node until `shutdown` flips to `true`
pub async fn run_node(
    settings: Settings,
    tools: ToolAvailability,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let host_ip = resolve_host_ip(&settings.hub);
    let managers = local_managers(&settings, &tools, host_ip).await;
    if managers.is_empty() {
        return Err(Error::config("no device manager can run on this node"));
    }

    let service = Arc::new(NodeService::new(managers.iter().cloned()));
    let agent = NodeAgent::new(&settings, service);
    agent.run(shutdown).await;

    stop_managers(&managers).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::Platform;
    use hub_device::test_utils::localhost;

    fn macos_only() -> Settings {
        let mut settings = Settings::default();
        settings.managers.ios_simulator = false;
        settings.managers.android = false;
        settings
    }

    #[tokio::test]
    async fn test_local_managers_skip_missing_tools() {
        let tools = ToolAvailability {
            xcrun_simctl: false,
            adb_path: None,
            macos_host: true,
        };
        let managers = local_managers(&Settings::default(), &tools, localhost()).await;
        let platforms: Vec<Platform> = managers.iter().map(|m| m.platform()).collect();
        assert_eq!(platforms, vec![Platform::MacOs]);
    }

    #[tokio::test]
    async fn test_node_without_managers_refuses_to_start() {
        let tools = ToolAvailability {
            xcrun_simctl: false,
            adb_path: None,
            macos_host: false,
        };
        let (_tx, rx) = watch::channel(false);
        let err = tokio_test::assert_err!(run_node(macos_only(), tools, rx).await);
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_master_stops_on_shutdown() {
        let mut settings = macos_only();
        settings.hub.host_ip = "127.0.0.1".to_string();
        settings.hub.node_listen = "127.0.0.1:0".to_string();
        settings.log_ingestion.bind = "127.0.0.1:0".to_string();
        let tools = ToolAvailability {
            xcrun_simctl: false,
            adb_path: None,
            macos_host: true,
        };

        let (tx, rx) = watch::channel(false);
        let master = tokio::spawn(run_master(settings, tools, rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let finished = tokio::time::timeout(std::time::Duration::from_secs(5), master)
            .await
            .unwrap()
            .unwrap();
        tokio_test::assert_ok!(finished);
    }
}
