//! Session coordination: one run of an app under test on one device.
//!
//! The coordinator picks a device across all registered managers, drives
//! install/start/stop through the device handle and routes ingested log
//! lines to the session whose id they contain.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use hub_core::prelude::*;
use hub_core::{AppParameter, ConnectionState};
use hub_device::{Device, DeviceManager};

use crate::remlog::LogLine;

const SESSION_ID_LEN: usize = 16;

/// Per-session log queue
const LOG_CHANNEL_CAPACITY: usize = 1024;

/// How often a remote device's node is asked whether the app reported in
const CONNECTION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What to run and where
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub app: AppParameter,
    /// Run on this device; otherwise the first booted idle one
    pub device_id: Option<String>,
    /// Record the session to `<record>.mp4`
    pub record: Option<PathBuf>,
}

impl SessionRequest {
    pub fn new(app: AppParameter) -> Self {
        Self {
            app,
            device_id: None,
            record: None,
        }
    }

    pub fn on_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_recording(mut self, path: impl Into<PathBuf>) -> Self {
        self.record = Some(path.into());
        self
    }
}

/// A started session, handed to the caller
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: String,
    pub device: Arc<Device>,
    /// Log lines mentioning this session
    pub logs: mpsc::Receiver<LogLine>,
}

#[derive(Debug)]
struct ActiveSession {
    device: Arc<Device>,
    app: AppParameter,
    logs: mpsc::Sender<LogLine>,
    recording: bool,
}

#[derive(Debug)]
pub struct SessionCoordinator {
    host_ip: IpAddr,
    max_connection_wait: Option<Duration>,
    managers: RwLock<Vec<Arc<DeviceManager>>>,
    /// Sync lock: touched from the log ingestion loop, never held across an await
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

impl SessionCoordinator {
    pub fn new(host_ip: IpAddr) -> Self {
        Self {
            host_ip,
            max_connection_wait: None,
            managers: RwLock::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Cap every platform's connection budget at `limit`
    pub fn with_max_connection_wait(mut self, limit: Option<Duration>) -> Self {
        self.max_connection_wait = limit;
        self
    }

    pub fn host_ip(&self) -> IpAddr {
        self.host_ip
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─────────────────────────────────────────────────────────────
    // Managers
    // ─────────────────────────────────────────────────────────────

    pub async fn register_manager(&self, manager: Arc<DeviceManager>) {
        info!("Registered manager {}", manager.name());
        self.managers.write().await.push(manager);
    }

    /// Drop a manager and release sessions on its devices.
    ///
    /// Returns whether the manager was registered.
    pub async fn unregister_manager(&self, name: &str) -> bool {
        self.remove_managers(|m| m.name() == name).await
    }

    /// Drop this exact manager instance.
    ///
    /// A newer manager registered under the same name is left alone.
    pub async fn unregister_manager_instance(&self, manager: &Arc<DeviceManager>) -> bool {
        self.remove_managers(|m| Arc::ptr_eq(m, manager)).await
    }

    async fn remove_managers<F>(&self, matches: F) -> bool
    where
        F: Fn(&Arc<DeviceManager>) -> bool,
    {
        let mut removed = Vec::new();
        self.managers.write().await.retain(|m| {
            if matches(m) {
                removed.push(m.clone());
                false
            } else {
                true
            }
        });

        if removed.is_empty() {
            return false;
        }

        for manager in &removed {
            for device in manager.get_devices().await {
                let orphaned: Vec<String> = self
                    .lock_sessions()
                    .iter()
                    .filter(|(_, s)| Arc::ptr_eq(&s.device, &device))
                    .map(|(id, _)| id.clone())
                    .collect();
                for session_id in orphaned {
                    warn!(
                        "Releasing session {} on {}: manager {} went away",
                        session_id,
                        device.id(),
                        manager.name()
                    );
                    self.lock_sessions().remove(&session_id);
                }
            }
            info!("Unregistered manager {}", manager.name());
        }

        true
    }

    pub async fn managers(&self) -> Vec<Arc<DeviceManager>> {
        self.managers.read().await.clone()
    }

    /// Refresh every manager; failures are logged, not returned
    pub async fn refresh_all(&self) {
        for manager in self.managers().await {
            if let Err(e) = manager.refresh_devices().await {
                debug!("Refresh of {} failed: {}", manager.name(), e);
            }
        }
    }

    pub async fn find_device(&self, id: &str) -> Option<Arc<Device>> {
        for manager in self.managers().await {
            if let Some(device) = manager.find_device(id).await {
                return Some(device);
            }
        }
        None
    }

    async fn select_device(&self, request: &SessionRequest) -> Result<Arc<Device>> {
        if let Some(id) = &request.device_id {
            return self
                .find_device(id)
                .await
                .ok_or_else(|| Error::device_not_found(id));
        }

        for manager in self.managers().await {
            for device in manager.get_devices().await {
                if device.state().is_booted() && !device.is_busy().await {
                    return Ok(device);
                }
            }
        }
        Err(Error::invalid_state("no booted idle device available"))
    }

    // ─────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────

    /// Install if needed, launch and wait for the app to report in.
    ///
    /// On connection timeout the app is stopped, the session released and
    /// [`Error::ConnectionTimeout`] returned.
    pub async fn start_session(&self, request: SessionRequest) -> Result<SessionHandle> {
        let device = self.select_device(&request).await?;
        let app = &request.app;

        if !device.is_app_installed(app).await {
            device.install_app(app).await?;
        }

        let session_id = generate_session_id();
        let (logs_tx, logs_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);

        // Registered before launch so the app's first lines are not lost
        self.lock_sessions().insert(
            session_id.clone(),
            ActiveSession {
                device: device.clone(),
                app: app.clone(),
                logs: logs_tx,
                recording: false,
            },
        );

        if let Err(e) = device.start_app(app, &session_id, self.host_ip).await {
            self.lock_sessions().remove(&session_id);
            return Err(e);
        }
        info!("Session {} started on {}", session_id, device.id());

        if let Some(path) = &request.record {
            match device.start_recording(path).await {
                Ok(()) => {
                    if let Some(session) = self.lock_sessions().get_mut(&session_id) {
                        session.recording = true;
                    }
                }
                Err(e) => warn!("Session {}: recording not started: {}", session_id, e),
            }
        }

        let mut budget = device.connection_timeout().await;
        if let Some(cap) = self.max_connection_wait {
            budget = budget.min(cap);
        }

        if let Err(e) = wait_for_connection(&device, budget).await {
            warn!("Session {}: {}", session_id, e);
            if let Err(stop_err) = self.stop_session(&session_id).await {
                warn!("Session {}: cleanup after timeout failed: {}", session_id, stop_err);
            }
            return Err(e);
        }

        Ok(SessionHandle {
            session_id,
            device,
            logs: logs_rx,
        })
    }

    /// Stop the app and release the session.
    ///
    /// The session is released before stopping, so a failed stop is
    /// reported but never leaves the device busy.
    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        let session = self
            .lock_sessions()
            .remove(session_id)
            .ok_or_else(|| Error::invalid_state(format!("unknown session {session_id}")))?;

        if session.recording {
            if let Err(e) = session.device.stop_recording().await {
                warn!("Session {}: stopping recording failed: {}", session_id, e);
            }
        }

        let result = session.device.stop_app(&session.app).await;
        match &result {
            Ok(()) => info!("Session {} stopped", session_id),
            Err(e) => warn!("Session {} stopped with error: {}", session_id, e),
        }
        result
    }

    /// Stop every session (shutdown)
    pub async fn stop_all(&self) {
        for session_id in self.active_sessions() {
            if let Err(e) = self.stop_session(&session_id).await {
                warn!("Stopping session {} failed: {}", session_id, e);
            }
        }
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock_sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn session_device(&self, session_id: &str) -> Option<Arc<Device>> {
        self.lock_sessions()
            .get(session_id)
            .map(|s| s.device.clone())
    }

    /// The app of `session_id` reported in
    pub fn app_connected(&self, session_id: &str) -> Result<()> {
        self.set_session_connection(session_id, ConnectionState::Connected)
    }

    /// The app of `session_id` went away
    pub fn app_disconnected(&self, session_id: &str) -> Result<()> {
        self.set_session_connection(session_id, ConnectionState::Disconnected)
    }

    fn set_session_connection(&self, session_id: &str, state: ConnectionState) -> Result<()> {
        let device = self
            .session_device(session_id)
            .ok_or_else(|| Error::invalid_state(format!("unknown session {session_id}")))?;
        debug!("Session {} on {}: {:?}", session_id, device.id(), state);
        device.set_connection(state)
    }

    /// Forward `line` to every session whose id appears in its text.
    ///
    /// A line naming a session counts as its app reporting in. Never
    /// blocks: a full session queue drops the line with a warning.
    /// Returns the number of sessions the line was delivered to.
    pub fn route_log_line(&self, line: LogLine) -> usize {
        let sessions = self.lock_sessions();
        let mut delivered = 0;

        for (session_id, session) in sessions.iter() {
            if !line.text.contains(session_id.as_str()) {
                continue;
            }

            if !session.device.state().is_connected() {
                if let Err(e) = session.device.set_connection(ConnectionState::Connected) {
                    debug!("Session {}: {}", session_id, e);
                }
            }

            match session.logs.try_send(line.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Session {}: log queue full, dropping line", session_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Session {}: nobody reads its logs", session_id);
                }
            }
        }

        if delivered == 0 {
            debug!("Unrouted log line from {}: {}", line.sender, line.text.trim_end());
        }
        delivered
    }
}

fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Wait until the app on `device` reports in, for at most `limit`.
///
/// Local devices are observed through their state channel. Remote devices
/// are also polled, since their app may report to the node instead.
async fn wait_for_connection(device: &Device, limit: Duration) -> Result<()> {
    let deadline = Instant::now() + limit;

    loop {
        if device.is_app_connected().await {
            if !device.state().is_connected() {
                device.set_connection(ConnectionState::Connected)?;
            }
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::connection_timeout(device.id(), limit));
        }

        let step = if device.driver().is_remote() {
            (deadline - now).min(CONNECTION_POLL_INTERVAL)
        } else {
            deadline - now
        };
        if device.wait_connected(step).await.is_ok() {
            return Ok(());
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use hub_device::drivers::macos::HOST_DEVICE_ID;
    use hub_device::test_utils::{localhost, sleeping_app};

    async fn coordinator() -> Arc<SessionCoordinator> {
        let manager = Arc::new(DeviceManager::macos(localhost()));
        manager.refresh_devices().await.unwrap();
        let coordinator = Arc::new(SessionCoordinator::new(localhost()));
        coordinator.register_manager(manager).await;
        coordinator
    }

    /// Plays the app: reports in as soon as a session exists
    fn auto_connect(coordinator: &Arc<SessionCoordinator>) -> tokio::task::JoinHandle<String> {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            loop {
                if let Some(id) = coordinator.active_sessions().into_iter().next() {
                    coordinator.app_connected(&id).unwrap();
                    return id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    fn line(text: &str) -> LogLine {
        LogLine {
            text: text.to_string(),
            sender: "127.0.0.1:50000".parse().unwrap(),
            received_at: chrono::Local::now(),
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let coordinator = coordinator().await;
        let (_dir, app) = sleeping_app();

        let connector = auto_connect(&coordinator);
        let mut handle = coordinator
            .start_session(SessionRequest::new(app))
            .await
            .unwrap();
        assert_eq!(connector.await.unwrap(), handle.session_id);
        assert_eq!(handle.device.id(), HOST_DEVICE_ID);
        assert!(handle.device.state().is_connected());

        let text = format!("{}: test passed", handle.session_id);
        assert_eq!(coordinator.route_log_line(line(&text)), 1);
        assert_eq!(handle.logs.recv().await.unwrap().text, text);

        coordinator.stop_session(&handle.session_id).await.unwrap();
        assert!(coordinator.active_sessions().is_empty());
        assert!(!handle.device.is_busy().await);
        assert!(!handle.device.state().is_connected());
    }

    #[tokio::test]
    async fn test_connection_timeout_releases_device() {
        let manager = Arc::new(DeviceManager::macos(localhost()));
        manager.refresh_devices().await.unwrap();
        let coordinator = SessionCoordinator::new(localhost())
            .with_max_connection_wait(Some(Duration::from_millis(100)));
        coordinator.register_manager(manager.clone()).await;
        let (_dir, app) = sleeping_app();

        let err = coordinator
            .start_session(SessionRequest::new(app))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ConnectionTimeout { .. }));
        assert!(err.to_string().contains("failed to connect within timeout"));
        assert!(coordinator.active_sessions().is_empty());
        let device = manager.get_device(HOST_DEVICE_ID).await.unwrap();
        assert!(!device.is_busy().await);
    }

    #[tokio::test]
    async fn test_busy_device_rejects_second_session() {
        let coordinator = coordinator().await;
        let (_dir, app) = sleeping_app();

        let connector = auto_connect(&coordinator);
        let first = coordinator
            .start_session(SessionRequest::new(app.clone()).on_device(HOST_DEVICE_ID))
            .await
            .unwrap();
        connector.await.unwrap();

        let err = coordinator
            .start_session(SessionRequest::new(app).on_device(HOST_DEVICE_ID))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionConflict { .. }));
        assert_eq!(coordinator.active_sessions(), vec![first.session_id.clone()]);
        assert_eq!(
            first.device.active_session().await.as_deref(),
            Some(first.session_id.as_str())
        );

        coordinator.stop_session(&first.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_device_and_session() {
        let coordinator = coordinator().await;
        let (_dir, app) = sleeping_app();

        let err = coordinator
            .start_session(SessionRequest::new(app).on_device("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound { .. }));

        assert!(coordinator.stop_session("nope").await.is_err());
        assert!(coordinator.app_connected("nope").is_err());
    }

    #[tokio::test]
    async fn test_unmatched_line_is_not_delivered() {
        let coordinator = coordinator().await;
        assert_eq!(coordinator.route_log_line(line("nobody: hello")), 0);
    }

    #[tokio::test]
    async fn test_unregister_releases_sessions() {
        let coordinator = coordinator().await;
        let (_dir, app) = sleeping_app();

        let connector = auto_connect(&coordinator);
        let handle = coordinator
            .start_session(SessionRequest::new(app.clone()))
            .await
            .unwrap();
        connector.await.unwrap();

        assert!(coordinator.unregister_manager("macos").await);
        assert!(coordinator.active_sessions().is_empty());
        assert!(!coordinator.unregister_manager("macos").await);

        // The process is still owned by the device; stop it directly
        handle.device.stop_app(&app).await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_instance_spares_same_named_replacement() {
        let coordinator = coordinator().await;
        let replaced = coordinator.managers().await.remove(0);

        let replacement = Arc::new(DeviceManager::macos(localhost()));
        assert!(coordinator.unregister_manager("macos").await);
        coordinator.register_manager(replacement.clone()).await;

        assert!(!coordinator.unregister_manager_instance(&replaced).await);
        let managers = coordinator.managers().await;
        assert_eq!(managers.len(), 1);
        assert!(Arc::ptr_eq(&managers[0], &replacement));

        assert!(coordinator.unregister_manager_instance(&replacement).await);
        assert!(coordinator.managers().await.is_empty());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.len(), SESSION_ID_LEN);
        assert_ne!(a, b);
    }
}
