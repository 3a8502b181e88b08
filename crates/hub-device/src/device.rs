//! Device handle shared by managers, the session layer and the node service.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use hub_core::prelude::*;
use hub_core::{
    AppParameter, ConnectionState, DeviceInfo, DeviceState, LifecycleState, Platform,
};

use crate::driver::{Driver, Recording};
use crate::process::LaunchedProcess;

/// How long an interrupted app process gets before it is killed
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// The one running app session a device may hold
#[derive(Debug)]
struct AppSession {
    session_id: String,
    app: AppParameter,
    process: Option<LaunchedProcess>,
}

impl AppSession {
    /// A session whose launch process already ended holds nothing anymore
    fn is_finished(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.has_exited())
    }
}

/// One controllable device.
///
/// Metadata is fixed at discovery. State lives in a `watch` channel so
/// lifecycle and connection change together and observers can await a
/// transition. The running session (and its process) is owned here and
/// nowhere else.
#[derive(Debug)]
pub struct Device {
    info: DeviceInfo,
    state_tx: watch::Sender<DeviceState>,
    driver: Driver,
    session: Mutex<Option<AppSession>>,
    recording: Mutex<Option<Recording>>,
}

impl Device {
    pub fn new(info: DeviceInfo, lifecycle: LifecycleState, driver: Driver) -> Self {
        let (state_tx, _) = watch::channel(DeviceState {
            lifecycle,
            connection: ConnectionState::Disconnected,
        });
        Self {
            info,
            state_tx,
            driver,
            session: Mutex::new(None),
            recording: Mutex::new(None),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Identity & state
    // ─────────────────────────────────────────────────────────────

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn ip_address(&self) -> IpAddr {
        self.info.ip_address
    }

    pub fn platform(&self) -> Platform {
        self.info.platform
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn state(&self) -> DeviceState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.state_tx.subscribe()
    }

    /// Set the lifecycle state. Leaving `Booted` drops the connection.
    ///
    /// Returns `true` if the state changed.
    pub(crate) fn set_lifecycle(&self, lifecycle: LifecycleState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if state.lifecycle == lifecycle {
                return false;
            }
            state.lifecycle = lifecycle;
            if lifecycle != LifecycleState::Booted {
                state.connection = ConnectionState::Disconnected;
            }
            true
        })
    }

    /// Record whether the app under test has reported in.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when marking a device connected that is not booted.
    pub fn set_connection(&self, connection: ConnectionState) -> Result<()> {
        let mut refused = false;
        self.state_tx.send_if_modified(|state| {
            if connection == ConnectionState::Connected && !state.is_booted() {
                refused = true;
                return false;
            }
            if state.connection == connection {
                return false;
            }
            state.connection = connection;
            true
        });

        if refused {
            return Err(Error::invalid_state(format!(
                "device {} cannot connect while {}",
                self.info.id,
                self.state().lifecycle
            )));
        }
        Ok(())
    }

    /// Wait until the app reports in, for at most `limit`
    pub async fn wait_connected(&self, limit: Duration) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        let outcome = tokio::time::timeout(limit, rx.wait_for(|s| s.is_connected()))
            .await
            .map(|r| r.is_ok());

        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::ChannelClosed),
            Err(_) => Err(Error::connection_timeout(&self.info.id, limit)),
        }
    }

    /// Whether the app under test is connected. Remote devices also ask
    /// their node.
    pub async fn is_app_connected(&self) -> bool {
        if self.state().is_connected() {
            return true;
        }
        match &self.driver {
            Driver::Remote(remote) => remote.is_connected(&self.info).await.unwrap_or(false),
            _ => false,
        }
    }

    /// Session id of the running app, if any
    pub async fn active_session(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| !s.is_finished())
            .map(|s| s.session_id.clone())
    }

    pub async fn is_busy(&self) -> bool {
        self.active_session().await.is_some()
    }

    // ─────────────────────────────────────────────────────────────
    // App lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Pure query; `false` when the platform cannot confirm
    pub async fn is_app_installed(&self, app: &AppParameter) -> bool {
        self.driver.is_app_installed(&self.info, app).await
    }

    /// Installing an installed app succeeds. Device state is untouched
    /// whatever the outcome.
    pub async fn install_app(&self, app: &AppParameter) -> Result<()> {
        info!("Installing {} on {}", app.identifier, self.info.id);
        self.driver.install_app(&self.info, app).await
    }

    /// Uninstalling an absent app succeeds
    pub async fn uninstall_app(&self, app_id: &str) -> Result<()> {
        if !self.driver.is_remote() {
            let probe = AppParameter {
                identifier: app_id.to_string(),
                ..Default::default()
            };
            if self.platform() != Platform::MacOs && !self.is_app_installed(&probe).await {
                debug!("{} not installed on {}, nothing to remove", app_id, self.info.id);
                return Ok(());
            }
        }
        info!("Uninstalling {} from {}", app_id, self.info.id);
        self.driver.uninstall_app(&self.info, app_id).await
    }

    /// Launch `app` for `session_id`; the app reports to `host_ip`.
    ///
    /// # Errors
    ///
    /// [`Error::SessionConflict`] if a session is already running. The
    /// running session is left untouched.
    pub async fn start_app(
        &self,
        app: &AppParameter,
        session_id: &str,
        host_ip: IpAddr,
    ) -> Result<()> {
        let mut slot = self.session.lock().await;

        if let Some(active) = slot.as_ref() {
            if active.is_finished() {
                debug!(
                    "Reaping finished session {} on {}",
                    active.session_id, self.info.id
                );
                *slot = None;
            } else {
                return Err(Error::session_conflict(&self.info.id, &active.session_id));
            }
        }

        if !self.state().is_booted() {
            return Err(Error::invalid_state(format!(
                "cannot start {} on {}: device is {}",
                app.identifier,
                self.info.id,
                self.state().lifecycle
            )));
        }

        info!(
            "Starting {} on {} (session {})",
            app.identifier, self.info.id, session_id
        );
        let process = self
            .driver
            .launch(&self.info, app, session_id, host_ip)
            .await?;

        *slot = Some(AppSession {
            session_id: session_id.to_string(),
            app: app.clone(),
            process,
        });
        Ok(())
    }

    /// Stop the running app.
    ///
    /// The session handle is released before anything can fail, so a
    /// process that refuses to die never blocks the next session. The
    /// process is interrupted, given [`STOP_GRACE`], then killed; the first
    /// failure is returned after cleanup.
    pub async fn stop_app(&self, app: &AppParameter) -> Result<()> {
        let session = self.session.lock().await.take();
        if let Err(e) = self.set_connection(ConnectionState::Disconnected) {
            debug!("Disconnect on stop: {}", e);
        }

        let mut result = Ok(());
        let app = match session {
            Some(mut session) => {
                info!(
                    "Stopping {} on {} (session {})",
                    session.app.identifier, self.info.id, session.session_id
                );
                if let Some(process) = session.process.as_mut() {
                    if let Err(e) = process.terminate(STOP_GRACE).await {
                        warn!("App process on {} did not stop cleanly: {}", self.info.id, e);
                        result = Err(e);
                    }
                }
                session.app
            }
            None => {
                debug!("No running session on {}", self.info.id);
                app.clone()
            }
        };

        let stop = self.driver.stop_app(&self.info, &app).await;
        result.and(stop)
    }

    /// Budget for the app to report in after `start_app`
    pub async fn connection_timeout(&self) -> Duration {
        self.driver.connection_timeout(&self.info).await
    }

    // ─────────────────────────────────────────────────────────────
    // Recording
    // ─────────────────────────────────────────────────────────────

    /// Start recording into `<path>.mp4`. A no-op on platforms that cannot record.
    pub async fn start_recording(&self, path: &Path) -> Result<()> {
        let mut slot = self.recording.lock().await;
        if slot.is_some() {
            return Err(Error::invalid_state(format!(
                "device {} is already recording",
                self.info.id
            )));
        }
        *slot = self.driver.start_recording(&self.info, path).await?;
        Ok(())
    }

    /// Stop the current recording, if there is one
    pub async fn stop_recording(&self) -> Result<()> {
        let recording = self.recording.lock().await.take();
        match recording {
            Some(recording) => self.driver.stop_recording(&self.info, recording).await,
            None => Ok(()),
        }
    }
}
