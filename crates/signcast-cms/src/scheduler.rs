//! Display registration and content scheduling.
//!
//! The scheduler gates everything behind registration: until the CMS has
//! acknowledged this display, no heartbeat or schedule traffic is sent.
//! Registration retries indefinitely; a signage display's only job is to
//! come up on the network eventually.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use signcast_core::{DisplayStatus, OverlaySettings, SettingsStore};

use crate::renderer::ContentLoader;
use crate::transport::{CmsTransport, RegisterRequest, StatusReport};

// MARK: - Events

/// Backend-facing events, consumed by the coordinator.
#[derive(Debug, Clone)]
pub enum CmsEvent {
    DisplayRegistered(String),
    DisplayError(String),
    LayoutChanged(String),
    ConnectionStateChanged(bool),
}

// MARK: - Options

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Delay between registration attempts. Retries never give up.
    pub register_retry: Duration,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            register_retry: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(300),
        }
    }
}

// MARK: - ContentScheduler

enum Cmd {
    ForceUpdate,
}

/// Handle to the scheduler task. Cheap to clone.
#[derive(Clone)]
pub struct ContentScheduler {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    abort: tokio::task::AbortHandle,
}

impl ContentScheduler {
    pub fn spawn(
        transport: Arc<dyn CmsTransport>,
        store: Arc<dyn SettingsStore>,
        loader: Arc<dyn ContentLoader>,
        settings: OverlaySettings,
        options: SchedulerOptions,
        events: mpsc::UnboundedSender<CmsEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let runner = Runner {
            transport,
            store,
            loader,
            settings,
            options,
            events,
            status: DisplayStatus::Pending,
            current_layout: None,
        };
        let task = tokio::spawn(runner.run(cmd_rx));
        Self { cmd_tx, abort: task.abort_handle() }
    }

    /// Skip the poll interval and check the schedule now.
    pub fn force_update(&self) {
        let _ = self.cmd_tx.send(Cmd::ForceUpdate);
    }

    pub fn stop(&self) {
        self.abort.abort();
    }
}

// MARK: - Runner

struct Runner {
    transport: Arc<dyn CmsTransport>,
    store: Arc<dyn SettingsStore>,
    loader: Arc<dyn ContentLoader>,
    settings: OverlaySettings,
    options: SchedulerOptions,
    events: mpsc::UnboundedSender<CmsEvent>,
    status: DisplayStatus,
    current_layout: Option<String>,
}

impl Runner {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
        let Some(display_id) = self.ensure_registered(&mut cmd_rx).await else {
            return;
        };

        // Re-show whatever was on screen before the restart while the first
        // schedule check is in flight.
        self.current_layout = self.store.state().last_content_id;
        if let Some(id) = self.current_layout.clone() {
            info!("Resuming persisted layout {id}");
            if let Err(e) = self.loader.load(&id) {
                warn!("Failed to resume layout {id}: {e}");
            }
        }

        // First tick of each interval fires immediately, so a fresh start
        // reports status and fetches the schedule right away.
        let mut heartbeat = tokio::time::interval(self.options.heartbeat_interval);
        let mut poll = tokio::time::interval(self.options.poll_interval);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => self.send_status(&display_id).await,
                _ = poll.tick() => self.check_schedule(&display_id).await,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Cmd::ForceUpdate) => {
                        info!("Forced schedule check");
                        self.check_schedule(&display_id).await;
                    }
                    None => {
                        debug!("Scheduler task exiting");
                        return;
                    }
                }
            }
        }
    }

    /// Resolve the display id, registering with the CMS if this display has
    /// never been acknowledged. Returns `None` only on shutdown.
    async fn ensure_registered(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Cmd>,
    ) -> Option<String> {
        let state = self.store.state();
        if state.is_registered {
            if let Some(id) = state.display_id {
                info!("Display already registered as {id}");
                self.status = DisplayStatus::Running;
                return Some(id);
            }
        }

        let req = RegisterRequest {
            server_key: self.settings.server_key.clone(),
            hardware_key: self.settings.hardware_key.clone(),
            display_name: self.settings.display_name.clone(),
            client_type: "linux".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
        };
        loop {
            match self.transport.register(&req).await {
                Ok(resp) => {
                    let id = resp.display_id;
                    info!("Display registered as {id}");
                    self.store.update(&mut |s| {
                        s.display_id = Some(id.clone());
                        s.is_registered = true;
                    });
                    self.status = DisplayStatus::Running;
                    let _ = self.events.send(CmsEvent::DisplayRegistered(id.clone()));
                    return Some(id);
                }
                Err(e) => {
                    self.status = DisplayStatus::Error;
                    warn!(
                        "Registration failed ({e}); retrying in {:?}",
                        self.options.register_retry
                    );
                    let _ = self.events.send(CmsEvent::DisplayError(e.to_string()));
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.register_retry) => {}
                        cmd = cmd_rx.recv() => match cmd {
                            // A force-update while unregistered retries now.
                            Some(Cmd::ForceUpdate) => {}
                            None => return None,
                        }
                    }
                }
            }
        }
    }

    /// Best effort: a failed heartbeat is logged and the next interval tries
    /// again.
    async fn send_status(&self, display_id: &str) {
        let report = StatusReport {
            display_id: display_id.to_owned(),
            hardware_key: self.settings.hardware_key.clone(),
            current_layout_id: self.current_layout.clone(),
            status: self.status.code(),
        };
        if let Err(e) = self.transport.report_status(&report).await {
            warn!("Status report failed: {e}");
        }
    }

    /// Fetch the schedule and hand any newly assigned layout to the
    /// renderer. Failures keep the current content on screen.
    async fn check_schedule(&mut self, display_id: &str) {
        let schedule = match self
            .transport
            .fetch_schedule(display_id, &self.settings.hardware_key)
            .await
        {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!("Schedule check failed: {e}");
                return;
            }
        };

        let Some(id) = schedule.layout_id.filter(|id| !id.is_empty()) else {
            debug!("Nothing scheduled for this display");
            return;
        };
        if self.current_layout.as_deref() == Some(id.as_str()) {
            return;
        }

        info!("Scheduled layout changed: {:?} -> {id}", self.current_layout);
        self.current_layout = Some(id.clone());
        self.store.update(&mut |s| s.last_content_id = Some(id.clone()));
        if let Err(e) = self.loader.load(&id) {
            warn!("Failed to hand layout {id} to the renderer: {e}");
        }
        let _ = self.events.send(CmsEvent::LayoutChanged(id));
    }
}
