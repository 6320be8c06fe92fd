//! Component wiring and lifecycle coordination.
//!
//! The coordinator owns every component handle and is the single consumer of
//! their event channels. Components never call each other directly; capture,
//! window, and CMS layers meet only here and through the surface broker.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use signcast_capture::{CaptureController, CaptureEvent, CaptureOptions, CapturePlatform, SurfaceBroker};
use signcast_cms::{
    CmsEvent, CmsTransport, ConnectivityMonitor, ConnectivityOptions, ContentLoader,
    ContentRenderer, ContentScheduler, Reachability, RemoteAuthSession, RendererEvent,
    RendererOptions, SchedulerOptions, SurfacePair,
};
use signcast_core::{OverlaySettings, SettingsStore, SigncastError};
use signcast_window::{OverlayWindowManager, WindowHost};

// MARK: - Events

/// Host-side notifications fed into the coordinator (display rotation,
/// power state). Wired up by whatever platform shell embeds the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    DisplayGeometryChanged,
    ScreenOff,
    ScreenOn,
}

/// Unified lifecycle events, for observers outside the coordinator.
#[derive(Debug, Clone)]
pub enum AppEvent {
    CaptureStarted,
    CaptureStopped,
    CaptureError(String),
    LayoutLoaded(String),
    LayoutLoadFailed { id: String, reason: String },
    DisplayRegistered(String),
    DisplayError(String),
    ConnectionStateChanged(bool),
}

// MARK: - Deps

/// Everything the coordinator needs, injected so tests can swap any seam.
pub struct Deps {
    pub settings: OverlaySettings,
    pub store: Arc<dyn SettingsStore>,
    pub capture_platform: Arc<dyn CapturePlatform>,
    pub window_host: Arc<dyn WindowHost>,
    pub surfaces: SurfacePair,
    pub transport: Arc<dyn CmsTransport>,
    pub probe: Arc<dyn Reachability>,
    pub host_events: mpsc::UnboundedReceiver<HostEvent>,
    pub observer: mpsc::UnboundedSender<AppEvent>,
}

/// The hardware key identifies this physical unit to the CMS across
/// reinstalls. Configured value wins; otherwise one is generated once and
/// persisted.
fn resolve_hardware_key(settings: &OverlaySettings, store: &Arc<dyn SettingsStore>) -> String {
    if !settings.hardware_key.is_empty() {
        return settings.hardware_key.clone();
    }
    if let Some(key) = store.state().hardware_key {
        return key;
    }
    let key = Uuid::new_v4().to_string();
    info!("Generated hardware key {key}");
    store.update(&mut |s| s.hardware_key = Some(key.clone()));
    key
}

// MARK: - CMS stack

/// CMS seams held between construction and [`Coordinator::run`]. The stack
/// is started inside `run`, so a constructed coordinator performs no network
/// traffic until it is actually running.
struct CmsSeams {
    transport: Arc<dyn CmsTransport>,
    probe: Arc<dyn Reachability>,
    surfaces: SurfacePair,
    renderer_tx: mpsc::UnboundedSender<RendererEvent>,
    cms_tx: mpsc::UnboundedSender<CmsEvent>,
}

struct CmsStack {
    renderer: ContentRenderer,
    loader: Arc<dyn ContentLoader>,
    scheduler: ContentScheduler,
    monitor: ConnectivityMonitor,
}

impl CmsStack {
    fn start(settings: &OverlaySettings, store: &Arc<dyn SettingsStore>, seams: CmsSeams) -> Self {
        let CmsSeams { transport, probe, surfaces, renderer_tx, cms_tx } = seams;
        let auth = Arc::new(RemoteAuthSession::new(
            transport.clone(),
            store.clone(),
            settings.username.clone(),
            settings.password.clone(),
        ));
        let renderer = ContentRenderer::spawn(
            auth,
            transport.clone(),
            surfaces,
            RendererOptions { target_opacity: settings.opacity, ..Default::default() },
            renderer_tx,
        );
        let loader: Arc<dyn ContentLoader> = Arc::new(renderer.clone());
        let scheduler = ContentScheduler::spawn(
            transport,
            store.clone(),
            loader.clone(),
            settings.clone(),
            SchedulerOptions::default(),
            cms_tx.clone(),
        );
        let monitor = ConnectivityMonitor::spawn(
            probe,
            store.clone(),
            loader.clone(),
            ConnectivityOptions::default(),
            cms_tx,
        );
        Self { renderer, loader, scheduler, monitor }
    }

    fn stop(&self) {
        self.scheduler.stop();
        self.monitor.stop();
        self.renderer.stop();
    }
}

// MARK: - Coordinator

pub struct Coordinator {
    settings: OverlaySettings,
    store: Arc<dyn SettingsStore>,
    window: OverlayWindowManager,
    capture: CaptureController,
    seams: Option<CmsSeams>,
    cms: Option<CmsStack>,
    observer: mpsc::UnboundedSender<AppEvent>,
    capture_events: mpsc::UnboundedReceiver<CaptureEvent>,
    renderer_events: mpsc::UnboundedReceiver<RendererEvent>,
    cms_events: mpsc::UnboundedReceiver<CmsEvent>,
    host_events: mpsc::UnboundedReceiver<HostEvent>,
}

impl Coordinator {
    pub fn new(deps: Deps) -> Self {
        let Deps {
            mut settings,
            store,
            capture_platform,
            window_host,
            surfaces,
            transport,
            probe,
            host_events,
            observer,
        } = deps;

        settings.hardware_key = resolve_hardware_key(&settings, &store);

        let broker = SurfaceBroker::new();
        let window = OverlayWindowManager::new(
            window_host,
            broker.clone(),
            store.clone(),
            settings.clone(),
        );

        let (capture_tx, capture_events) = mpsc::unbounded_channel();
        let capture = CaptureController::spawn(
            capture_platform,
            broker,
            CaptureOptions {
                preferred_device_id: settings.capture_device_id.clone(),
                requested_size: settings.requested_size,
                ..Default::default()
            },
            capture_tx,
        );

        let (renderer_tx, renderer_events) = mpsc::unbounded_channel();
        let (cms_tx, cms_events) = mpsc::unbounded_channel();
        let seams = if settings.cms_enabled && !settings.cms_url.trim().is_empty() {
            Some(CmsSeams { transport, probe, surfaces, renderer_tx, cms_tx })
        } else {
            info!("CMS integration disabled; running capture-only");
            None
        };

        Self {
            settings,
            store,
            window,
            capture,
            seams,
            cms: None,
            observer,
            capture_events,
            renderer_events,
            cms_events,
            host_events,
        }
    }

    /// Bring everything up, then pump events until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.window.show().map_err(|e| anyhow::anyhow!("overlay window: {e}"))?;
        self.capture.open();
        if let Some(seams) = self.seams.take() {
            self.cms = Some(CmsStack::start(&self.settings, &self.store, seams));
        }
        info!(
            "Signcast running: device {:?}, requested {}",
            self.settings.capture_device_id, self.settings.requested_size
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(ev) = self.capture_events.recv() => self.on_capture_event(ev),
                Some(ev) = self.renderer_events.recv() => self.on_renderer_event(ev),
                Some(ev) = self.cms_events.recv() => self.on_cms_event(ev),
                Some(ev) = self.host_events.recv() => self.on_host_event(ev),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.observer.send(event);
    }

    fn on_capture_event(&self, event: CaptureEvent) {
        match event {
            CaptureEvent::Started => {
                info!("Capture started");
                self.emit(AppEvent::CaptureStarted);
            }
            CaptureEvent::Stopped => {
                info!("Capture stopped");
                self.emit(AppEvent::CaptureStopped);
            }
            CaptureEvent::Error(detail) => {
                warn!("Capture error: {detail}");
                self.emit(AppEvent::CaptureError(detail));
            }
        }
    }

    fn on_renderer_event(&self, event: RendererEvent) {
        match event {
            RendererEvent::LayoutLoaded(id) => self.emit(AppEvent::LayoutLoaded(id)),
            RendererEvent::LayoutLoadFailed { id, reason } => {
                warn!("Layout {id} failed terminally: {reason}");
                self.emit(AppEvent::LayoutLoadFailed { id, reason });
            }
        }
    }

    fn on_cms_event(&self, event: CmsEvent) {
        match event {
            CmsEvent::DisplayRegistered(id) => self.emit(AppEvent::DisplayRegistered(id)),
            CmsEvent::DisplayError(detail) => self.emit(AppEvent::DisplayError(detail)),
            CmsEvent::LayoutChanged(id) => info!("Schedule assigned layout {id}"),
            CmsEvent::ConnectionStateChanged(online) => {
                self.emit(AppEvent::ConnectionStateChanged(online));
            }
        }
    }

    fn on_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::DisplayGeometryChanged => match self.window.on_display_geometry_changed() {
                // The window was recreated: the capture session saw its
                // target invalidated and must reopen, and content reloads
                // into the fresh geometry.
                Ok(true) => {
                    self.capture.open();
                    self.reload_current_layout();
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to recreate overlay window: {e}"),
            },
            HostEvent::ScreenOff => self.window.on_screen_off(),
            HostEvent::ScreenOn => {
                if let Err(e) = self.window.on_screen_on() {
                    warn!("Failed to restore overlay window: {e}");
                } else if self.window.is_visible() {
                    self.capture.open();
                }
            }
        }
    }

    fn reload_current_layout(&self) {
        let (Some(cms), Some(id)) = (&self.cms, self.store.state().last_content_id) else {
            return;
        };
        if let Err(e) = cms.loader.load(&id) {
            match e {
                SigncastError::InvalidContentId => {}
                e => warn!("Failed to reload layout {id}: {e}"),
            }
        }
    }

    /// Orderly teardown: timers and loads first, then the device, then the
    /// window. Nothing here blocks on the network.
    async fn shutdown(mut self) {
        info!("Shutting down");
        if let Some(cms) = &self.cms {
            cms.stop();
        }
        self.capture.close().await;
        // The event loop has exited; forward the teardown notifications it
        // will no longer pump.
        while let Ok(ev) = self.capture_events.try_recv() {
            self.on_capture_event(ev);
        }
        self.window.hide();
        info!("Shutdown complete");
    }
}
