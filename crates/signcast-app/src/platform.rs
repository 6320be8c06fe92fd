//! Host-side implementations of the platform seams.
//!
//! The capture, window, and surface traits are driver territory; until a
//! target's native backend is linked in, these stand-ins keep the full
//! pipeline running end to end (useful headless and in soak tests). The
//! reachability probe is real.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use signcast_capture::{
    CapturePlatform, DeviceEvent, DeviceInfo, DeviceSession, RenderTarget, TargetKind,
};
use signcast_cms::transport::mask_token;
use signcast_cms::{ContentSurface, Reachability};
use signcast_core::{Size, SigncastError, WindowGeometry};
use signcast_window::{WindowFlags, WindowHandle, WindowHost};

// MARK: - NullCapturePlatform

/// Presents one external HDMI bridge device and swallows frames.
pub struct NullCapturePlatform;

struct NullSession {
    // Held so the controller's event queue stays open for the session's
    // lifetime.
    _event_tx: mpsc::Sender<DeviceEvent>,
    stopped: bool,
}

#[async_trait]
impl CapturePlatform for NullCapturePlatform {
    async fn enumerate(&self) -> Vec<DeviceInfo> {
        vec![DeviceInfo {
            id: "hdmi0".into(),
            external: true,
            supported_sizes: vec![Size::FHD, Size::HD],
        }]
    }

    async fn open(
        &self,
        id: &str,
    ) -> Result<(Box<dyn DeviceSession>, mpsc::Receiver<DeviceEvent>), SigncastError> {
        info!("Opening capture device {id} (null backend)");
        let (event_tx, event_rx) = mpsc::channel(8);
        Ok((Box::new(NullSession { _event_tx: event_tx, stopped: false }), event_rx))
    }
}

#[async_trait]
impl DeviceSession for NullSession {
    async fn configure(&mut self, target: &RenderTarget, size: Size) -> Result<(), SigncastError> {
        debug!("Null session configured: target #{} at {size}", target.id);
        Ok(())
    }

    async fn start_stream(&mut self) -> Result<(), SigncastError> {
        info!("Null session streaming (frames discarded)");
        Ok(())
    }

    async fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            info!("Null session stopped");
        }
    }
}

// MARK: - HeadlessWindowHost

/// Window host with no compositor behind it. Geometry is tracked and logged;
/// render targets are real broker currency.
pub struct HeadlessWindowHost {
    screen: Size,
    next_id: AtomicU64,
}

impl HeadlessWindowHost {
    pub fn new(screen: Size) -> Self {
        Self { screen, next_id: AtomicU64::new(1) }
    }
}

impl WindowHost for HeadlessWindowHost {
    fn screen_size(&self) -> Size {
        self.screen
    }

    fn create(
        &self,
        geometry: WindowGeometry,
        flags: WindowFlags,
    ) -> Result<(WindowHandle, RenderTarget), SigncastError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Headless window #{id}: {}×{} at ({}, {}), focusable={}",
            geometry.width, geometry.height, geometry.x, geometry.y, !flags.not_focusable
        );
        Ok((WindowHandle(id), RenderTarget { id, kind: TargetKind::Window }))
    }

    fn update_geometry(&self, window: &WindowHandle, x: i32, y: i32) -> Result<(), SigncastError> {
        debug!("Headless window #{} moved to ({x}, {y})", window.0);
        Ok(())
    }

    fn destroy(&self, window: WindowHandle) {
        debug!("Headless window #{} destroyed", window.0);
    }
}

// MARK: - LogSurface

/// Content surface that records what it would display. The production
/// surface is a webview; this one reports ready immediately.
#[derive(Default)]
pub struct LogSurface {
    name: &'static str,
}

impl LogSurface {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        (Arc::new(Self { name: "surface-a" }), Arc::new(Self { name: "surface-b" }))
    }
}

#[async_trait]
impl ContentSurface for LogSurface {
    async fn load(&self, url: &str) -> Result<(), SigncastError> {
        info!("{}: loading {}", self.name, mask_token(url));
        Ok(())
    }

    fn set_opacity(&self, opacity: f32) {
        debug!("{}: opacity {opacity:.2}", self.name);
    }

    fn blank(&self) {
        debug!("{}: blanked", self.name);
    }

    fn show_fallback(&self, message: &str) {
        info!("{}: showing fallback: {message}", self.name);
    }
}

// MARK: - HttpProbe

/// Reachability check against the CMS itself. Any HTTP answer counts; only
/// transport failures mean offline.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Result<Self, SigncastError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SigncastError::Backend { reason: e.to_string() })?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Reachability for HttpProbe {
    async fn is_reachable(&self) -> bool {
        self.client.get(&self.url).send().await.is_ok()
    }
}
