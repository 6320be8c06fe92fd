//! Content presentation on a pair of alternating surfaces.
//!
//! New content always loads into the off-screen standby surface; only once it
//! signals ready does a timed crossfade bring it on screen, so the viewer
//! never sees a blank or half-loaded frame. After the fade the roles swap and
//! the now-hidden surface is blanked to release its resources.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use signcast_core::SigncastError;

use crate::auth::RemoteAuthSession;
use crate::transport::{mask_token, CmsTransport};

/// Opacity interpolation granularity for the crossfade.
const FADE_STEPS: u32 = 20;

/// Shown in the active surface when content cannot be loaded.
const FALLBACK_MESSAGE: &str = "Content temporarily unavailable";

// MARK: - ContentSurface

/// One of the two render surfaces (a webview in production). `load` resolves
/// when the content signals ready, not merely when navigation starts.
#[async_trait]
pub trait ContentSurface: Send + Sync + 'static {
    async fn load(&self, url: &str) -> Result<(), SigncastError>;

    /// 0.0 (invisible) ..= 1.0 (opaque).
    fn set_opacity(&self, opacity: f32);

    /// Release the surface's content; it stays allocated for the next load.
    fn blank(&self);

    /// Replace whatever is showing with locally rendered fallback content.
    fn show_fallback(&self, message: &str);
}

// MARK: - SurfacePair

/// Active/standby role assignment over two surfaces.
pub struct SurfacePair {
    pub active: Arc<dyn ContentSurface>,
    pub standby: Arc<dyn ContentSurface>,
}

impl SurfacePair {
    pub fn new(active: Arc<dyn ContentSurface>, standby: Arc<dyn ContentSurface>) -> Self {
        active.set_opacity(1.0);
        standby.set_opacity(0.0);
        Self { active, standby }
    }

    fn swap(&mut self) {
        std::mem::swap(&mut self.active, &mut self.standby);
    }
}

// MARK: - ContentLoader

/// Seam between the scheduler/connectivity layers and the renderer. Lets
/// those components be tested without standing up surfaces.
pub trait ContentLoader: Send + Sync + 'static {
    fn load(&self, content_id: &str) -> Result<(), SigncastError>;
}

// MARK: - ContentRenderer

#[derive(Debug, Clone)]
pub enum RendererEvent {
    LayoutLoaded(String),
    LayoutLoadFailed { id: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct RendererOptions {
    /// Crossfade duration.
    pub transition: Duration,
    /// How long to wait for the content-ready signal per attempt.
    pub ready_timeout: Duration,
    pub retry_delay: Duration,
    /// Total attempts per content id before falling back.
    pub max_attempts: u32,
    /// Opacity the incoming surface fades up to.
    pub target_opacity: f32,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            transition: Duration::from_millis(800),
            ready_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
            max_attempts: 3,
            target_opacity: 1.0,
        }
    }
}

/// Handle to the renderer task. Cheap to clone.
#[derive(Clone)]
pub struct ContentRenderer {
    cmd_tx: mpsc::UnboundedSender<String>,
    abort: tokio::task::AbortHandle,
}

impl ContentRenderer {
    pub fn spawn(
        auth: Arc<RemoteAuthSession>,
        transport: Arc<dyn CmsTransport>,
        surfaces: SurfacePair,
        options: RendererOptions,
        events: mpsc::UnboundedSender<RendererEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let runner = Runner { auth, transport, surfaces, options, events };
        let task = tokio::spawn(runner.run(cmd_rx));
        Self { cmd_tx, abort: task.abort_handle() }
    }

    /// Abandon any in-flight load and stop the task.
    pub fn stop(&self) {
        self.abort.abort();
    }
}

impl ContentLoader for ContentRenderer {
    /// Queue a load. Requests arriving while a transition is running are
    /// deferred; of several deferred requests only the newest is honored.
    fn load(&self, content_id: &str) -> Result<(), SigncastError> {
        let id = content_id.trim();
        if id.is_empty() {
            return Err(SigncastError::InvalidContentId);
        }
        self.cmd_tx
            .send(id.to_owned())
            .map_err(|_| SigncastError::SurfaceUnavailable)
    }
}

// MARK: - Runner

struct Runner {
    auth: Arc<RemoteAuthSession>,
    transport: Arc<dyn CmsTransport>,
    surfaces: SurfacePair,
    options: RendererOptions,
    events: mpsc::UnboundedSender<RendererEvent>,
}

impl Runner {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<String>) {
        while let Some(mut id) = cmd_rx.recv().await {
            // Requests that queued up behind the previous transition collapse
            // to the newest one.
            while let Ok(next) = cmd_rx.try_recv() {
                debug!("Superseding queued load of {id} with {next}");
                id = next;
            }
            self.run_load(&id).await;
        }
        debug!("Content renderer task exiting");
    }

    async fn run_load(&mut self, id: &str) {
        let mut last_err = None;
        for attempt in 1..=self.options.max_attempts {
            match self.attempt(id).await {
                Ok(()) => {
                    info!("Layout {id} loaded (attempt {attempt})");
                    let _ = self.events.send(RendererEvent::LayoutLoaded(id.to_owned()));
                    return;
                }
                Err(e) => {
                    warn!(
                        "Layout {id} failed to load (attempt {attempt}/{}): {e}",
                        self.options.max_attempts
                    );
                    last_err = Some(e);
                    if attempt < self.options.max_attempts {
                        tokio::time::sleep(self.options.retry_delay).await;
                    }
                }
            }
        }
        let reason = last_err.map(|e| e.to_string()).unwrap_or_else(|| "unknown".into());
        let _ = self.events.send(RendererEvent::LayoutLoadFailed {
            id: id.to_owned(),
            reason,
        });
        self.surfaces.active.show_fallback(FALLBACK_MESSAGE);
    }

    async fn attempt(&mut self, id: &str) -> Result<(), SigncastError> {
        let token = self.auth.ensure_valid().await?;
        let url = self.transport.content_url(id, &token.access_token)?;
        info!("Loading layout {id} from {}", mask_token(&url));

        match timeout(self.options.ready_timeout, self.surfaces.standby.load(&url)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SigncastError::ContentLoadFailed {
                    id: id.to_owned(),
                    reason: "timed out waiting for content-ready signal".into(),
                })
            }
        }

        self.crossfade().await;
        self.surfaces.swap();
        self.surfaces.standby.blank();
        Ok(())
    }

    /// Interpolate the standby surface in and the active surface out over the
    /// configured transition.
    async fn crossfade(&self) {
        let step = self.options.transition / FADE_STEPS;
        for i in 1..=FADE_STEPS {
            let t = i as f32 / FADE_STEPS as f32;
            self.surfaces.standby.set_opacity(t * self.options.target_opacity);
            self.surfaces.active.set_opacity((1.0 - t) * self.options.target_opacity);
            tokio::time::sleep(step).await;
        }
    }
}
