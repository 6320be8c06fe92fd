use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use signcast_cms::{HttpCms, SurfacePair};
use signcast_core::{FileStore, OverlaySettings, SettingsStore};

mod app;
mod platform;

use app::{AppEvent, Coordinator, Deps, HostEvent};
use platform::{HeadlessWindowHost, HttpProbe, LogSurface, NullCapturePlatform};

const DEFAULT_CONFIG_PATH: &str = "signcast.json";
const DEFAULT_STATE_PATH: &str = "signcast-state.json";

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=signcast_capture=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .init();

    info!("Signcast Display v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => {
            info!("Signcast exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}

fn load_settings() -> Result<OverlaySettings> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SIGNCAST_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());

    match std::fs::read_to_string(&path) {
        Ok(raw) => {
            let settings =
                serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
            info!("Configuration loaded from {path}");
            Ok(settings)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("No configuration at {path}; using defaults");
            Ok(OverlaySettings::default())
        }
        Err(e) => Err(e).with_context(|| format!("reading {path}")),
    }
}

async fn run() -> Result<()> {
    let settings = load_settings()?;

    let state_path =
        std::env::var("SIGNCAST_STATE").unwrap_or_else(|_| DEFAULT_STATE_PATH.into());
    let store: Arc<dyn SettingsStore> = Arc::new(FileStore::open(state_path));

    let cms_url = settings.normalized_cms_url();
    let transport = Arc::new(
        HttpCms::new(&cms_url, settings.client_id.clone(), settings.client_secret.clone())
            .context("CMS transport")?,
    );
    let probe = Arc::new(HttpProbe::new(cms_url).context("reachability probe")?);

    // Host event channel: kept open for the lifetime of the process so a
    // platform shell can feed rotation and power notifications in.
    let (_host_tx, host_events) = mpsc::unbounded_channel::<HostEvent>();

    let (observer, mut app_events) = mpsc::unbounded_channel::<AppEvent>();
    tokio::spawn(async move {
        while let Some(event) = app_events.recv().await {
            tracing::debug!("App event: {event:?}");
        }
    });

    let (surface_a, surface_b) = LogSurface::pair();
    let coordinator = Coordinator::new(Deps {
        settings,
        store,
        capture_platform: Arc::new(NullCapturePlatform),
        window_host: Arc::new(HeadlessWindowHost::new(signcast_core::Size::FHD)),
        surfaces: SurfacePair::new(surface_a, surface_b),
        transport,
        probe,
        host_events,
        observer,
    });

    coordinator
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupt received"),
                Err(e) => warn!("Failed to listen for interrupt: {e}"),
            }
        })
        .await
}
