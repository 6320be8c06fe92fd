//! Network reachability polling.
//!
//! Content keeps playing from the surface while the network is down; the
//! monitor's only recovery action is to reload the persisted layout once
//! connectivity returns, in case the outage left a stale or broken page on
//! screen.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use signcast_core::SettingsStore;

use crate::renderer::ContentLoader;
use crate::scheduler::CmsEvent;

// MARK: - Reachability

/// Probe for backend reachability. The production implementation issues a
/// cheap HTTP request against the CMS.
#[async_trait]
pub trait Reachability: Send + Sync + 'static {
    async fn is_reachable(&self) -> bool;
}

// MARK: - ConnectivityMonitor

#[derive(Debug, Clone)]
pub struct ConnectivityOptions {
    pub poll_interval: Duration,
}

impl Default for ConnectivityOptions {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(30) }
    }
}

/// Handle to the monitor task.
pub struct ConnectivityMonitor {
    abort: tokio::task::AbortHandle,
}

impl ConnectivityMonitor {
    pub fn spawn(
        probe: Arc<dyn Reachability>,
        store: Arc<dyn SettingsStore>,
        loader: Arc<dyn ContentLoader>,
        options: ConnectivityOptions,
        events: mpsc::UnboundedSender<CmsEvent>,
    ) -> Self {
        let task = tokio::spawn(Self::run(probe, store, loader, options, events));
        Self { abort: task.abort_handle() }
    }

    pub fn stop(&self) {
        self.abort.abort();
    }

    async fn run(
        probe: Arc<dyn Reachability>,
        store: Arc<dyn SettingsStore>,
        loader: Arc<dyn ContentLoader>,
        options: ConnectivityOptions,
        events: mpsc::UnboundedSender<CmsEvent>,
    ) {
        // Starting pessimistic means the first successful probe counts as a
        // reconnect and refreshes whatever survived the downtime.
        let mut connected = false;
        let mut ticker = tokio::time::interval(options.poll_interval);
        loop {
            ticker.tick().await;
            let now = probe.is_reachable().await;
            if now == connected {
                continue;
            }
            connected = now;
            info!("Connectivity changed: {}", if now { "online" } else { "offline" });
            let _ = events.send(CmsEvent::ConnectionStateChanged(now));

            if now {
                if let Some(id) = store.state().last_content_id {
                    debug!("Back online; reloading layout {id}");
                    if let Err(e) = loader.load(&id) {
                        warn!("Reload after reconnect failed: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    use signcast_core::{MemoryStore, PersistedState, SigncastError};

    use super::*;

    struct FlagProbe {
        reachable: AtomicBool,
    }

    #[async_trait]
    impl Reachability for FlagProbe {
        async fn is_reachable(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingLoader {
        loads: StdMutex<Vec<String>>,
    }

    impl ContentLoader for RecordingLoader {
        fn load(&self, content_id: &str) -> Result<(), SigncastError> {
            self.loads.lock().unwrap().push(content_id.to_owned());
            Ok(())
        }
    }

    fn store_with_layout(id: Option<&str>) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_state(PersistedState {
            last_content_id: id.map(Into::into),
            ..Default::default()
        }))
    }

    fn spawn_monitor(
        probe: Arc<FlagProbe>,
        store: Arc<MemoryStore>,
        loader: Arc<RecordingLoader>,
    ) -> (ConnectivityMonitor, mpsc::UnboundedReceiver<CmsEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let monitor = ConnectivityMonitor::spawn(
            probe,
            store,
            loader,
            ConnectivityOptions::default(),
            events_tx,
        );
        (monitor, events_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_reloads_the_persisted_layout_once() {
        let probe = Arc::new(FlagProbe { reachable: AtomicBool::new(false) });
        let loader = Arc::new(RecordingLoader::default());
        let (_monitor, mut events) =
            spawn_monitor(probe.clone(), store_with_layout(Some("6")), loader.clone());

        // Offline polls produce nothing: the baseline is already offline.
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(events.try_recv().is_err());
        assert!(loader.loads.lock().unwrap().is_empty());

        probe.reachable.store(true, Ordering::SeqCst);
        match events.recv().await {
            Some(CmsEvent::ConnectionStateChanged(true)) => {}
            other => panic!("unexpected event: {other:?}"),
        }

        // Exactly one reload, even across further online polls.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(*loader.loads.lock().unwrap(), vec!["6"]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_reports_but_never_reloads() {
        let probe = Arc::new(FlagProbe { reachable: AtomicBool::new(true) });
        let loader = Arc::new(RecordingLoader::default());
        let (_monitor, mut events) =
            spawn_monitor(probe.clone(), store_with_layout(Some("6")), loader.clone());

        // First poll flips the pessimistic baseline to online.
        match events.recv().await {
            Some(CmsEvent::ConnectionStateChanged(true)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        loader.loads.lock().unwrap().clear();

        probe.reachable.store(false, Ordering::SeqCst);
        match events.recv().await {
            Some(CmsEvent::ConnectionStateChanged(false)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(loader.loads.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_without_a_layout_loads_nothing() {
        let probe = Arc::new(FlagProbe { reachable: AtomicBool::new(true) });
        let loader = Arc::new(RecordingLoader::default());
        let (_monitor, mut events) =
            spawn_monitor(probe, store_with_layout(None), loader.clone());

        match events.recv().await {
            Some(CmsEvent::ConnectionStateChanged(true)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(loader.loads.lock().unwrap().is_empty());
    }
}
