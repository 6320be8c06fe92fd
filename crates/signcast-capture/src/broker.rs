//! Render-target handoff between the window layer and the capture device.
//!
//! The overlay window may not exist yet when the capture device wants a
//! surface, and it can be torn down (rotation, shutdown) while a session is
//! live. The broker turns that into a request/fulfill/invalidate protocol:
//! requests resolve immediately when a target exists, otherwise they park
//! until the window manager supplies one; invalidation notifies every
//! registered listener so the device closes instead of writing to a dangling
//! surface.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

// MARK: - RenderTarget

/// Opaque drawable handle. The capture controller only ever references it;
/// ownership stays with whoever created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTarget {
    pub id: u64,
    pub kind: TargetKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Backed by the on-screen overlay window.
    Window,
    /// Throwaway target for headless diagnostic capture.
    Headless,
}

// MARK: - SurfaceBroker

struct Inner {
    target: Option<RenderTarget>,
    /// A window manager has declared itself the provider; headless fallback
    /// is disabled and requests defer instead.
    provider_attached: bool,
    waiters: Vec<oneshot::Sender<RenderTarget>>,
    lost_listeners: Vec<mpsc::UnboundedSender<()>>,
    next_headless_id: u64,
}

/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SurfaceBroker {
    inner: Arc<Mutex<Inner>>,
}

impl Default for SurfaceBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                target: None,
                provider_attached: false,
                waiters: Vec::new(),
                lost_listeners: Vec::new(),
                next_headless_id: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Declare that a window manager will supply targets. From this point
    /// requests defer rather than falling back to a headless target.
    pub fn attach_provider(&self) {
        self.lock().provider_attached = true;
    }

    /// Resolve a render target: the current one if present, a throwaway
    /// headless target if no provider is attached, otherwise parks until
    /// [`supply`](Self::supply) is called.
    pub async fn request_target(&self) -> RenderTarget {
        let rx = {
            let mut inner = self.lock();
            if let Some(target) = inner.target.clone() {
                return target;
            }
            if !inner.provider_attached {
                let id = inner.next_headless_id;
                inner.next_headless_id += 1;
                info!("No window manager attached; issuing headless target #{id}");
                return RenderTarget { id, kind: TargetKind::Headless };
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            rx
        };
        debug!("Render target not yet available; request parked");
        // The sender is only dropped if the broker itself is torn down while
        // a request is parked; re-park in that case is meaningless, so fall
        // back to a headless target.
        match rx.await {
            Ok(target) => target,
            Err(_) => RenderTarget { id: 0, kind: TargetKind::Headless },
        }
    }

    /// Fulfil parked requests and make `target` the current target.
    pub fn supply(&self, target: RenderTarget) {
        let mut inner = self.lock();
        debug!("Render target #{} supplied ({:?})", target.id, target.kind);
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(target.clone());
        }
        inner.target = Some(target);
    }

    /// The current target is gone (window torn down). Notifies every
    /// lost-listener; future requests defer or go headless again.
    pub fn invalidate(&self) {
        let mut inner = self.lock();
        if inner.target.take().is_some() {
            info!("Render target invalidated");
            inner.lost_listeners.retain(|tx| tx.send(()).is_ok());
        }
    }

    /// Subscribe to target-lost notifications.
    pub fn on_target_lost(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().lost_listeners.push(tx);
        rx
    }

    pub fn current(&self) -> Option<RenderTarget> {
        self.lock().target.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fulfills_immediately_when_target_exists() {
        let broker = SurfaceBroker::new();
        broker.attach_provider();
        broker.supply(RenderTarget { id: 7, kind: TargetKind::Window });

        let target = broker.request_target().await;
        assert_eq!(target.id, 7);
    }

    #[tokio::test]
    async fn defers_until_supplied() {
        let broker = SurfaceBroker::new();
        broker.attach_provider();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request_target().await })
        };
        tokio::task::yield_now().await;
        broker.supply(RenderTarget { id: 3, kind: TargetKind::Window });

        let target = waiter.await.expect("request task");
        assert_eq!(target.id, 3);
    }

    #[tokio::test]
    async fn headless_fallback_without_provider() {
        let broker = SurfaceBroker::new();
        let target = broker.request_target().await;
        assert_eq!(target.kind, TargetKind::Headless);
        // Throwaway: not retained as the current target.
        assert!(broker.current().is_none());
    }

    #[tokio::test]
    async fn invalidate_notifies_listeners_once() {
        let broker = SurfaceBroker::new();
        broker.attach_provider();
        broker.supply(RenderTarget { id: 1, kind: TargetKind::Window });

        let mut lost = broker.on_target_lost();
        broker.invalidate();
        assert!(lost.try_recv().is_ok());

        // Second invalidate with no current target is a no-op.
        broker.invalidate();
        assert!(lost.try_recv().is_err());
    }
}
