//! Host-platform capture primitives.
//!
//! The controller never talks to a driver directly; it goes through
//! [`CapturePlatform`] so the whole state machine can run against a mock in
//! tests and against the real bridge driver in production.

use async_trait::async_trait;
use tokio::sync::mpsc;

use signcast_core::{Size, SigncastError};

use crate::broker::RenderTarget;

// MARK: - DeviceInfo

/// One enumerated capture device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    /// Driver flags this as an external source (the HDMI bridge presents
    /// itself this way).
    pub external: bool,
    pub supported_sizes: Vec<Size>,
}

// MARK: - DeviceEvent

/// Asynchronous device-state notification posted by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Disconnected,
    Error(i32),
}

// MARK: - Platform traits

#[async_trait]
pub trait CapturePlatform: Send + Sync + 'static {
    /// List capture devices with their capabilities.
    async fn enumerate(&self) -> Vec<DeviceInfo>;

    /// Open a device. Returns the session plus the driver's event queue.
    async fn open(
        &self,
        id: &str,
    ) -> Result<(Box<dyn DeviceSession>, mpsc::Receiver<DeviceEvent>), SigncastError>;
}

/// An open device. Dropped or [`stop`](DeviceSession::stop)ped sessions
/// release the underlying hardware. The controller task holds the session
/// across awaits, so implementations must be `Sync` as well as `Send`.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Bind the render target and the negotiated output size.
    async fn configure(&mut self, target: &RenderTarget, size: Size) -> Result<(), SigncastError>;

    /// Begin continuous capture into the bound target.
    async fn start_stream(&mut self) -> Result<(), SigncastError>;

    /// Stop the stream and release the device. Idempotent.
    async fn stop(&mut self);
}
