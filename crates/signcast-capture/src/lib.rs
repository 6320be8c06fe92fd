//! Capture-device lifecycle for the Signcast overlay.
//!
//! The physical source is an HDMI→MIPI bridge exposed as a camera-like
//! device. This crate owns the open/configure/stream/retry state machine and
//! the broker that hands a render target from the window layer to the device.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──open()──► Opening ──► Configuring ──► Streaming
//!                    ▲                            │
//!                    │ retry (≤3, 3s delay)       │ disconnect / error
//!                    └──── Disconnected/Error ◄───┘
//!                                 │ bound exhausted
//!                                 ▼
//!                              Stopped (terminal)
//! ```
//!
//! Device notifications arrive on a single-consumer queue; the controller
//! processes one event at a time, so ordering is preserved without locks.

pub mod broker;
pub mod controller;
pub mod platform;
pub mod size;

pub use broker::{RenderTarget, SurfaceBroker, TargetKind};
pub use controller::{CaptureController, CaptureEvent, CaptureOptions, CaptureState};
pub use platform::{CapturePlatform, DeviceEvent, DeviceInfo, DeviceSession};
pub use size::choose_optimal_size;
