//! CMS backend integration.
//!
//! Four cooperating pieces, each owning its own task or lock:
//!
//! - [`transport`]: the wire protocol. A [`CmsTransport`] trait with a
//!   reqwest-backed [`HttpCms`] implementation; everything above it is
//!   transport-agnostic and tested against mocks.
//! - [`auth`]: [`RemoteAuthSession`], the only writer of the persisted token
//!   record. Single-flight, refresh-then-password fallback.
//! - [`scheduler`]: [`ContentScheduler`], registration plus heartbeat and
//!   schedule-poll timers.
//! - [`renderer`]: [`ContentRenderer`], dual-surface crossfade presentation.
//! - [`connectivity`]: [`ConnectivityMonitor`], reachability polling and
//!   reload-on-reconnect.

pub mod auth;
pub mod connectivity;
pub mod renderer;
pub mod scheduler;
pub mod transport;

pub use auth::{AuthState, RemoteAuthSession};
pub use connectivity::{ConnectivityMonitor, ConnectivityOptions, Reachability};
pub use renderer::{
    ContentLoader, ContentRenderer, ContentSurface, RendererEvent, RendererOptions, SurfacePair,
};
pub use scheduler::{CmsEvent, ContentScheduler, SchedulerOptions};
pub use transport::{
    CmsTransport, HttpCms, RegisterRequest, RegisterResponse, ScheduleResponse, StatusReport,
    TokenGrant, TokenResponse,
};
