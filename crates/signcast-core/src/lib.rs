pub mod config;
pub mod errors;
pub mod store;
pub mod types;

pub use config::OverlaySettings;
pub use errors::{AuthErrorKind, SigncastError};
pub use store::{FileStore, MemoryStore, PersistedState, SettingsStore};
pub use types::*;
