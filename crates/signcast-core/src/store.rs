//! Persisted runtime state.
//!
//! Components never write ad-hoc keys; everything that survives a restart is
//! a field of [`PersistedState`], mutated through a [`SettingsStore`]. The
//! token record is written only by the auth session, the layout id only by
//! the scheduler.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::TokenRecord;

// MARK: - PersistedState

/// State that must survive a process restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    #[serde(alias = "displayId")]
    pub display_id: Option<String>,
    #[serde(alias = "isRegistered")]
    pub is_registered: bool,
    /// Generated on first run when the operator did not configure one.
    #[serde(alias = "hardwareKey")]
    pub hardware_key: Option<String>,
    pub token: Option<TokenRecord>,
    #[serde(alias = "currentLayoutId")]
    pub last_content_id: Option<String>,
    /// Offset from a user drag; `None` until one happens, so the configured
    /// initial offset applies.
    #[serde(alias = "overlayOffsetX")]
    pub overlay_offset_x: Option<i32>,
    #[serde(alias = "overlayOffsetY")]
    pub overlay_offset_y: Option<i32>,
}

// MARK: - SettingsStore

/// Read/modify persisted state. Implementations are cheap to clone and safe
/// to share across tasks.
pub trait SettingsStore: Send + Sync + 'static {
    fn state(&self) -> PersistedState;

    /// Apply a mutation and persist the result.
    fn update(&self, f: &mut dyn FnMut(&mut PersistedState));
}

// MARK: - MemoryStore

/// In-memory store. Used by tests and headless diagnostic runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<PersistedState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self { inner: Mutex::new(state) }
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SettingsStore for MemoryStore {
    fn state(&self) -> PersistedState {
        self.lock().clone()
    }

    fn update(&self, f: &mut dyn FnMut(&mut PersistedState)) {
        f(&mut self.lock());
    }
}

// MARK: - FileStore

/// JSON-file-backed store. Every update rewrites the file; the state is tiny
/// and updates are rare (registration, token refresh, layout change).
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: Mutex<PersistedState>,
}

impl FileStore {
    /// Load existing state from `path`, or start empty if the file is
    /// missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("State file {} is corrupt ({e}); starting fresh", path.display());
                PersistedState::default()
            }),
            Err(_) => PersistedState::default(),
        };
        Self { path, inner: Mutex::new(state) }
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flush(&self, state: &PersistedState) {
        match serde_json::to_vec_pretty(state) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    warn!("Failed to write state file {}: {e}", self.path.display());
                }
            }
            Err(e) => warn!("Failed to serialize persisted state: {e}"),
        }
    }
}

impl SettingsStore for FileStore {
    fn state(&self) -> PersistedState {
        self.lock().clone()
    }

    fn update(&self, f: &mut dyn FnMut(&mut PersistedState)) {
        let mut guard = self.lock();
        f(&mut guard);
        self.flush(&guard);
    }
}
