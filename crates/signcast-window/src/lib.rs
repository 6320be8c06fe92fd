//! The always-on-top overlay window.
//!
//! The host compositor is an opaque primitive: "place this rendering surface
//! on screen at position/size". This crate decides geometry from
//! configuration, keeps the window's render target flowing through the
//! [`SurfaceBroker`], and recreates the window on display-geometry changes
//! (destroy then recreate; geometry offset updates are the only in-place
//! mutation).

use std::sync::Arc;

use tracing::{debug, info, warn};

use signcast_capture::{RenderTarget, SurfaceBroker};
use signcast_core::{OverlaySettings, SettingsStore, SigncastError, Size, WindowGeometry};

// MARK: - Host platform primitive

/// Flags applied to every overlay window: it must never steal input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFlags {
    pub not_focusable: bool,
    pub not_touch_modal: bool,
}

impl WindowFlags {
    pub const OVERLAY: Self = Self { not_focusable: true, not_touch_modal: true };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowHandle(pub u64);

/// Host compositor primitive. Mocked in tests; backed by the platform
/// window manager in production.
pub trait WindowHost: Send + Sync + 'static {
    fn screen_size(&self) -> Size;

    /// Create an on-screen window; yields the handle plus the window's
    /// drawable surface.
    fn create(
        &self,
        geometry: WindowGeometry,
        flags: WindowFlags,
    ) -> Result<(WindowHandle, RenderTarget), SigncastError>;

    /// In-place geometry offset update.
    fn update_geometry(&self, window: &WindowHandle, x: i32, y: i32) -> Result<(), SigncastError>;

    fn destroy(&self, window: WindowHandle);
}

// MARK: - OverlayWindowManager

pub struct OverlayWindowManager {
    host: Arc<dyn WindowHost>,
    broker: SurfaceBroker,
    store: Arc<dyn SettingsStore>,
    settings: OverlaySettings,
    window: Option<WindowHandle>,
    geometry: Option<WindowGeometry>,
    hidden_by_screen_off: bool,
}

impl OverlayWindowManager {
    pub fn new(
        host: Arc<dyn WindowHost>,
        broker: SurfaceBroker,
        store: Arc<dyn SettingsStore>,
        settings: OverlaySettings,
    ) -> Self {
        // From now on capture requests defer to us instead of going headless.
        broker.attach_provider();
        Self {
            host,
            broker,
            store,
            settings,
            window: None,
            geometry: None,
            hidden_by_screen_off: false,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.window.is_some()
    }

    /// Create and show the window. No-op if already visible.
    pub fn show(&mut self) -> Result<(), SigncastError> {
        if self.window.is_some() {
            debug!("Overlay already visible; show() is a no-op");
            return Ok(());
        }

        let geometry = self.compute_geometry();
        let (handle, target) = self.host.create(geometry, WindowFlags::OVERLAY)?;
        info!(
            "Overlay window shown: {}×{} at ({}, {}) opacity {:.2}",
            geometry.width, geometry.height, geometry.x, geometry.y, geometry.opacity
        );
        self.window = Some(handle);
        self.geometry = Some(geometry);
        self.hidden_by_screen_off = false;
        self.broker.supply(target);
        Ok(())
    }

    /// Remove the window. Idempotent. The broker is invalidated first so the
    /// capture side closes before the surface disappears.
    pub fn hide(&mut self) {
        let Some(handle) = self.window.take() else {
            debug!("Overlay already hidden; hide() is a no-op");
            return;
        };
        self.broker.invalidate();
        self.host.destroy(handle);
        self.geometry = None;
        info!("Overlay window hidden");
    }

    /// Move the window in place and persist the new offset.
    pub fn update_position(&mut self, x: i32, y: i32) {
        let Some(handle) = &self.window else {
            warn!("update_position with no window; ignored");
            return;
        };
        if let Err(e) = self.host.update_geometry(handle, x, y) {
            warn!("Failed to update overlay position: {e}");
            return;
        }
        if let Some(g) = &mut self.geometry {
            g.x = x;
            g.y = y;
        }
        self.store.update(&mut |s| {
            s.overlay_offset_x = Some(x);
            s.overlay_offset_y = Some(y);
        });
        debug!("Overlay position updated to ({x}, {y})");
    }

    /// Display rotated or resized: tear the window down and recreate it.
    /// Returns `true` when a window was recreated: the caller must
    /// re-attach the content layer; this is a reconciliation point, not
    /// silent self-healing.
    pub fn on_display_geometry_changed(&mut self) -> Result<bool, SigncastError> {
        if self.window.is_none() {
            return Ok(false);
        }
        info!("Display geometry changed; recreating overlay window");
        self.hide();
        self.show()?;
        Ok(true)
    }

    /// Screen blanked. Honors `hide_on_screen_off`.
    pub fn on_screen_off(&mut self) {
        if self.settings.hide_on_screen_off && self.window.is_some() {
            self.hide();
            self.hidden_by_screen_off = true;
        }
    }

    /// Screen unblanked. Restores a window hidden by [`on_screen_off`].
    pub fn on_screen_on(&mut self) -> Result<(), SigncastError> {
        if self.hidden_by_screen_off {
            self.show()?;
        }
        Ok(())
    }

    // ── Geometry ──────────────────────────────────────────────────────────

    /// Full-screen by default; a literal pixel box when configured; else a
    /// fractional corner-anchored box (⅓ × ¼ of the screen).
    fn compute_geometry(&self) -> WindowGeometry {
        let screen = self.host.screen_size();
        let state = self.store.state();

        if self.settings.use_fullscreen_overlay {
            let mut g = WindowGeometry::fullscreen(screen);
            g.opacity = self.settings.opacity;
            return g;
        }

        let (width, height) = match self.settings.window_size {
            Some(size) => (size.width, size.height),
            None => (screen.width / 3, screen.height / 4),
        };

        // A persisted drag position wins over the configured initial offset.
        WindowGeometry {
            x: state.overlay_offset_x.unwrap_or(self.settings.offset_x),
            y: state.overlay_offset_y.unwrap_or(self.settings.offset_y),
            width,
            height,
            gravity: self.settings.gravity,
            opacity: self.settings.opacity,
        }
    }
}

impl Drop for OverlayWindowManager {
    fn drop(&mut self) {
        self.hide();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use signcast_core::{Gravity, MemoryStore};

    use super::*;

    struct MockHost {
        screen: Size,
        next_id: AtomicU64,
        creates: AtomicUsize,
        destroys: AtomicUsize,
        last_geometry: Mutex<Option<WindowGeometry>>,
        last_flags: Mutex<Option<WindowFlags>>,
        moves: Mutex<Vec<(i32, i32)>>,
    }

    impl MockHost {
        fn new(screen: Size) -> Arc<Self> {
            Arc::new(Self {
                screen,
                next_id: AtomicU64::new(1),
                creates: AtomicUsize::new(0),
                destroys: AtomicUsize::new(0),
                last_geometry: Mutex::new(None),
                last_flags: Mutex::new(None),
                moves: Mutex::new(Vec::new()),
            })
        }
    }

    impl WindowHost for MockHost {
        fn screen_size(&self) -> Size {
            self.screen
        }

        fn create(
            &self,
            geometry: WindowGeometry,
            flags: WindowFlags,
        ) -> Result<(WindowHandle, RenderTarget), SigncastError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            *self.last_geometry.lock().unwrap() = Some(geometry);
            *self.last_flags.lock().unwrap() = Some(flags);
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok((
                WindowHandle(id),
                RenderTarget { id, kind: signcast_capture::TargetKind::Window },
            ))
        }

        fn update_geometry(&self, _window: &WindowHandle, x: i32, y: i32) -> Result<(), SigncastError> {
            self.moves.lock().unwrap().push((x, y));
            Ok(())
        }

        fn destroy(&self, _window: WindowHandle) {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(host: Arc<MockHost>, settings: OverlaySettings) -> (OverlayWindowManager, SurfaceBroker, Arc<MemoryStore>) {
        let broker = SurfaceBroker::new();
        let store = Arc::new(MemoryStore::new());
        let mgr = OverlayWindowManager::new(host, broker.clone(), store.clone(), settings);
        (mgr, broker, store)
    }

    #[test]
    fn show_is_idempotent_and_supplies_target() {
        let host = MockHost::new(Size::FHD);
        let (mut mgr, broker, _) = manager(Arc::clone(&host), OverlaySettings::default());

        mgr.show().unwrap();
        mgr.show().unwrap();

        assert_eq!(host.creates.load(Ordering::SeqCst), 1);
        assert!(broker.current().is_some());
        let flags = host.last_flags.lock().unwrap().unwrap();
        assert!(flags.not_focusable && flags.not_touch_modal);
    }

    #[test]
    fn hide_twice_has_no_duplicate_side_effects() {
        let host = MockHost::new(Size::FHD);
        let (mut mgr, broker, _) = manager(Arc::clone(&host), OverlaySettings::default());

        mgr.show().unwrap();
        mgr.hide();
        mgr.hide();

        assert_eq!(host.destroys.load(Ordering::SeqCst), 1);
        assert!(broker.current().is_none());
    }

    #[test]
    fn fullscreen_geometry_covers_screen() {
        let host = MockHost::new(Size::FHD);
        let (mut mgr, _, _) = manager(Arc::clone(&host), OverlaySettings::default());

        mgr.show().unwrap();
        let g = host.last_geometry.lock().unwrap().unwrap();
        assert_eq!((g.width, g.height, g.x, g.y), (1920, 1080, 0, 0));
    }

    #[test]
    fn fractional_corner_box_when_not_fullscreen() {
        let host = MockHost::new(Size::FHD);
        let settings = OverlaySettings {
            use_fullscreen_overlay: false,
            gravity: Gravity::TopEnd,
            ..Default::default()
        };
        let (mut mgr, _, _) = manager(Arc::clone(&host), settings);

        mgr.show().unwrap();
        let g = host.last_geometry.lock().unwrap().unwrap();
        assert_eq!((g.width, g.height), (1920 / 3, 1080 / 4));
        assert_eq!(g.gravity, Gravity::TopEnd);
    }

    #[test]
    fn literal_pixel_box_when_configured() {
        let host = MockHost::new(Size::FHD);
        let settings = OverlaySettings {
            use_fullscreen_overlay: false,
            window_size: Some(Size::new(400, 300)),
            ..Default::default()
        };
        let (mut mgr, _, _) = manager(Arc::clone(&host), settings);

        mgr.show().unwrap();
        let g = host.last_geometry.lock().unwrap().unwrap();
        assert_eq!((g.width, g.height), (400, 300));
    }

    #[test]
    fn update_position_mutates_in_place_and_persists() {
        let host = MockHost::new(Size::FHD);
        let (mut mgr, _, store) = manager(Arc::clone(&host), OverlaySettings::default());

        mgr.show().unwrap();
        mgr.update_position(15, 25);

        assert_eq!(host.moves.lock().unwrap().as_slice(), &[(15, 25)]);
        assert_eq!(host.creates.load(Ordering::SeqCst), 1); // no recreate
        let state = store.state();
        assert_eq!((state.overlay_offset_x, state.overlay_offset_y), (Some(15), Some(25)));
    }

    #[test]
    fn configured_offset_applies_until_a_drag_persists_one() {
        let host = MockHost::new(Size::FHD);
        let settings = OverlaySettings {
            use_fullscreen_overlay: false,
            offset_x: 40,
            offset_y: 8,
            ..Default::default()
        };
        let (mut mgr, _, _) = manager(Arc::clone(&host), settings);

        mgr.show().unwrap();
        let g = host.last_geometry.lock().unwrap().unwrap();
        assert_eq!((g.x, g.y), (40, 8));

        // After a drag the persisted position wins on the next show.
        mgr.update_position(15, 25);
        mgr.hide();
        mgr.show().unwrap();
        let g = host.last_geometry.lock().unwrap().unwrap();
        assert_eq!((g.x, g.y), (15, 25));
    }

    #[test]
    fn geometry_change_recreates_window() {
        let host = MockHost::new(Size::FHD);
        let (mut mgr, broker, _) = manager(Arc::clone(&host), OverlaySettings::default());

        mgr.show().unwrap();
        let first = broker.current().unwrap();

        let reattach = mgr.on_display_geometry_changed().unwrap();
        assert!(reattach);
        assert_eq!(host.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(host.creates.load(Ordering::SeqCst), 2);
        assert_ne!(broker.current().unwrap(), first);
    }

    #[test]
    fn geometry_change_with_hidden_window_is_a_no_op() {
        let host = MockHost::new(Size::FHD);
        let (mut mgr, _, _) = manager(Arc::clone(&host), OverlaySettings::default());

        assert!(!mgr.on_display_geometry_changed().unwrap());
        assert_eq!(host.creates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn screen_off_hides_and_screen_on_restores() {
        let host = MockHost::new(Size::FHD);
        let settings = OverlaySettings { hide_on_screen_off: true, ..Default::default() };
        let (mut mgr, _, _) = manager(Arc::clone(&host), settings);

        mgr.show().unwrap();
        mgr.on_screen_off();
        assert!(!mgr.is_visible());
        mgr.on_screen_on().unwrap();
        assert!(mgr.is_visible());
    }
}
