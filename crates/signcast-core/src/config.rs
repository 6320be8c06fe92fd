use serde::{Deserialize, Serialize};

use crate::types::{Gravity, Size};

/// Complete overlay configuration, passed explicitly into the startup
/// coordinator. No component reads ambient global state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    // Capture
    /// Preferred capture device id; used when no external-flagged device is
    /// enumerated.
    #[serde(alias = "captureDeviceId")]
    pub capture_device_id: Option<String>,
    #[serde(alias = "requestedSize")]
    pub requested_size: Size,

    // Window
    #[serde(alias = "useFullscreenOverlay")]
    pub use_fullscreen_overlay: bool,
    /// Literal pixel box; ignored when fullscreen. `None` means the
    /// fractional corner-anchored default.
    #[serde(alias = "windowSize")]
    pub window_size: Option<Size>,
    pub gravity: Gravity,
    pub opacity: f32,
    #[serde(alias = "offsetX")]
    pub offset_x: i32,
    #[serde(alias = "offsetY")]
    pub offset_y: i32,

    // CMS backend
    #[serde(alias = "cmsUrl")]
    pub cms_url: String,
    #[serde(alias = "serverKey")]
    pub server_key: String,
    #[serde(alias = "clientId")]
    pub client_id: String,
    #[serde(alias = "clientSecret")]
    pub client_secret: String,
    pub username: String,
    pub password: String,
    #[serde(alias = "hardwareKey")]
    pub hardware_key: String,
    #[serde(alias = "displayName")]
    pub display_name: String,

    // Flags
    #[serde(alias = "startOnBoot")]
    pub start_on_boot: bool,
    #[serde(alias = "cmsEnabled")]
    pub cms_enabled: bool,
    #[serde(alias = "keepScreenOn")]
    pub keep_screen_on: bool,
    #[serde(alias = "hideOnScreenOff")]
    pub hide_on_screen_off: bool,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            capture_device_id: None,
            requested_size: Size::FHD,
            use_fullscreen_overlay: true,
            window_size: None,
            gravity: Gravity::TopEnd,
            opacity: 1.0,
            offset_x: 0,
            offset_y: 0,
            cms_url: String::new(),
            server_key: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            username: String::new(),
            password: String::new(),
            hardware_key: String::new(),
            display_name: "Signcast Display".into(),
            start_on_boot: false,
            cms_enabled: true,
            keep_screen_on: true,
            hide_on_screen_off: false,
        }
    }
}

impl OverlaySettings {
    /// CMS base URL with a guaranteed trailing slash and scheme. Bare hosts
    /// default to HTTPS, matching how operators usually enter them.
    pub fn normalized_cms_url(&self) -> String {
        let mut url = self.cms_url.trim().to_owned();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            url = format!("https://{url}");
        }
        if !url.ends_with('/') {
            url.push('/');
        }
        url
    }
}
