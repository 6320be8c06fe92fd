use serde::{Deserialize, Serialize};

// MARK: - Size

/// Pixel dimensions of a capture stream or window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const FHD: Self = Self { width: 1920, height: 1080 };
    pub const HD: Self = Self { width: 1280, height: 720 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - Gravity

/// Screen corner a non-fullscreen overlay window is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gravity {
    TopStart,
    TopEnd,
    BottomStart,
    BottomEnd,
}

impl Default for Gravity {
    fn default() -> Self {
        Self::TopEnd
    }
}

// MARK: - WindowGeometry

/// Resolved on-screen geometry of the overlay window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub gravity: Gravity,
    /// 0.0 (invisible) ..= 1.0 (opaque).
    pub opacity: f32,
}

impl WindowGeometry {
    pub fn fullscreen(screen: Size) -> Self {
        Self {
            x: 0,
            y: 0,
            width: screen.width,
            height: screen.height,
            gravity: Gravity::TopStart,
            opacity: 1.0,
        }
    }
}

// MARK: - DisplayStatus

/// Status code reported to the CMS backend. Numeric values are part of the
/// backend protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayStatus {
    Running,
    Pending,
    Error,
}

impl DisplayStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Running => 1,
            Self::Pending => 2,
            Self::Error => 3,
        }
    }
}

// MARK: - LayoutState

/// The scheduler's view of what the display should be showing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutState {
    pub current_content_id: Option<String>,
    pub status: DisplayStatus,
}

impl Default for LayoutState {
    fn default() -> Self {
        Self { current_content_id: None, status: DisplayStatus::Pending }
    }
}

// MARK: - TokenRecord

/// Safety margin subtracted from the expiry so a token is never used while
/// it could lapse mid-request.
pub const TOKEN_SAFETY_MARGIN_MS: u64 = 60_000;

/// OAuth bearer token pair with absolute expiry (unix epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(alias = "tokenExpiry")]
    pub expires_at_ms: u64,
}

impl TokenRecord {
    /// Usable only while `now < expiry − safety margin`.
    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms.saturating_sub(TOKEN_SAFETY_MARGIN_MS)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_unix_ms())
    }
}

/// Current wall-clock time as unix epoch milliseconds.
pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
