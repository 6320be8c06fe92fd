use thiserror::Error;

/// Why an authentication exchange failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// Transport-level failure (DNS, connect, timeout).
    Network,
    /// TLS handshake rejected the server certificate.
    CertificateTrust,
    /// Server answered and rejected the credentials.
    Rejected,
}

impl std::fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network error"),
            Self::CertificateTrust => write!(f, "server certificate not trusted"),
            Self::Rejected => write!(f, "credentials rejected by server"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SigncastError {
    #[error("Capture device is busy (lock wait timed out)")]
    DeviceBusy,

    #[error("No capture device available")]
    NoDeviceAvailable,

    #[error("Capture device error: code {0}")]
    DeviceError(i32),

    #[error("Render surface unavailable")]
    SurfaceUnavailable,

    #[error("Authentication failed: {kind}: {detail}")]
    AuthFailed { kind: AuthErrorKind, detail: String },

    #[error("Display registration failed: {reason}")]
    RegistrationFailed { reason: String },

    #[error("CMS request failed: {reason}")]
    Backend { reason: String },

    #[error("Content {id} failed to load: {reason}")]
    ContentLoadFailed { id: String, reason: String },

    #[error("Invalid content id")]
    InvalidContentId,

    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SigncastError {
    pub fn auth(kind: AuthErrorKind, detail: impl Into<String>) -> Self {
        Self::AuthFailed { kind, detail: detail.into() }
    }
}
