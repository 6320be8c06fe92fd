//! Wire protocol against the CMS backend.
//!
//! The trait keeps the rest of the crate off reqwest; tests implement it
//! directly. [`HttpCms`] is the production implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use signcast_core::{AuthErrorKind, SigncastError};

/// Per-request timeout. The backend is on the local network or a nearby
/// datacenter; anything slower than this is effectively down.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Identifies the display to the backend on authenticated display endpoints.
const DISPLAY_KEY_HEADER: &str = "X-Display-Key";

// MARK: - Wire types

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub server_key: String,
    pub hardware_key: String,
    pub display_name: String,
    pub client_type: String,
    pub client_version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub display_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub display_id: String,
    pub hardware_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_layout_id: Option<String>,
    /// Numeric status code, see [`signcast_core::DisplayStatus::code`].
    pub status: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    /// Layout the display should currently show; `None` when nothing is
    /// scheduled.
    #[serde(default)]
    pub layout_id: Option<String>,
}

/// OAuth2 grant for the token endpoint. Client credentials travel with the
/// transport, user credentials with the grant.
#[derive(Debug, Clone)]
pub enum TokenGrant {
    Password { username: String, password: String },
    Refresh { refresh_token: String },
}

/// OAuth token endpoint response (snake_case per RFC 6749).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

/// Error body some endpoints return alongside a 4xx.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

impl ErrorBody {
    fn detail(&self) -> Option<String> {
        if self.error.is_empty() && self.message.is_empty() {
            return None;
        }
        Some(format!("{}: {}", self.error, self.message))
    }
}

// MARK: - CmsTransport

#[async_trait]
pub trait CmsTransport: Send + Sync + 'static {
    async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, SigncastError>;

    async fn report_status(&self, report: &StatusReport) -> Result<(), SigncastError>;

    async fn fetch_schedule(
        &self,
        display_id: &str,
        hardware_key: &str,
    ) -> Result<ScheduleResponse, SigncastError>;

    async fn token_exchange(&self, grant: &TokenGrant) -> Result<TokenResponse, SigncastError>;

    /// Absolute URL the renderer loads for a layout. Synchronous; it is pure
    /// string assembly.
    fn content_url(&self, content_id: &str, token: &str) -> Result<String, SigncastError>;
}

// MARK: - HttpCms

/// reqwest-backed transport. One shared client, per-request timeouts.
#[derive(Debug)]
pub struct HttpCms {
    client: reqwest::Client,
    base_url: reqwest::Url,
    client_id: String,
    client_secret: String,
}

impl HttpCms {
    /// `base_url` must already be normalized (scheme, trailing slash), see
    /// [`signcast_core::OverlaySettings::normalized_cms_url`].
    pub fn new(
        base_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, SigncastError> {
        let base_url = reqwest::Url::parse(base_url).map_err(|e| {
            SigncastError::ConfigurationInvalid { reason: format!("CMS URL: {e}") }
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SigncastError::Backend { reason: e.to_string() })?;
        Ok(Self {
            client,
            base_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<reqwest::Url, SigncastError> {
        self.base_url
            .join(path)
            .map_err(|e| SigncastError::Backend { reason: format!("bad endpoint {path}: {e}") })
    }

    /// Certificate failures surface inside reqwest's error chain; everything
    /// else transport-level is a plain network error.
    fn classify(err: &reqwest::Error) -> AuthErrorKind {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(e) = source {
            let text = e.to_string().to_ascii_lowercase();
            if text.contains("certificate") || text.contains("self signed") {
                return AuthErrorKind::CertificateTrust;
            }
            source = e.source();
        }
        AuthErrorKind::Network
    }

    async fn error_detail(resp: reqwest::Response) -> String {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.detail())
            .unwrap_or_else(|| format!("HTTP {status}"))
    }
}

#[async_trait]
impl CmsTransport for HttpCms {
    async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, SigncastError> {
        let url = self.endpoint("api/display/register")?;
        debug!("Registering display {:?} with CMS", req.display_name);
        let resp = self
            .client
            .post(url)
            .json(req)
            .send()
            .await
            .map_err(|e| SigncastError::RegistrationFailed { reason: e.to_string() })?;
        if !resp.status().is_success() {
            let reason = Self::error_detail(resp).await;
            return Err(SigncastError::RegistrationFailed { reason });
        }
        resp.json()
            .await
            .map_err(|e| SigncastError::RegistrationFailed { reason: e.to_string() })
    }

    async fn report_status(&self, report: &StatusReport) -> Result<(), SigncastError> {
        let url = self.endpoint("api/display/status")?;
        let resp = self
            .client
            .post(url)
            .header(DISPLAY_KEY_HEADER, &report.hardware_key)
            .json(report)
            .send()
            .await
            .map_err(|e| SigncastError::Backend { reason: e.to_string() })?;
        if !resp.status().is_success() {
            return Err(SigncastError::Backend { reason: Self::error_detail(resp).await });
        }
        Ok(())
    }

    async fn fetch_schedule(
        &self,
        display_id: &str,
        hardware_key: &str,
    ) -> Result<ScheduleResponse, SigncastError> {
        let url = self.endpoint(&format!("api/display/schedule/{display_id}"))?;
        let resp = self
            .client
            .get(url)
            .header(DISPLAY_KEY_HEADER, hardware_key)
            .send()
            .await
            .map_err(|e| SigncastError::Backend { reason: e.to_string() })?;
        if !resp.status().is_success() {
            return Err(SigncastError::Backend { reason: Self::error_detail(resp).await });
        }
        resp.json()
            .await
            .map_err(|e| SigncastError::Backend { reason: e.to_string() })
    }

    async fn token_exchange(&self, grant: &TokenGrant) -> Result<TokenResponse, SigncastError> {
        let url = self.endpoint("api/oauth/access_token")?;
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ];
        match grant {
            TokenGrant::Password { username, password } => {
                form.push(("grant_type", "password"));
                form.push(("username", username));
                form.push(("password", password));
            }
            TokenGrant::Refresh { refresh_token } => {
                form.push(("grant_type", "refresh_token"));
                form.push(("refresh_token", refresh_token));
            }
        }
        let resp = self
            .client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| SigncastError::auth(Self::classify(&e), e.to_string()))?;
        if !resp.status().is_success() {
            let detail = Self::error_detail(resp).await;
            return Err(SigncastError::auth(AuthErrorKind::Rejected, detail));
        }
        resp.json()
            .await
            .map_err(|e| SigncastError::auth(AuthErrorKind::Network, e.to_string()))
    }

    fn content_url(&self, content_id: &str, token: &str) -> Result<String, SigncastError> {
        let mut url = self.endpoint(&format!("api/layout/render/{content_id}"))?;
        url.query_pairs_mut().append_pair("preview", "1").append_pair("token", token);
        let url = url.to_string();
        debug!("Content URL: {}", mask_token(&url));
        Ok(url)
    }
}

/// Redact the bearer token before a URL reaches the logs.
pub fn mask_token(url: &str) -> String {
    match url.find("token=") {
        Some(idx) => {
            let end = url[idx..].find('&').map(|o| idx + o).unwrap_or(url.len());
            format!("{}token=***{}", &url[..idx], &url[end..])
        }
        None => url.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_url_carries_preview_and_token() {
        let cms = HttpCms::new("https://cms.example.com/", "id", "secret").expect("client");
        let url = cms.content_url("42", "tok en").expect("url");
        assert!(url.starts_with("https://cms.example.com/api/layout/render/42?"));
        assert!(url.contains("preview=1"));
        // Token is percent-encoded into the query.
        assert!(url.contains("token=tok+en") || url.contains("token=tok%20en"));
    }

    #[test]
    fn mask_token_redacts_the_query_value() {
        let masked = mask_token("https://c/api/layout/render/1?preview=1&token=secret123");
        assert_eq!(masked, "https://c/api/layout/render/1?preview=1&token=***");

        let masked = mask_token("https://c/x?token=abc&preview=1");
        assert_eq!(masked, "https://c/x?token=***&preview=1");
    }

    #[test]
    fn invalid_base_url_is_a_configuration_error() {
        let err = HttpCms::new("not a url", "id", "secret").unwrap_err();
        assert!(matches!(err, SigncastError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn error_body_detail_formats_error_and_message() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"error": "invalid_grant", "message": "bad password"}"#)
                .expect("error body");
        assert_eq!(body.detail().as_deref(), Some("invalid_grant: bad password"));
        assert!(ErrorBody::default().detail().is_none());
    }
}
