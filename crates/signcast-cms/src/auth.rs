//! OAuth session against the CMS.
//!
//! The session is the only writer of the persisted token record. Callers ask
//! for a valid access token and never see grant mechanics; concurrent callers
//! share one in-flight exchange.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use signcast_core::{now_unix_ms, SettingsStore, SigncastError, TokenRecord};

use crate::transport::{CmsTransport, TokenGrant, TokenResponse};

// MARK: - AuthState

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NoToken,
    Authenticating,
    Refreshing,
    Valid,
}

// MARK: - RemoteAuthSession

pub struct RemoteAuthSession {
    transport: Arc<dyn CmsTransport>,
    store: Arc<dyn SettingsStore>,
    username: String,
    password: String,
    /// Single-flight guard: at most one token exchange at a time. Waiters
    /// re-check the cache once they hold the lock.
    inflight: Mutex<()>,
    state_tx: watch::Sender<AuthState>,
}

impl RemoteAuthSession {
    pub fn new(
        transport: Arc<dyn CmsTransport>,
        store: Arc<dyn SettingsStore>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let initial = match store.state().token {
            Some(tok) if tok.is_valid() => AuthState::Valid,
            _ => AuthState::NoToken,
        };
        let (state_tx, _) = watch::channel(initial);
        Self {
            transport,
            store,
            username: username.into(),
            password: password.into(),
            inflight: Mutex::new(()),
            state_tx,
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    /// A token that is valid and stays valid through the safety margin, or
    /// `None` when a fresh exchange is needed.
    fn cached_valid(&self) -> Option<TokenRecord> {
        self.store.state().token.filter(|t| t.is_valid())
    }

    /// Return a usable access token, exchanging credentials if the cached one
    /// expired. Refresh is attempted first when a refresh token exists; on
    /// refresh failure the session falls back to the password grant rather
    /// than surfacing the refresh error.
    pub async fn ensure_valid(&self) -> Result<TokenRecord, SigncastError> {
        if let Some(tok) = self.cached_valid() {
            return Ok(tok);
        }

        let _guard = self.inflight.lock().await;
        // Another caller may have completed an exchange while we waited.
        if let Some(tok) = self.cached_valid() {
            return Ok(tok);
        }

        let refresh_token = self
            .store
            .state()
            .token
            .map(|t| t.refresh_token)
            .filter(|t| !t.is_empty());

        let resp = match refresh_token {
            Some(refresh_token) => {
                let _ = self.state_tx.send(AuthState::Refreshing);
                debug!("Access token expired; attempting refresh");
                match self.transport.token_exchange(&TokenGrant::Refresh { refresh_token }).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!("Token refresh failed ({e}); falling back to full authentication");
                        self.password_exchange().await?
                    }
                }
            }
            None => self.password_exchange().await?,
        };

        let record = TokenRecord {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at_ms: now_unix_ms() + resp.expires_in * 1000,
        };
        self.store.update(&mut |s| s.token = Some(record.clone()));
        let _ = self.state_tx.send(AuthState::Valid);
        info!("Authentication succeeded; token valid for {}s", resp.expires_in);
        Ok(record)
    }

    async fn password_exchange(&self) -> Result<TokenResponse, SigncastError> {
        let _ = self.state_tx.send(AuthState::Authenticating);
        let grant = TokenGrant::Password {
            username: self.username.clone(),
            password: self.password.clone(),
        };
        self.transport.token_exchange(&grant).await.map_err(|e| {
            let _ = self.state_tx.send(AuthState::NoToken);
            warn!("Authentication failed: {e}");
            e
        })
    }

    /// Drop the cached token. The next caller performs a full exchange.
    pub fn invalidate(&self) {
        self.store.update(&mut |s| s.token = None);
        let _ = self.state_tx.send(AuthState::NoToken);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use signcast_core::{AuthErrorKind, MemoryStore, PersistedState};

    use super::*;
    use crate::transport::{RegisterRequest, RegisterResponse, ScheduleResponse, StatusReport};

    #[derive(Default)]
    struct MockTransport {
        exchanges: AtomicUsize,
        grants: StdMutex<Vec<&'static str>>,
        refresh_fails: bool,
        reject_all: bool,
        delay: Duration,
    }

    #[async_trait]
    impl CmsTransport for MockTransport {
        async fn register(&self, _: &RegisterRequest) -> Result<RegisterResponse, SigncastError> {
            unimplemented!("not used by auth tests")
        }

        async fn report_status(&self, _: &StatusReport) -> Result<(), SigncastError> {
            unimplemented!("not used by auth tests")
        }

        async fn fetch_schedule(
            &self,
            _: &str,
            _: &str,
        ) -> Result<ScheduleResponse, SigncastError> {
            unimplemented!("not used by auth tests")
        }

        async fn token_exchange(&self, grant: &TokenGrant) -> Result<TokenResponse, SigncastError> {
            tokio::time::sleep(self.delay).await;
            let n = self.exchanges.fetch_add(1, Ordering::SeqCst);
            let kind = match grant {
                TokenGrant::Password { .. } => "password",
                TokenGrant::Refresh { .. } => "refresh",
            };
            self.grants.lock().unwrap().push(kind);
            if self.reject_all {
                return Err(SigncastError::auth(AuthErrorKind::Rejected, "invalid_grant"));
            }
            if self.refresh_fails && kind == "refresh" {
                return Err(SigncastError::auth(AuthErrorKind::Rejected, "stale refresh token"));
            }
            Ok(TokenResponse {
                access_token: format!("access-{n}"),
                refresh_token: "refresh-next".into(),
                expires_in: 3600,
            })
        }

        fn content_url(&self, _: &str, _: &str) -> Result<String, SigncastError> {
            unimplemented!("not used by auth tests")
        }
    }

    fn store_with_token(token: Option<TokenRecord>) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_state(PersistedState { token, ..Default::default() }))
    }

    fn expired_token() -> TokenRecord {
        TokenRecord {
            access_token: "stale".into(),
            refresh_token: "refresh-old".into(),
            expires_at_ms: now_unix_ms().saturating_sub(1),
        }
    }

    #[tokio::test]
    async fn cached_token_skips_the_exchange() {
        let transport = Arc::new(MockTransport::default());
        let valid = TokenRecord {
            access_token: "fresh".into(),
            refresh_token: "r".into(),
            expires_at_ms: now_unix_ms() + 600_000,
        };
        let session = RemoteAuthSession::new(
            transport.clone(),
            store_with_token(Some(valid)),
            "user",
            "pw",
        );

        let tok = session.ensure_valid().await.expect("cached token");
        assert_eq!(tok.access_token, "fresh");
        assert_eq!(transport.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_refreshes_and_persists() {
        let transport = Arc::new(MockTransport::default());
        let store = store_with_token(Some(expired_token()));
        let session =
            RemoteAuthSession::new(transport.clone(), store.clone(), "user", "pw");

        let tok = session.ensure_valid().await.expect("refreshed token");
        assert_eq!(tok.access_token, "access-0");
        assert_eq!(*transport.grants.lock().unwrap(), vec!["refresh"]);
        assert_eq!(
            store.state().token.expect("persisted").access_token,
            "access-0"
        );
    }

    #[tokio::test]
    async fn refresh_failure_falls_back_to_password_grant() {
        let transport = Arc::new(MockTransport { refresh_fails: true, ..Default::default() });
        let session = RemoteAuthSession::new(
            transport.clone(),
            store_with_token(Some(expired_token())),
            "user",
            "pw",
        );

        session.ensure_valid().await.expect("fallback succeeds");
        assert_eq!(*transport.grants.lock().unwrap(), vec!["refresh", "password"]);
    }

    #[tokio::test]
    async fn rejection_surfaces_as_auth_failed() {
        let transport = Arc::new(MockTransport { reject_all: true, ..Default::default() });
        let session =
            RemoteAuthSession::new(transport.clone(), store_with_token(None), "user", "pw");

        let err = session.ensure_valid().await.unwrap_err();
        assert!(matches!(
            err,
            SigncastError::AuthFailed { kind: AuthErrorKind::Rejected, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_exchange() {
        let transport = Arc::new(MockTransport {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let session = Arc::new(RemoteAuthSession::new(
            transport.clone(),
            store_with_token(None),
            "user",
            "pw",
        ));

        let a = tokio::spawn({
            let session = session.clone();
            async move { session.ensure_valid().await }
        });
        let b = tokio::spawn({
            let session = session.clone();
            async move { session.ensure_valid().await }
        });

        let (a, b) = (a.await.unwrap().expect("a"), b.await.unwrap().expect("b"));
        assert_eq!(a.access_token, b.access_token);
        assert_eq!(transport.exchanges.load(Ordering::SeqCst), 1);
    }
}
