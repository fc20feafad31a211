//! Session store: bearer token, authenticated flag and first-time-user flag

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::api::AuthApi;
use crate::error::{error_codes, ClientError, ErrorResponse};
use crate::http::HttpClient;
use crate::storage::{keys, SecureStore, StorageError};
use crate::time::Clock;
use crate::validators::{validate_email, validate_password, ValidationError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Remote(#[from] ClientError),

    #[error("{0}")]
    Storage(#[from] StorageError),
}

impl SessionError {
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            SessionError::Validation(e) => {
                let code = match e.field.as_str() {
                    "email" => error_codes::INVALID_EMAIL,
                    "password" => error_codes::INVALID_PASSWORD,
                    _ => error_codes::INVALID_VALUE,
                };
                ErrorResponse::new(code, e.message.clone())
            }
            SessionError::Remote(ClientError::Validation(e)) => {
                SessionError::Validation(e.clone()).to_error_response()
            }
            SessionError::Remote(e) => e.to_error_response(),
            SessionError::Storage(e) => ErrorResponse::new(error_codes::STORAGE_ERROR, e.to_string()),
        }
    }
}

impl From<SessionError> for ErrorResponse {
    fn from(err: SessionError) -> Self {
        err.to_error_response()
    }
}

/// Observable session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub token: Option<String>,
    /// `None` until the stored token has been looked at
    pub authenticated: Option<bool>,
    pub is_first_time_user: bool,
    /// True until `restore` has finished
    pub loading: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            token: None,
            authenticated: None,
            is_first_time_user: true,
            loading: true,
        }
    }
}

/// Claims carried in the auth service's JWT payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub greenhouses: Vec<String>,
    #[serde(default)]
    pub exp: Option<i64>,
}

impl TokenClaims {
    /// Decode the payload segment of a JWT
    /// The signature is not verified; the backend remains the authority
    pub fn decode(token: &str) -> Option<TokenClaims> {
        let mut parts = token.split('.');
        let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn is_expired(&self, now_epoch_seconds: i64) -> bool {
        matches!(self.exp, Some(exp) if exp <= now_epoch_seconds)
    }
}

/// Holds and persists the authentication token
///
/// Every state change that succeeds is mirrored to the HTTP client's bearer
/// token, so subsequent requests authenticate as the session does.
pub struct SessionStore {
    auth: Arc<dyn AuthApi>,
    http: Arc<dyn HttpClient>,
    storage: Arc<dyn SecureStore>,
    clock: Arc<dyn Clock>,
    state: RwLock<SessionState>,
}

impl SessionStore {
    pub fn new(
        auth: Arc<dyn AuthApi>,
        http: Arc<dyn HttpClient>,
        storage: Arc<dyn SecureStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            auth,
            http,
            storage,
            clock,
            state: RwLock::new(SessionState::default()),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    /// Claims of the current token, if it is a decodable JWT
    pub async fn claims(&self) -> Option<TokenClaims> {
        let state = self.state.read().await;
        state.token.as_deref().and_then(TokenClaims::decode)
    }

    /// Load the persisted token and first-time flag
    pub async fn restore(&self) -> Result<SessionState, SessionError> {
        match self.load_persisted().await {
            Ok((token, first_time)) => {
                self.http.set_bearer_token(token.clone()).await;
                let mut state = self.state.write().await;
                state.authenticated = Some(token.is_some());
                state.token = token;
                if let Some(first_time) = first_time {
                    state.is_first_time_user = first_time;
                }
                state.loading = false;
                info!(authenticated = state.token.is_some(), "Session restored");
                Ok(state.clone())
            }
            Err(err) => {
                error!(error = %err, "Failed to restore session");
                self.http.set_bearer_token(None).await;
                let mut state = self.state.write().await;
                state.token = None;
                state.authenticated = Some(false);
                state.loading = false;
                Err(err)
            }
        }
    }

    async fn load_persisted(&self) -> Result<(Option<String>, Option<bool>), SessionError> {
        let mut token = self.storage.get_item(keys::AUTH_TOKEN).await?;

        if let Some(stored) = token.as_deref() {
            let expired = TokenClaims::decode(stored)
                .map(|claims| claims.is_expired(self.clock.now_epoch_seconds()))
                .unwrap_or(false);
            if expired {
                warn!("Stored token has expired, discarding it");
                self.storage.delete_item(keys::AUTH_TOKEN).await?;
                token = None;
            }
        }

        let first_time = self
            .storage
            .get_item(keys::FIRST_TIME_USER)
            .await?
            .and_then(|raw| serde_json::from_str::<bool>(&raw).ok());

        Ok((token, first_time))
    }

    /// Authenticate against the auth service
    /// On failure the session is left as it was and the error payload is returned
    pub async fn login(&self, email: &str, password: &str) -> Result<String, ErrorResponse> {
        match self.try_login(email, password).await {
            Ok(message) => Ok(message),
            Err(err) => {
                warn!(error = %err, "Login failed");
                Err(err.into())
            }
        }
    }

    async fn try_login(&self, email: &str, password: &str) -> Result<String, SessionError> {
        validate_email(email)?;
        validate_password(password)?;

        let response = self.auth.login(email, password).await?;
        self.storage
            .set_item(keys::AUTH_TOKEN, &response.token)
            .await?;
        self.http.set_bearer_token(Some(response.token.clone())).await;

        let mut state = self.state.write().await;
        state.token = Some(response.token);
        state.authenticated = Some(true);
        state.loading = false;
        info!("Logged in");
        Ok(response.message)
    }

    /// Create an account; does not log in
    pub async fn register(&self, email: &str, password: &str) -> Result<String, ErrorResponse> {
        let result: Result<String, SessionError> = async {
            validate_email(email)?;
            validate_password(password)?;
            Ok(self.auth.register(email, password).await?)
        }
        .await;

        result.map_err(|err| {
            warn!(error = %err, "Registration failed");
            err.into()
        })
    }

    /// Forget the token locally; no server-side revocation
    pub async fn logout(&self) -> Result<(), SessionError> {
        self.http.set_bearer_token(None).await;
        {
            let mut state = self.state.write().await;
            state.token = None;
            state.authenticated = Some(false);
        }
        self.storage.delete_item(keys::AUTH_TOKEN).await?;
        info!("Logged out");
        Ok(())
    }

    pub async fn complete_onboarding(&self) -> Result<(), SessionError> {
        self.state.write().await.is_first_time_user = false;
        self.storage
            .set_item(keys::FIRST_TIME_USER, "false")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LoginResponse, MockAuthApi};
    use crate::http::MockHttpClient;
    use crate::storage::MemoryStore;
    use crate::time::FixedClock;

    const NOW: i64 = 1_746_000_000;

    fn jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.signature", header, payload)
    }

    fn valid_token() -> String {
        jwt(serde_json::json!({
            "username": "grower@example.com",
            "user_id": "c670e06e-afa8-4d4f-8005-b7bea9b38054",
            "role": "user",
            "greenhouses": ["gh_1", "gh_2"],
            "exp": NOW + 3600
        }))
    }

    fn http_accepting_tokens() -> MockHttpClient {
        let mut http = MockHttpClient::new();
        http.expect_set_bearer_token()
            .returning(|_| Box::pin(async {}));
        http
    }

    fn store(auth: MockAuthApi, http: MockHttpClient, storage: Arc<MemoryStore>) -> SessionStore {
        SessionStore::new(
            Arc::new(auth),
            Arc::new(http),
            storage,
            Arc::new(FixedClock::from_epoch_seconds(NOW)),
        )
    }

    #[tokio::test]
    async fn initial_state_is_loading_and_unknown() {
        let session = store(MockAuthApi::new(), MockHttpClient::new(), Arc::new(MemoryStore::new()));
        let state = session.state().await;
        assert!(state.loading);
        assert_eq!(state.authenticated, None);
        assert!(state.is_first_time_user);
    }

    #[tokio::test]
    async fn login_persists_token_and_sets_bearer() {
        let token = valid_token();
        let expected = token.clone();

        let mut auth = MockAuthApi::new();
        auth.expect_login()
            .withf(|email, password| email == "grower@example.com" && password == "secret1")
            .times(1)
            .returning(move |_, _| {
                let token = token.clone();
                Box::pin(async move {
                    Ok(LoginResponse {
                        token,
                        message: "Login successful".to_string(),
                    })
                })
            });

        let mut http = MockHttpClient::new();
        let bearer = expected.clone();
        http.expect_set_bearer_token()
            .withf(move |token| token.as_deref() == Some(bearer.as_str()))
            .times(1)
            .returning(|_| Box::pin(async {}));

        let storage = Arc::new(MemoryStore::new());
        let session = store(auth, http, storage.clone());

        let message = session.login("grower@example.com", "secret1").await.unwrap();
        assert_eq!(message, "Login successful");

        let state = session.state().await;
        assert_eq!(state.token.as_deref(), Some(expected.as_str()));
        assert_eq!(state.authenticated, Some(true));
        assert_eq!(
            storage.get_item(keys::AUTH_TOKEN).await.unwrap(),
            Some(expected)
        );

        let claims = session.claims().await.unwrap();
        assert_eq!(claims.user_id, "c670e06e-afa8-4d4f-8005-b7bea9b38054");
        assert_eq!(claims.greenhouses, vec!["gh_1", "gh_2"]);
    }

    #[tokio::test]
    async fn login_failure_returns_payload_and_keeps_state() {
        let mut auth = MockAuthApi::new();
        auth.expect_login().returning(|_, _| {
            Box::pin(async {
                Err(ClientError::Status {
                    status: 401,
                    message: "Invalid credentials".to_string(),
                })
            })
        });

        let storage = Arc::new(MemoryStore::new());
        let session = store(auth, MockHttpClient::new(), storage.clone());

        let err = session.login("grower@example.com", "wrong-pass").await.unwrap_err();
        assert_eq!(err.error, error_codes::UNAUTHORIZED);
        assert_eq!(err.message, "Invalid credentials");

        let state = session.state().await;
        assert_eq!(state.token, None);
        assert_eq!(state.authenticated, None);
        assert!(storage.entries().await.is_empty());
    }

    #[tokio::test]
    async fn login_rejects_malformed_email_before_request() {
        let session = store(MockAuthApi::new(), MockHttpClient::new(), Arc::new(MemoryStore::new()));

        let err = session.login("grower-at-example", "secret1").await.unwrap_err();
        assert_eq!(err.error, error_codes::INVALID_EMAIL);

        let err = session.login("grower@example.com", "short").await.unwrap_err();
        assert_eq!(err.error, error_codes::INVALID_PASSWORD);
    }

    #[tokio::test]
    async fn register_does_not_authenticate() {
        let mut auth = MockAuthApi::new();
        auth.expect_register()
            .times(1)
            .returning(|_, _| Box::pin(async { Ok("User created".to_string()) }));

        let session = store(auth, MockHttpClient::new(), Arc::new(MemoryStore::new()));
        assert_eq!(
            session.register("new@example.com", "secret1").await.unwrap(),
            "User created"
        );
        assert_eq!(session.state().await.token, None);
    }

    #[tokio::test]
    async fn logout_clears_token_everywhere() {
        let storage = Arc::new(MemoryStore::new());
        storage.set_item(keys::AUTH_TOKEN, &valid_token()).await.unwrap();

        let mut http = MockHttpClient::new();
        http.expect_set_bearer_token()
            .withf(|token| token.is_some())
            .times(1)
            .returning(|_| Box::pin(async {}));
        http.expect_set_bearer_token()
            .withf(|token| token.is_none())
            .times(1)
            .returning(|_| Box::pin(async {}));

        let session = store(MockAuthApi::new(), http, storage.clone());
        session.restore().await.unwrap();
        assert_eq!(session.state().await.authenticated, Some(true));

        session.logout().await.unwrap();
        let state = session.state().await;
        assert_eq!(state.token, None);
        assert_eq!(state.authenticated, Some(false));
        assert_eq!(storage.get_item(keys::AUTH_TOKEN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn restore_without_token_is_unauthenticated() {
        let storage = Arc::new(MemoryStore::new());
        storage.set_item(keys::FIRST_TIME_USER, "false").await.unwrap();

        let session = store(MockAuthApi::new(), http_accepting_tokens(), storage);
        let state = session.restore().await.unwrap();

        assert_eq!(state.authenticated, Some(false));
        assert!(!state.is_first_time_user);
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn restore_discards_expired_token() {
        let expired = jwt(serde_json::json!({"user_id": "u1", "exp": NOW - 1}));
        let storage = Arc::new(MemoryStore::new());
        storage.set_item(keys::AUTH_TOKEN, &expired).await.unwrap();

        let session = store(MockAuthApi::new(), http_accepting_tokens(), storage.clone());
        let state = session.restore().await.unwrap();

        assert_eq!(state.token, None);
        assert_eq!(state.authenticated, Some(false));
        assert_eq!(storage.get_item(keys::AUTH_TOKEN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn restore_keeps_opaque_token() {
        let storage = Arc::new(MemoryStore::new());
        storage.set_item(keys::AUTH_TOKEN, "123456789").await.unwrap();

        let session = store(MockAuthApi::new(), http_accepting_tokens(), storage);
        let state = session.restore().await.unwrap();

        assert_eq!(state.token.as_deref(), Some("123456789"));
        assert_eq!(state.authenticated, Some(true));
        assert!(session.claims().await.is_none());
    }

    #[tokio::test]
    async fn complete_onboarding_persists_flag() {
        let storage = Arc::new(MemoryStore::new());
        let session = store(MockAuthApi::new(), MockHttpClient::new(), storage.clone());

        session.complete_onboarding().await.unwrap();
        assert!(!session.state().await.is_first_time_user);
        assert_eq!(
            storage.get_item(keys::FIRST_TIME_USER).await.unwrap().as_deref(),
            Some("false")
        );
    }

    #[test]
    fn claims_decode_rejects_malformed_tokens() {
        assert!(TokenClaims::decode("").is_none());
        assert!(TokenClaims::decode("a.b").is_none());
        assert!(TokenClaims::decode("a.!!!.c").is_none());
        assert!(TokenClaims::decode("a.b.c.d").is_none());

        let claims = TokenClaims::decode(&valid_token()).unwrap();
        assert!(!claims.is_expired(NOW));
        assert!(claims.is_expired(NOW + 3600));
    }
}
