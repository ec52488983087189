use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::{StatusCode, Url};
use tokio::sync::Mutex;

use crate::config::AuthlyOptions;
use crate::error::AuthlyError;
use crate::pkce;
use crate::storage::{Storage, STATE_KEY, TOKEN_KEY, VERIFIER_KEY};
use crate::types::{
    AuthorizeOptions, AuthorizeUrlOptions, CallbackParams, Claims, SessionToken, TokenResponse,
    UserProfile,
};
use crate::verifier::TokenVerifier;

const DEFAULT_RESPONSE_TYPE: &str = "code";
const DEFAULT_SCOPE: &str = "openid profile email";
const DEFAULT_CHALLENGE_METHOD: &str = "S256";

/// Margin subtracted from a token's remaining lifetime when reporting
/// authentication status, to pre-empt races with server-side expiry.
const EXPIRY_SKEW_SECS: i64 = 30;

/// The session engine: drives the authorization-code-with-PKCE flow and
/// owns the cached session.
///
/// One instance per configured provider. The engine holds the session in
/// memory and, when a [`Storage`] is attached, mirrors it there so it
/// survives reloads. The store is borrowed, never owned exclusively:
/// concurrent tabs or processes sharing it are the embedder's concern.
///
/// Navigation is never performed here. `authorize` returns the URL to
/// redirect to; delivering the user there is the caller's job.
pub struct AuthlyClient {
    options: AuthlyOptions,
    verifier: TokenVerifier,
    http: reqwest::Client,
    storage: Option<Arc<dyn Storage>>,
    session: Mutex<Option<SessionToken>>,
}

enum UserFetchError {
    Unauthorized,
    Other(String),
}

impl AuthlyClient {
    pub fn new(options: AuthlyOptions) -> Self {
        let http = reqwest::Client::new();
        let verifier = TokenVerifier::from_options(&options, http.clone());
        Self {
            options,
            verifier,
            http,
            storage: None,
            session: Mutex::new(None),
        }
    }

    /// Attach a persistent store for flow state and the cached session.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replace the composed token verifier. Lets tests inject a static key
    /// set instead of a remote JWKS.
    pub fn with_verifier(mut self, verifier: TokenVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn options(&self) -> &AuthlyOptions {
        &self.options
    }

    /// Verify a token against the provider's key set and the configured
    /// issuer/audience.
    pub async fn verify(&self, token: &str) -> Result<Claims, AuthlyError> {
        self.verifier.verify(token).await
    }

    /// Build the provider authorization URL. Pure: no side effects, no
    /// network, identical inputs produce an identical URL.
    pub fn get_authorize_url(&self, opts: &AuthorizeUrlOptions) -> Result<String, AuthlyError> {
        let mut url = Url::parse(&self.options.authorize_url())
            .map_err(|e| AuthlyError::Configuration(format!("invalid authorize URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.options.service_id)
            .append_pair("redirect_uri", &opts.redirect_uri)
            .append_pair(
                "response_type",
                opts.response_type.as_deref().unwrap_or(DEFAULT_RESPONSE_TYPE),
            )
            .append_pair("scope", opts.scope.as_deref().unwrap_or(DEFAULT_SCOPE))
            .append_pair("state", &opts.state)
            .append_pair("code_challenge", &opts.code_challenge)
            .append_pair(
                "code_challenge_method",
                opts.code_challenge_method
                    .as_deref()
                    .unwrap_or(DEFAULT_CHALLENGE_METHOD),
            );
        Ok(url.to_string())
    }

    /// Begin an authorization flow: generate state and a PKCE pair, persist
    /// both, and return the URL to redirect the user to.
    ///
    /// Requires an attached storage and a redirect URI (explicit or
    /// configured); both are checked before anything is generated.
    pub async fn authorize(&self, opts: AuthorizeOptions) -> Result<String, AuthlyError> {
        let storage = self.storage.as_ref().ok_or_else(|| {
            AuthlyError::Configuration("authorize requires a configured storage".into())
        })?;
        let redirect_uri = opts
            .redirect_uri
            .or_else(|| self.options.redirect_uri.clone())
            .ok_or_else(|| {
                AuthlyError::Configuration("authorize requires a redirect URI".into())
            })?;

        let state = opts.state.unwrap_or_else(pkce::generate_state);
        let pair = pkce::generate_pair()?;

        storage.set_item(STATE_KEY, &state).await?;
        storage.set_item(VERIFIER_KEY, &pair.code_verifier).await?;

        self.get_authorize_url(&AuthorizeUrlOptions {
            redirect_uri,
            state,
            code_challenge: pair.code_challenge,
            code_challenge_method: None,
            scope: opts.scope,
            response_type: None,
        })
    }

    /// Exchange the authorization code delivered to the redirect URI for a
    /// session.
    ///
    /// The callback state must exactly match the state persisted by
    /// `authorize`; any mismatch, including absent stored state, is a CSRF
    /// failure and no network call is made. Flow state is single-use: after
    /// the token endpoint has been called, state and verifier are removed
    /// whether or not the call succeeded. Only a session-persistence failure
    /// leaves them in place, since the flow was not consumed by this engine.
    pub async fn exchange_token(
        &self,
        params: &CallbackParams,
    ) -> Result<SessionToken, AuthlyError> {
        let storage = self.storage.as_ref().ok_or_else(|| {
            AuthlyError::Configuration("exchange_token requires a configured storage".into())
        })?;

        let code = params.code.as_deref().ok_or_else(|| {
            AuthlyError::Protocol("callback is missing the authorization code".into())
        })?;

        let stored_state = storage.get_item(STATE_KEY).await?;
        match (stored_state.as_deref(), params.state.as_deref()) {
            (Some(stored), Some(supplied)) if stored == supplied => {}
            _ => return Err(AuthlyError::Csrf),
        }

        let verifier = storage.get_item(VERIFIER_KEY).await?.ok_or_else(|| {
            AuthlyError::Protocol("no PKCE verifier in storage for this flow".into())
        })?;

        let redirect_uri = self.options.redirect_uri.clone().ok_or_else(|| {
            AuthlyError::Protocol("no redirect URI configured for the code exchange".into())
        })?;

        let result = self
            .request_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &redirect_uri),
                ("code_verifier", &verifier),
                ("client_id", &self.options.service_id),
            ])
            .await;

        match result {
            Ok(resp) => {
                let session = resp.into_session_token();
                self.persist_session(&session).await?;
                self.clear_flow_state(storage.as_ref()).await;
                Ok(session)
            }
            Err(e) => {
                // The code was presented and is spent either way.
                self.clear_flow_state(storage.as_ref()).await;
                Err(e)
            }
        }
    }

    /// The cached access token: memory first, then the store. `None` when
    /// neither has one. Expiry is not checked here.
    pub async fn get_access_token(&self) -> Option<String> {
        Some(self.cached_session().await?.access_token)
    }

    /// Obtain a fresh access token with a refresh token: the explicit one
    /// when given, otherwise the cached session's.
    ///
    /// Returns `None` on any failure. Refresh failing is a normal
    /// steady-state near expiry or after revocation, not an error.
    pub async fn refresh_token(&self, refresh_token: Option<&str>) -> Option<String> {
        let refresh = match refresh_token {
            Some(token) => token.to_string(),
            None => self.cached_session().await?.refresh_token?,
        };

        let result = self
            .request_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh),
                ("client_id", &self.options.service_id),
            ])
            .await;

        match result {
            Ok(resp) => {
                let session = resp.into_session_token();
                if let Err(e) = self.persist_session(&session).await {
                    tracing::warn!("failed to persist refreshed session: {e}");
                    *self.session.lock().await = Some(session.clone());
                }
                Some(session.access_token)
            }
            Err(e) => {
                tracing::debug!("Token refresh failed: {e}");
                None
            }
        }
    }

    /// Fetch the user profile with the current access token.
    ///
    /// On an authorization failure from the endpoint, refreshes once and
    /// retries once. A second authorization failure clears the session and
    /// returns `None`; any other failure returns `None` without clearing.
    pub async fn get_user(&self) -> Option<UserProfile> {
        let token = self.get_access_token().await?;
        match self.fetch_user(&token).await {
            Ok(profile) => Some(profile),
            Err(UserFetchError::Unauthorized) => {
                let fresh = self.refresh_token(None).await?;
                match self.fetch_user(&fresh).await {
                    Ok(profile) => Some(profile),
                    Err(UserFetchError::Unauthorized) => {
                        tracing::debug!("profile fetch rejected after refresh, clearing session");
                        self.logout().await;
                        None
                    }
                    Err(UserFetchError::Other(e)) => {
                        tracing::debug!("profile fetch failed: {e}");
                        None
                    }
                }
            }
            Err(UserFetchError::Other(e)) => {
                tracing::debug!("profile fetch failed: {e}");
                None
            }
        }
    }

    /// Whether a cached token exists and its `exp`, read without signature
    /// verification, is comfortably in the future.
    ///
    /// A UX hint only. The deciding trust boundary is the server, or
    /// [`AuthlyClient::verify`].
    pub async fn is_authenticated(&self) -> bool {
        let Some(token) = self.get_access_token().await else {
            return false;
        };
        match decode_exp_unverified(&token) {
            // Token carries no exp: nothing local contradicts the session.
            Some(None) => true,
            Some(Some(exp)) => exp > chrono::Utc::now().timestamp() + EXPIRY_SKEW_SECS,
            None => false,
        }
    }

    /// Clear the session, in memory and in the store. Never fails; storage
    /// trouble is logged and swallowed.
    pub async fn logout(&self) {
        *self.session.lock().await = None;
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove_item(TOKEN_KEY).await {
                tracing::warn!("failed to clear persisted session: {e}");
            }
        }
    }

    async fn cached_session(&self) -> Option<SessionToken> {
        {
            let session = self.session.lock().await;
            if let Some(s) = session.as_ref() {
                return Some(s.clone());
            }
        }
        let storage = self.storage.as_ref()?;
        let raw = storage.get_item(TOKEN_KEY).await.ok().flatten()?;
        let session: SessionToken = serde_json::from_str(&raw).ok()?;
        *self.session.lock().await = Some(session.clone());
        Some(session)
    }

    async fn persist_session(&self, session: &SessionToken) -> Result<(), AuthlyError> {
        if let Some(storage) = &self.storage {
            let raw = serde_json::to_string(session)
                .map_err(|e| AuthlyError::Storage(format!("failed to serialize session: {e}")))?;
            storage.set_item(TOKEN_KEY, &raw).await?;
        }
        *self.session.lock().await = Some(session.clone());
        Ok(())
    }

    async fn clear_flow_state(&self, storage: &dyn Storage) {
        for key in [STATE_KEY, VERIFIER_KEY] {
            if let Err(e) = storage.remove_item(key).await {
                tracing::warn!("failed to remove flow state '{key}': {e}");
            }
        }
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse, AuthlyError> {
        let resp = self
            .http
            .post(self.options.token_url())
            .form(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthlyError::Protocol(format!(
                "token endpoint returned status {status}: {body}"
            )));
        }

        resp.json()
            .await
            .map_err(|e| AuthlyError::Protocol(format!("failed to parse token response: {e}")))
    }

    async fn fetch_user(&self, token: &str) -> Result<UserProfile, UserFetchError> {
        let resp = self
            .http
            .get(self.options.user_info_url())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| UserFetchError::Other(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(UserFetchError::Unauthorized);
        }
        if !status.is_success() {
            return Err(UserFetchError::Other(format!(
                "user-info endpoint returned status {status}"
            )));
        }

        resp.json()
            .await
            .map_err(|e| UserFetchError::Other(format!("failed to parse user profile: {e}")))
    }
}

/// Read the `exp` claim from a compact token without verifying anything.
///
/// `None` when the payload does not decode; `Some(None)` when it decodes
/// but carries no usable `exp`.
fn decode_exp_unverified(token: &str) -> Option<Option<i64>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    match value.get("exp") {
        None => Some(None),
        Some(exp) => exp.as_i64().map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn options() -> AuthlyOptions {
        AuthlyOptions::new("https://auth.example.com", "test-audience", "test-service-id")
    }

    fn fake_token(payload: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        format!("{header}.{payload}.sig")
    }

    async fn client_with_session(token: &str) -> AuthlyClient {
        let storage = Arc::new(MemoryStorage::new());
        let session = SessionToken {
            access_token: token.to_string(),
            token_type: "Bearer".into(),
            refresh_token: None,
            id_token: None,
            scope: None,
            expires_at: None,
        };
        storage
            .set_item(TOKEN_KEY, &serde_json::to_string(&session).unwrap())
            .await
            .unwrap();
        AuthlyClient::new(options()).with_storage(storage)
    }

    #[test]
    fn authorize_url_with_defaults() {
        let client = AuthlyClient::new(options());
        let url = client
            .get_authorize_url(&AuthorizeUrlOptions::new(
                "https://app.example.com/callback",
                "test-state",
                "test-challenge",
            ))
            .unwrap();

        let parsed = Url::parse(&url).unwrap();
        let params: std::collections::HashMap<_, _> = parsed.query_pairs().collect();
        assert_eq!(parsed.origin().ascii_serialization(), "https://auth.example.com");
        assert_eq!(parsed.path(), "/authorize");
        assert_eq!(params["client_id"], "test-service-id");
        assert_eq!(params["redirect_uri"], "https://app.example.com/callback");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["scope"], "openid profile email");
        assert_eq!(params["state"], "test-state");
        assert_eq!(params["code_challenge"], "test-challenge");
        assert_eq!(params["code_challenge_method"], "S256");
    }

    #[test]
    fn authorize_url_is_pure() {
        let client = AuthlyClient::new(options());
        let opts = AuthorizeUrlOptions::new("https://app.example.com/cb", "s", "c");
        assert_eq!(
            client.get_authorize_url(&opts).unwrap(),
            client.get_authorize_url(&opts).unwrap()
        );
    }

    #[test]
    fn authorize_url_overrides() {
        let mut opts_cfg = options();
        opts_cfg.authorize_path = "/custom/authorize".into();
        let client = AuthlyClient::new(opts_cfg);

        let mut opts =
            AuthorizeUrlOptions::new("https://app.example.com/callback", "s", "c");
        opts.scope = Some("openid custom".into());
        opts.response_type = Some("token".into());
        let url = client.get_authorize_url(&opts).unwrap();

        let parsed = Url::parse(&url).unwrap();
        let params: std::collections::HashMap<_, _> = parsed.query_pairs().collect();
        assert_eq!(parsed.path(), "/custom/authorize");
        assert_eq!(params["scope"], "openid custom");
        assert_eq!(params["response_type"], "token");
    }

    #[tokio::test]
    async fn authorize_without_storage_is_configuration_error() {
        let client = AuthlyClient::new(options().with_redirect_uri("https://app.example.com/cb"));
        let err = client.authorize(AuthorizeOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "config_error");
    }

    #[tokio::test]
    async fn authorize_without_redirect_uri_is_configuration_error() {
        let client = AuthlyClient::new(options()).with_storage(Arc::new(MemoryStorage::new()));
        let err = client.authorize(AuthorizeOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "config_error");
    }

    #[tokio::test]
    async fn authorize_persists_state_and_verifier() {
        let storage = Arc::new(MemoryStorage::new());
        let client = AuthlyClient::new(options().with_redirect_uri("https://app.example.com/cb"))
            .with_storage(Arc::clone(&storage) as Arc<dyn Storage>);

        let url = client
            .authorize(AuthorizeOptions {
                state: Some("flow-state".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            storage.get_item(STATE_KEY).await.unwrap().as_deref(),
            Some("flow-state")
        );
        let verifier = storage.get_item(VERIFIER_KEY).await.unwrap().unwrap();
        assert_eq!(verifier.len(), pkce::DEFAULT_VERIFIER_LENGTH);

        let parsed = Url::parse(&url).unwrap();
        let params: std::collections::HashMap<_, _> = parsed.query_pairs().collect();
        assert_eq!(params["state"], "flow-state");
        assert_eq!(
            params["code_challenge"].as_ref(),
            pkce::derive_challenge(&verifier)
        );
    }

    #[tokio::test]
    async fn exchange_without_code_is_protocol_error() {
        let client = AuthlyClient::new(options()).with_storage(Arc::new(MemoryStorage::new()));
        let params = CallbackParams {
            code: None,
            state: Some("s".into()),
        };
        let err = client.exchange_token(&params).await.unwrap_err();
        assert_eq!(err.code(), "protocol_error");
    }

    #[tokio::test]
    async fn exchange_state_mismatch_is_csrf_error() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_item(STATE_KEY, "s1").await.unwrap();
        storage.set_item(VERIFIER_KEY, "v").await.unwrap();
        let client = AuthlyClient::new(options()).with_storage(storage);

        let err = client
            .exchange_token(&CallbackParams::new("code", "s2"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "csrf_error");
    }

    #[tokio::test]
    async fn exchange_missing_stored_state_is_csrf_error() {
        let client = AuthlyClient::new(options()).with_storage(Arc::new(MemoryStorage::new()));
        let err = client
            .exchange_token(&CallbackParams::new("code", "s1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "csrf_error");
    }

    #[tokio::test]
    async fn exchange_missing_verifier_is_protocol_error() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_item(STATE_KEY, "s1").await.unwrap();
        let client = AuthlyClient::new(options()).with_storage(storage);

        let err = client
            .exchange_token(&CallbackParams::new("code", "s1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "protocol_error");
    }

    #[tokio::test]
    async fn access_token_falls_back_to_storage() {
        let client = client_with_session("stored-token").await;
        assert_eq!(
            client.get_access_token().await.as_deref(),
            Some("stored-token")
        );
    }

    #[tokio::test]
    async fn access_token_none_without_session() {
        let client = AuthlyClient::new(options());
        assert!(client.get_access_token().await.is_none());
    }

    #[tokio::test]
    async fn is_authenticated_false_without_token() {
        let client = AuthlyClient::new(options());
        assert!(!client.is_authenticated().await);
    }

    #[tokio::test]
    async fn is_authenticated_true_for_future_exp() {
        let exp = chrono::Utc::now().timestamp() + 3600;
        let token = fake_token(serde_json::json!({ "exp": exp }));
        let client = client_with_session(&token).await;
        assert!(client.is_authenticated().await);
    }

    #[tokio::test]
    async fn is_authenticated_false_for_past_exp() {
        let exp = chrono::Utc::now().timestamp() - 1;
        let token = fake_token(serde_json::json!({ "exp": exp }));
        let client = client_with_session(&token).await;
        assert!(!client.is_authenticated().await);
    }

    #[tokio::test]
    async fn is_authenticated_false_inside_skew_margin() {
        let exp = chrono::Utc::now().timestamp() + EXPIRY_SKEW_SECS / 2;
        let token = fake_token(serde_json::json!({ "exp": exp }));
        let client = client_with_session(&token).await;
        assert!(!client.is_authenticated().await);
    }

    #[tokio::test]
    async fn is_authenticated_true_without_exp_claim() {
        let token = fake_token(serde_json::json!({ "sub": "user-1" }));
        let client = client_with_session(&token).await;
        assert!(client.is_authenticated().await);
    }

    #[tokio::test]
    async fn is_authenticated_false_for_undecodable_token() {
        let client = client_with_session("opaque-not-a-jwt").await;
        assert!(!client.is_authenticated().await);
    }

    #[tokio::test]
    async fn logout_clears_memory_and_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let session = SessionToken {
            access_token: "tok".into(),
            token_type: "Bearer".into(),
            refresh_token: None,
            id_token: None,
            scope: None,
            expires_at: None,
        };
        storage
            .set_item(TOKEN_KEY, &serde_json::to_string(&session).unwrap())
            .await
            .unwrap();
        let client = AuthlyClient::new(options())
            .with_storage(Arc::clone(&storage) as Arc<dyn Storage>);

        assert!(client.get_access_token().await.is_some());
        client.logout().await;
        assert!(client.get_access_token().await.is_none());
        assert!(storage.get_item(TOKEN_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn logout_without_session_is_noop() {
        let client = AuthlyClient::new(options());
        client.logout().await;
        assert!(!client.is_authenticated().await);
    }

    #[test]
    fn decode_exp_variants() {
        let token = fake_token(serde_json::json!({ "exp": 123 }));
        assert_eq!(decode_exp_unverified(&token), Some(Some(123)));
        let token = fake_token(serde_json::json!({ "sub": "x" }));
        assert_eq!(decode_exp_unverified(&token), Some(None));
        assert_eq!(decode_exp_unverified("garbage"), None);
        let token = fake_token(serde_json::json!({ "exp": "soon" }));
        assert_eq!(decode_exp_unverified(&token), None);
    }
}
