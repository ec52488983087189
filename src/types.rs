use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Raw token response from the provider's token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Resolve the relative `expires_in` into an absolutely-timestamped
    /// session token suitable for caching.
    pub fn into_session_token(self) -> SessionToken {
        let expires_at = self
            .expires_in
            .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs));
        SessionToken {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            scope: self.scope,
            expires_at,
        }
    }
}

/// A cached session: the token-endpoint response with an absolute expiry.
///
/// Superseded wholesale by the next exchange or refresh, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SessionToken {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => chrono::Utc::now() >= expires,
            None => false,
        }
    }
}

/// The `aud` claim: a single audience or a set of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == audience,
            Audience::Multiple(auds) => auds.iter().any(|a| a == audience),
        }
    }
}

/// Decoded claims in a verified Authly token.
///
/// Standard OIDC claims plus the Authly-specific session id and permission
/// map. Unrecognized claims are preserved in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identifier, the unique id of the user.
    pub sub: String,
    /// Issuer URL.
    pub iss: String,
    /// Audience(s) the token was issued for.
    pub aud: Audience,
    /// Expiration time (Unix timestamp).
    pub exp: i64,
    /// Issued-at time (Unix timestamp).
    pub iat: i64,
    /// Session id.
    pub sid: String,
    /// Resource name to permission-level bitmask.
    #[serde(default)]
    pub permissions: HashMap<String, i64>,
    /// Permission version.
    #[serde(default)]
    pub pver: Option<i64>,
    /// Space-separated scope list.
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// User profile returned by the user-info endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub permissions: Option<HashMap<String, i64>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Options for building an authorization URL.
#[derive(Debug, Clone)]
pub struct AuthorizeUrlOptions {
    /// URI the provider redirects back to after authentication.
    pub redirect_uri: String,
    /// CSRF state string echoed back on the callback.
    pub state: String,
    /// PKCE code challenge.
    pub code_challenge: String,
    /// Defaults to `S256`.
    pub code_challenge_method: Option<String>,
    /// Defaults to `openid profile email`.
    pub scope: Option<String>,
    /// Defaults to `code`.
    pub response_type: Option<String>,
}

impl AuthorizeUrlOptions {
    pub fn new(
        redirect_uri: impl Into<String>,
        state: impl Into<String>,
        code_challenge: impl Into<String>,
    ) -> Self {
        Self {
            redirect_uri: redirect_uri.into(),
            state: state.into(),
            code_challenge: code_challenge.into(),
            code_challenge_method: None,
            scope: None,
            response_type: None,
        }
    }
}

/// Options for initiating an authorization flow.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOptions {
    /// Overrides the configured redirect URI for this flow.
    pub redirect_uri: Option<String>,
    /// Explicit CSRF state; generated when absent.
    pub state: Option<String>,
    /// Overrides the default scope for this flow.
    pub scope: Option<String>,
}

/// Query parameters delivered to the redirect URI by the provider.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
}

impl CallbackParams {
    pub fn new(code: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            state: Some(state.into()),
        }
    }

    /// Parse callback parameters out of a raw query string
    /// (with or without the leading `?`).
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut params = Self::default();
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("code=") {
                let decoded = urldecode(value);
                if !decoded.is_empty() {
                    params.code = Some(decoded);
                }
            } else if let Some(value) = pair.strip_prefix("state=") {
                let decoded = urldecode(value);
                if !decoded.is_empty() {
                    params.state = Some(decoded);
                }
            }
        }
        params
    }
}

fn urldecode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next();
            let lo = bytes.next();
            if let (Some(h), Some(l)) = (hi, lo) {
                let hex = [h, l];
                if let Ok(s) = std::str::from_utf8(&hex) {
                    if let Ok(val) = u8::from_str_radix(s, 16) {
                        result.push(val as char);
                        continue;
                    }
                }
            }
            result.push('%');
        } else if b == b'+' {
            result.push(' ');
        } else {
            result.push(b as char);
        }
    }
    result
}
