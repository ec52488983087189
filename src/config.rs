use jsonwebtoken::Algorithm;

/// Default JWKS path, relative to the issuer.
pub const DEFAULT_JWKS_PATH: &str = "/.well-known/jwks.json";
/// Default authorize path, relative to the issuer.
pub const DEFAULT_AUTHORIZE_PATH: &str = "/authorize";
/// Default token path, relative to the issuer.
pub const DEFAULT_TOKEN_PATH: &str = "/oauth/token";
/// Default user-info path, relative to the issuer.
pub const DEFAULT_USER_INFO_PATH: &str = "/oauth/userinfo";

/// Options for constructing an [`crate::AuthlyClient`].
///
/// `issuer`, `audience` and `service_id` are required; everything else has a
/// provider-conventional default. Paths are resolved relative to the issuer.
#[derive(Debug, Clone)]
pub struct AuthlyOptions {
    /// Base URL of the identity provider, e.g. `https://auth.example.com`.
    pub issuer: String,
    /// Expected audience claim (`aud`) in verified tokens.
    pub audience: String,
    /// OAuth client id of the service registered with the provider.
    pub service_id: String,
    /// Redirect URI used when `authorize` is called without an explicit one.
    pub redirect_uri: Option<String>,
    pub jwks_path: String,
    pub authorize_path: String,
    pub token_path: String,
    pub user_info_path: String,
    /// Allowed token signing algorithms. Defaults to exactly `[RS256]`.
    pub algorithms: Vec<Algorithm>,
}

impl AuthlyOptions {
    pub fn new(
        issuer: impl Into<String>,
        audience: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Self {
        let issuer = issuer.into();
        Self {
            issuer: issuer.trim_end_matches('/').to_string(),
            audience: audience.into(),
            service_id: service_id.into(),
            redirect_uri: None,
            jwks_path: DEFAULT_JWKS_PATH.to_string(),
            authorize_path: DEFAULT_AUTHORIZE_PATH.to_string(),
            token_path: DEFAULT_TOKEN_PATH.to_string(),
            user_info_path: DEFAULT_USER_INFO_PATH.to_string(),
            algorithms: vec![Algorithm::RS256],
        }
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    pub fn jwks_url(&self) -> String {
        format!("{}{}", self.issuer, self.jwks_path)
    }

    pub fn authorize_url(&self) -> String {
        format!("{}{}", self.issuer, self.authorize_path)
    }

    pub fn token_url(&self) -> String {
        format!("{}{}", self.issuer, self.token_path)
    }

    pub fn user_info_url(&self) -> String {
        format!("{}{}", self.issuer, self.user_info_path)
    }
}
