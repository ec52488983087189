use jsonwebtoken::{decode, decode_header, Algorithm, Validation};

use crate::config::AuthlyOptions;
use crate::error::AuthlyError;
use crate::jwks::KeyResolver;
use crate::types::Claims;

/// Verifies compact JWTs against a key resolver and the configured
/// issuer/audience.
///
/// Every verification ends in exactly one of three outcomes: the decoded
/// claims, `TokenExpired` (the failure is attributable to the `exp` check),
/// or `TokenInvalid` (any other structural, signature, or claim failure).
pub struct TokenVerifier {
    issuer: String,
    audience: String,
    algorithms: Vec<Algorithm>,
    keys: KeyResolver,
}

impl TokenVerifier {
    pub fn new(
        issuer: impl Into<String>,
        audience: impl Into<String>,
        algorithms: Vec<Algorithm>,
        keys: KeyResolver,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            algorithms,
            keys,
        }
    }

    /// Verifier for the configured issuer, fetching keys from its JWKS
    /// endpoint.
    pub fn from_options(options: &AuthlyOptions, http: reqwest::Client) -> Self {
        Self::new(
            options.issuer.clone(),
            options.audience.clone(),
            options.algorithms.clone(),
            KeyResolver::remote(options.jwks_url(), http),
        )
    }

    /// Verify a token and return its claims.
    ///
    /// Validates, in order: the protected header (structure and allowed
    /// algorithm), the signature against the resolved key, `exp` with zero
    /// leeway, exact `iss` match, and `aud` membership.
    pub async fn verify(&self, token: &str) -> Result<Claims, AuthlyError> {
        let header = decode_header(token)
            .map_err(|e| AuthlyError::TokenInvalid(format!("malformed token header: {e}")))?;

        // Never infer or downgrade: the header's algorithm must be allowed.
        if !self.algorithms.contains(&header.alg) {
            return Err(AuthlyError::TokenInvalid(format!(
                "token algorithm {:?} is not allowed",
                header.alg
            )));
        }

        let key = self.keys.resolve(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);

        let data = decode::<Claims>(token, &key, &validation).map_err(map_jwt_error)?;
        Ok(data.claims)
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthlyError {
    match err.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthlyError::TokenExpired,
        _ => AuthlyError::TokenInvalid(err.to_string()),
    }
}
