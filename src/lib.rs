pub mod config;
pub mod error;
pub mod jwks;
pub mod pkce;
pub mod session;
pub mod storage;
pub mod types;
pub mod verifier;

pub use config::AuthlyOptions;
pub use error::AuthlyError;
pub use jwks::KeyResolver;
pub use session::AuthlyClient;
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use types::{
    AuthorizeOptions, AuthorizeUrlOptions, CallbackParams, Claims, SessionToken, TokenResponse,
    UserProfile,
};
pub use verifier::TokenVerifier;

/// One-shot convenience function: verify a token against an issuer's
/// published key set.
pub async fn verify_token(
    options: &AuthlyOptions,
    token: &str,
) -> Result<Claims, AuthlyError> {
    let verifier = TokenVerifier::from_options(options, reqwest::Client::new());
    verifier.verify(token).await
}
