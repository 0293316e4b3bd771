//! Auth - Bearer Token Authentication
//!
//! ## Responsibilities
//!
//! - Verify the admin credentials (bcrypt) and issue HS256 JWTs
//! - Validate bearer tokens on protected endpoints via an extractor
//!
//! Failed logins and bad tokens both surface as a bare 401.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::AppState;

/// Token lifetime.
const TOKEN_TTL_HOURS: i64 = 24;

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

/// Login response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
}

/// Login request body.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// The authenticated principal, extracted from the bearer token.
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub username: String,
}

/// AuthService instance.
pub struct AuthService {
    username: String,
    password_hash: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AuthService {
    /// Build from configuration. With neither a password nor a hash set,
    /// the default dev credentials (`admin` / `admin`) are used and logged.
    pub fn new(
        username: String,
        password: Option<String>,
        password_hash: Option<String>,
        jwt_secret: Option<String>,
    ) -> Result<Self> {
        let password_hash = match (password_hash, password) {
            (Some(hash), _) => hash,
            (None, Some(plain)) => bcrypt::hash(&plain, bcrypt::DEFAULT_COST)
                .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))?,
            (None, None) => {
                tracing::warn!("No admin password configured, using default credentials");
                bcrypt::hash("admin", bcrypt::DEFAULT_COST)
                    .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))?
            }
        };

        let secret = jwt_secret.unwrap_or_else(|| {
            tracing::warn!("No PC_JWT_SECRET configured, tokens will not survive a restart");
            let bytes: [u8; 32] = rand::thread_rng().gen();
            bytes.iter().map(|b| format!("{b:02x}")).collect()
        });

        Ok(Self {
            username,
            password_hash,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        })
    }

    /// Check credentials and mint a token.
    pub fn login(&self, username: &str, password: &str) -> Result<Token> {
        if username != self.username {
            return Err(Error::Unauthorized);
        }
        let ok = bcrypt::verify(password, &self.password_hash).unwrap_or(false);
        if !ok {
            return Err(Error::Unauthorized);
        }

        let claims = Claims {
            sub: username.to_string(),
            exp: (Utc::now() + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
        };
        let access_token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("token encoding failed: {e}")))?;

        tracing::info!(username = %username, "Login succeeded");
        Ok(Token {
            access_token,
            token_type: "bearer".to_string(),
        })
    }

    /// Validate a bearer token and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| Error::Unauthorized)
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    AppState: axum::extract::FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let state = AppState::from_ref(state);
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::Unauthorized)?;

        let token = header.strip_prefix("Bearer ").ok_or(Error::Unauthorized)?;
        let claims = state.auth.verify(token)?;
        Ok(AuthUser {
            username: claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new(
            "admin".to_string(),
            Some("hunter2".to_string()),
            None,
            Some("test-secret".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn login_with_correct_credentials_issues_token() {
        let auth = service();
        let token = auth.login("admin", "hunter2").unwrap();
        assert_eq!(token.token_type, "bearer");

        let claims = auth.verify(&token.access_token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn wrong_password_is_unauthorized() {
        let auth = service();
        assert!(matches!(
            auth.login("admin", "wrong").unwrap_err(),
            Error::Unauthorized
        ));
    }

    #[test]
    fn unknown_user_is_unauthorized() {
        let auth = service();
        assert!(matches!(
            auth.login("root", "hunter2").unwrap_err(),
            Error::Unauthorized
        ));
    }

    #[test]
    fn garbage_token_is_unauthorized() {
        let auth = service();
        assert!(matches!(
            auth.verify("not-a-token").unwrap_err(),
            Error::Unauthorized
        ));
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let auth = service();
        let other = AuthService::new(
            "admin".to_string(),
            Some("hunter2".to_string()),
            None,
            Some("different-secret".to_string()),
        )
        .unwrap();
        let token = other.login("admin", "hunter2").unwrap();
        assert!(auth.verify(&token.access_token).is_err());
    }

    #[test]
    fn prehashed_password_is_accepted() {
        let hash = bcrypt::hash("s3cret", bcrypt::DEFAULT_COST).unwrap();
        let auth = AuthService::new(
            "admin".to_string(),
            None,
            Some(hash),
            Some("test-secret".to_string()),
        )
        .unwrap();
        assert!(auth.login("admin", "s3cret").is_ok());
    }
}
