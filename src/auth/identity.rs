use async_trait::async_trait;
use axum::http::{self, HeaderMap};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::AuthError;

/// Name of the cookie the web client stores its token in
pub const AUTH_COOKIE: &str = "auth_token";

/// The authenticated identity behind a connection or request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Claims issued by the identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub sub: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verify a token and return its claims
    async fn verify(&self, token: &str) -> Result<IdentityClaims, AuthError>;
}

/// HS256 JWT verification
pub struct JwtIdentityProvider {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityProvider {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn verify(&self, token: &str) -> Result<IdentityClaims, AuthError> {
        decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                // The reason is only logged, never returned
                debug!("JWT validation failed: {}", e);
                AuthError
            })
    }
}

/// Sign a token with the shared secret. Used by tooling and tests that stand
/// in for the identity provider.
pub fn issue_token(secret: &str, claims: &IdentityClaims) -> Result<String, jsonwebtoken::errors::Error> {
    encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_bytes()))
}

/// Turns a presented credential into a [`Principal`].
pub struct IdentityGate {
    provider: Arc<dyn IdentityProvider>,
    /// token -> (principal, exp)
    verified: Cache<String, (Principal, i64)>,
}

impl IdentityGate {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        let verified = Cache::builder()
            .max_capacity(100_000)
            .time_to_idle(Duration::from_secs(5 * 60))
            .build();
        info!("Identity cache initialized");
        Self { provider, verified }
    }

    /// Every failure collapses into the same [`AuthError`].
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Principal, AuthError> {
        let token = credential.map(str::trim).filter(|t| !t.is_empty()).ok_or(AuthError)?;
        let now = Utc::now().timestamp();

        if let Some((principal, exp)) = self.verified.get(token).await {
            if exp > now {
                return Ok(principal);
            }
            self.verified.invalidate(token).await;
            return Err(AuthError);
        }

        let claims = self.provider.verify(token).await?;
        if claims.exp <= now || claims.sub.trim().is_empty() {
            return Err(AuthError);
        }

        let display_name = if claims.name.trim().is_empty() {
            claims.sub.clone()
        } else {
            claims.name.trim().to_string()
        };
        let principal = Principal {
            id: claims.sub,
            display_name,
            email: claims.email,
            roles: claims.roles,
        };
        self.verified
            .insert(token.to_string(), (principal.clone(), claims.exp))
            .await;
        Ok(principal)
    }
}

/// Get the auth token from request headers: `Authorization: Bearer` first,
/// then the auth cookie.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth_header) = headers.get(http::header::AUTHORIZATION) {
        let auth_str = auth_header.to_str().ok()?;
        return Some(auth_str.strip_prefix("Bearer ").unwrap_or(auth_str).trim().to_string());
    }

    let cookie_header = headers.get(http::header::COOKIE)?.to_str().ok()?;
    cookie::Cookie::split_parse(cookie_header)
        .filter_map(Result::ok)
        .find(|c| c.name() == AUTH_COOKIE)
        .map(|c| c.value().to_string())
}
