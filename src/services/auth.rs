//! Bearer-token verification against the identity provider.
//!
//! The IdP issues RS256 tokens; this module fetches its JWKS with a TTL
//! cache, validates signature/issuer/audience, and checks the configured
//! role set. Handlers consume the resulting [`Claims`], never raw tokens.

use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::AuthConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealmAccess {
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub realm_access: RealmAccess,
    pub exp: usize,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.realm_access.roles.iter().any(|r| r == role)
    }

    pub fn has_any_role(&self, required: &[String]) -> bool {
        required.iter().any(|role| self.has_role(role))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    #[serde(default)]
    kty: String,
    n: String,
    e: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Clone)]
pub struct AuthVerifier {
    config: AuthConfig,
    client: reqwest::Client,
    cache: Arc<RwLock<Option<(Jwks, Instant)>>>,
}

impl AuthVerifier {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            cache: Arc::new(RwLock::new(None)),
        }
    }

    async fn cached_jwks(&self) -> Option<Jwks> {
        let ttl = Duration::from_secs(self.config.jwks_cache_ttl_seconds);
        let guard = self.cache.read().await;
        guard
            .as_ref()
            .filter(|(_, fetched)| fetched.elapsed() < ttl)
            .map(|(jwks, _)| jwks.clone())
    }

    async fn fetch_jwks(&self) -> AppResult<Jwks> {
        let jwks = self
            .client
            .get(&self.config.jwks_url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AppError::ServiceUnavailable(format!("JWKS fetch failed: {}", e)))?
            .json::<Jwks>()
            .await?;

        *self.cache.write().await = Some((jwks.clone(), Instant::now()));
        Ok(jwks)
    }

    async fn find_key(&self, kid: &str) -> AppResult<Jwk> {
        if let Some(jwks) = self.cached_jwks().await {
            if let Some(jwk) = jwks.keys.iter().find(|k| k.kid == kid) {
                return Ok(jwk.clone());
            }
        }

        // Unknown kid: the IdP may have rotated keys, so refresh once.
        let jwks = self.fetch_jwks().await?;
        jwks.keys
            .iter()
            .find(|k| k.kid == kid)
            .cloned()
            .ok_or(AppError::Unauthorized)
    }

    /// Validate the token and enforce the required role set.
    pub async fn verify(&self, token: &str) -> AppResult<Claims> {
        let header = decode_header(token)?;
        let kid = header.kid.ok_or(AppError::Unauthorized)?;
        let jwk = self.find_key(&kid).await?;

        if !jwk.kty.is_empty() && jwk.kty != "RSA" {
            return Err(AppError::Unauthorized);
        }

        let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);

        let data = decode::<Claims>(token, &key, &validation)?;

        if !data.claims.has_any_role(&self.config.required_roles) {
            return Err(AppError::Forbidden);
        }

        Ok(data.claims)
    }

    pub fn admin_role(&self) -> &str {
        &self.config.admin_role
    }
}
