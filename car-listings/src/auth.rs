//! Password hashing (bcrypt) and session tokens (JWT, HS256) with an optional Redis whitelist.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::http::HeaderMap;
use bcrypt::{hash, verify};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::task;
use uuid::Uuid;

use crate::models::AppError;

/// bcrypt work factor used for stored passwords.
pub const PASSWORD_COST: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: usize,
    pub exp: usize,
    pub jti: String,
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn hash_password(&self, password: String) -> Result<String, AppError>;
    async fn verify_password(&self, password: String, hash: String) -> Result<bool, AppError>;
    async fn generate_token(&self, user_id: Uuid) -> Result<String, AppError>;
    async fn validate_token(&self, token: &str) -> Result<Claims, AppError>;
    async fn logout(&self, token: &str) -> Result<(), AppError>;
    async fn user_id_from_token(&self, token: &str) -> Result<Uuid, AppError> {
        let claims = self.validate_token(token).await?;
        Uuid::parse_str(&claims.sub).map_err(|_| AppError::Unauthorized("malformed token subject".into()))
    }
}

/// JWT issuer; when a Redis client is present every issued `jti` is whitelisted until expiry
/// and logout revokes it.
#[derive(Clone)]
pub struct HybridAuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiry_hours: i64,
    cost: u32,
    redis: Option<redis::Client>,
}

impl HybridAuthService {
    pub fn new(secret: &str, expiry_hours: i64, redis: Option<redis::Client>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expiry_hours,
            cost: PASSWORD_COST,
            redis,
        }
    }

    pub fn with_cost(mut self, cost: u32) -> Self { self.cost = cost; self }

    fn now_secs() -> usize { SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as usize }

    fn session_key(jti: &str) -> String { format!("session:{}", jti) }

    fn decode_claims(&self, token: &str) -> Result<Claims, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| AppError::Unauthorized(format!("invalid token: {}", e)))
    }
}

#[async_trait]
impl AuthService for HybridAuthService {
    async fn hash_password(&self, password: String) -> Result<String, AppError> {
        let cost = self.cost;
        // Bcrypt is CPU-bound; keep it off the async workers.
        let hashed = task::spawn_blocking(move || hash(password, cost)).await.map_err(|e| AppError::Bcrypt(e.to_string()))??;
        Ok(hashed)
    }

    async fn verify_password(&self, password: String, hash_value: String) -> Result<bool, AppError> {
        let ok = task::spawn_blocking(move || verify(password, &hash_value)).await.map_err(|e| AppError::Bcrypt(e.to_string()))??;
        Ok(ok)
    }

    async fn generate_token(&self, user_id: Uuid) -> Result<String, AppError> {
        let iat = Self::now_secs();
        let exp = (Utc::now() + Duration::hours(self.expiry_hours)).timestamp() as usize;
        let jti = Uuid::new_v4().to_string();
        let claims = Claims { sub: user_id.to_string(), iat, exp, jti: jti.clone() };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        if let Some(client) = &self.redis {
            let ttl: u64 = (exp as i64 - iat as i64).max(1).try_into().unwrap_or(1);
            let mut conn = client.get_async_connection().await.map_err(|e| AppError::Repo(e.to_string()))?;
            let _: () = conn.set_ex(Self::session_key(&jti), user_id.to_string(), ttl).await.map_err(|e| AppError::Repo(e.to_string()))?;
        }
        Ok(token)
    }

    async fn validate_token(&self, token: &str) -> Result<Claims, AppError> {
        let claims = self.decode_claims(token)?;
        if let Some(client) = &self.redis {
            let mut conn = client.get_async_connection().await.map_err(|e| AppError::Repo(e.to_string()))?;
            let exists: bool = conn.exists(Self::session_key(&claims.jti)).await.map_err(|e| AppError::Repo(e.to_string()))?;
            if !exists { return Err(AppError::Unauthorized("token revoked or expired".into())); }
        }
        Ok(claims)
    }

    async fn logout(&self, token: &str) -> Result<(), AppError> {
        let claims = self.decode_claims(token)?;
        if let Some(client) = &self.redis {
            let mut conn = client.get_async_connection().await.map_err(|e| AppError::Repo(e.to_string()))?;
            let _: () = conn.del(Self::session_key(&claims.jti)).await.map_err(|e| AppError::Repo(e.to_string()))?;
        }
        Ok(())
    }
}

/// Extract bearer token from the Authorization header.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers.get(axum::http::header::AUTHORIZATION).and_then(|h| h.to_str().ok()).and_then(|v| v.strip_prefix("Bearer ")).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_round_trip() {
        let svc = HybridAuthService::new("secret", 1, None);
        let uid = Uuid::new_v4();
        let token = svc.generate_token(uid).await.unwrap();
        assert_eq!(svc.user_id_from_token(&token).await.unwrap(), uid);
    }

    #[tokio::test]
    async fn token_from_other_secret_is_rejected() {
        let issuer = HybridAuthService::new("secret-a", 1, None);
        let verifier = HybridAuthService::new("secret-b", 1, None);
        let token = issuer.generate_token(Uuid::new_v4()).await.unwrap();
        assert!(matches!(verifier.validate_token(&token).await, Err(AppError::Unauthorized(_))));
        assert!(matches!(verifier.validate_token("not-a-jwt").await, Err(AppError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn password_hash_verify() {
        let svc = HybridAuthService::new("secret", 1, None).with_cost(4);
        let hash = svc.hash_password("Password1".into()).await.unwrap();
        assert!(svc.verify_password("Password1".into(), hash.clone()).await.unwrap());
        assert!(!svc.verify_password("Password2".into(), hash).await.unwrap());
    }

    /// Needs a live Redis at `REDIS_URL`; skipped otherwise.
    #[tokio::test]
    async fn logout_revokes_whitelisted_token() {
        let Ok(url) = std::env::var("REDIS_URL") else { return };
        let Ok(client) = redis::Client::open(url) else { return };
        if client.get_async_connection().await.is_err() { return; }

        let svc = HybridAuthService::new("secret", 1, Some(client.clone()));
        let uid = Uuid::new_v4();
        let token = svc.generate_token(uid).await.unwrap();
        let claims = svc.validate_token(&token).await.unwrap();
        let mut conn = client.get_async_connection().await.unwrap();
        let stored: String = conn.get(HybridAuthService::session_key(&claims.jti)).await.unwrap();
        assert_eq!(stored, uid.to_string());

        svc.logout(&token).await.unwrap();
        assert!(matches!(svc.validate_token(&token).await, Err(AppError::Unauthorized(_))));
        let exists: bool = conn.exists(HybridAuthService::session_key(&claims.jti)).await.unwrap();
        assert!(!exists);
    }

    #[test]
    fn default_cost_is_ten() {
        assert_eq!(PASSWORD_COST, 10);
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_from_headers(&headers).is_none());
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_from_headers(&headers).as_deref(), Some("abc.def"));
        headers.insert(axum::http::header::AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert!(bearer_from_headers(&headers).is_none());
    }
}
