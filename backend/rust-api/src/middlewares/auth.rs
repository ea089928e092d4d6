use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::services::AppState;

/// Actor identity attached to every attempt request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JwtClaims {
    pub sub: String,  // actor id
    pub role: String, // student, proctor, admin
    pub exp: usize,
    pub iat: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    ExpiredToken,
    #[error("Invalid token signature")]
    InvalidSignature,
}

pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn generate_token(&self, claims: &JwtClaims) -> Result<String, AuthError> {
        encode(&Header::default(), claims, &self.encoding_key).map_err(|_| AuthError::InvalidToken)
    }

    pub fn validate_token(&self, token: &str) -> Result<JwtClaims, AuthError> {
        decode::<JwtClaims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::InvalidToken,
            })
    }
}

/// Requires a valid bearer token and stores its claims as a request extension.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let jwt_service = JwtService::new(&state.config.jwt_secret);
    let claims = jwt_service.validate_token(token).map_err(|e| {
        tracing::warn!("JWT validation failed: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    tracing::debug!("Authenticated actor: {} (role: {})", claims.sub, claims.role);

    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(offset_secs: i64) -> JwtClaims {
        let now = chrono::Utc::now().timestamp();
        JwtClaims {
            sub: "student-42".to_string(),
            role: "student".to_string(),
            exp: (now + offset_secs) as usize,
            iat: now as usize,
        }
    }

    #[test]
    fn test_jwt_generation_and_validation() {
        let service = JwtService::new("test-secret");
        let claims = claims(3600);

        let token = service.generate_token(&claims).unwrap();
        let validated = service.validate_token(&token).unwrap();

        assert_eq!(validated.sub, claims.sub);
        assert_eq!(validated.role, claims.role);
    }

    #[test]
    fn expired_token_is_reported_as_expired() {
        let service = JwtService::new("test-secret");
        let token = service.generate_token(&claims(-3600)).unwrap();
        assert!(matches!(
            service.validate_token(&token),
            Err(AuthError::ExpiredToken)
        ));
    }

    #[test]
    fn foreign_secret_is_rejected() {
        let token = JwtService::new("one").generate_token(&claims(3600)).unwrap();
        assert!(matches!(
            JwtService::new("two").validate_token(&token),
            Err(AuthError::InvalidSignature)
        ));
    }
}
