//! Static bearer-token check for the HTTP command routes.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::error::ApiError;

pub struct BearerAuth {
    token: Option<SecretString>,
}

impl BearerAuth {
    /// `None` disables the check.
    pub fn new(token: Option<SecretString>) -> Self {
        let token = token.filter(|t| !t.expose_secret().is_empty());
        Self { token }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Check an `Authorization` header value.
    pub fn verify(&self, header: Option<&str>) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };
        header
            .and_then(|h| h.strip_prefix("Bearer "))
            .is_some_and(|presented| constant_time_eq(presented.trim(), expected.expose_secret()))
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Middleware rejecting requests without the configured bearer token.
pub async fn require_bearer(
    State(auth): State<Arc<BearerAuth>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !auth.verify(header) {
        tracing::debug!(path = %request.uri().path(), "rejected unauthenticated request");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(token: &str) -> BearerAuth {
        BearerAuth::new(Some(SecretString::from(token.to_string())))
    }

    #[test]
    fn disabled_accepts_anything() {
        let auth = BearerAuth::new(None);
        assert!(!auth.is_enabled());
        assert!(auth.verify(None));
        assert!(auth.verify(Some("Bearer whatever")));
    }

    #[test]
    fn empty_token_disables_auth() {
        assert!(!auth("").is_enabled());
    }

    #[test]
    fn accepts_matching_token() {
        assert!(auth("s3cret").verify(Some("Bearer s3cret")));
    }

    #[test]
    fn rejects_missing_wrong_or_malformed() {
        let auth = auth("s3cret");
        assert!(!auth.verify(None));
        assert!(!auth.verify(Some("Bearer s3cre")));
        assert!(!auth.verify(Some("Bearer s3cret-longer")));
        assert!(!auth.verify(Some("Basic s3cret")));
        assert!(!auth.verify(Some("s3cret")));
    }
}
