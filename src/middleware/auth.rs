use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};

use crate::error::AuthError;
use crate::models::auth::{AuthContext, Subject};
use crate::services::auth::AuthService;
use crate::services::permission::PermissionEngine;

/// Header carrying service and user API keys.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Establishes the authentication context for every incoming request,
/// before any business logic runs.
///
/// Credential priority is fixed: service key, then user API key, then
/// bearer token. Exactly one wins; they are never merged.
pub struct RequestAuthenticator {
    auth: Arc<AuthService>,
    permissions: Arc<PermissionEngine>,
}

impl RequestAuthenticator {
    pub fn new(auth: Arc<AuthService>, permissions: Arc<PermissionEngine>) -> Self {
        Self { auth, permissions }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        if let Some(candidate) = header_value(headers, API_KEY_HEADER) {
            if self.auth.validate_service_key(candidate).await? {
                return Ok(AuthContext::service());
            }
            // The same header carries user API keys; a value that fails the
            // service comparison is retried as a user key. The two
            // namespaces are told apart by successful validation, not by
            // format.
            if let Some(record) = self.auth.authenticate_api_key(candidate).await? {
                return Ok(AuthContext::user(record.owner_id));
            }
        }

        if let Some(header) = header_value(headers, "authorization") {
            if let Some(token) = header.strip_prefix("Bearer ") {
                if let Some(claims) = self.auth.validate_token(token) {
                    return Ok(AuthContext {
                        subject: Subject::User { id: claims.user_id },
                        claims: Some(claims),
                    });
                }
            }
        }

        Err(AuthError::Unauthenticated)
    }

    /// Authorization decision for an established context. Keeps "not
    /// authenticated" and "not authorized" distinct.
    pub async fn authorize(
        &self,
        context: &AuthContext,
        resource: &str,
        permission: &str,
    ) -> Result<(), AuthError> {
        match context.subject {
            Subject::ServiceAccount => Ok(()),
            Subject::User { id } => {
                if self.permissions.has_permission(id, resource, permission).await? {
                    Ok(())
                } else {
                    Err(AuthError::InsufficientPermission)
                }
            }
            Subject::Anonymous => Err(AuthError::Unauthenticated),
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn rejection(err: AuthError) -> (StatusCode, &'static str) {
    match err {
        AuthError::Unauthenticated | AuthError::InvalidToken | AuthError::TokenExpired => {
            (StatusCode::UNAUTHORIZED, "Missing or invalid credentials")
        }
        AuthError::InsufficientPermission => {
            (StatusCode::FORBIDDEN, "Insufficient permission")
        }
        AuthError::Storage(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Credential store unavailable")
        }
    }
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let authenticator = parts
            .extensions
            .get::<Arc<RequestAuthenticator>>()
            .cloned()
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "Request authenticator not configured"))?;

        authenticator.authenticate(&parts.headers).await.map_err(rejection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::memory::{MemoryCredentialStore, MemoryUserDirectory};
    use crate::models::user::User;
    use axum::http::HeaderValue;
    use chrono::Utc;

    struct Fixture {
        auth: Arc<AuthService>,
        users: Arc<MemoryUserDirectory>,
        authenticator: RequestAuthenticator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryCredentialStore::new());
        let users = Arc::new(MemoryUserDirectory::new());
        let config = Arc::new(Config {
            jwt_secret: "unit-test-jwt-secret".into(),
            hash_key: "unit-test-hash-key".into(),
            issuer: "https://clubhouse.local".into(),
            jwt_expiry_seconds: 900,
            refresh_expiry_seconds: 604_800,
            service_key_rotation_days: 30,
            service_key_grace_hours: 24,
        });
        let auth = Arc::new(AuthService::new(store.clone(), users.clone(), config));
        let permissions = Arc::new(PermissionEngine::new(store, users.clone()));
        let authenticator = RequestAuthenticator::new(auth.clone(), permissions);
        Fixture { auth, users, authenticator }
    }

    fn test_user(id: i64, roles: &[&str]) -> User {
        User {
            id,
            username: format!("user{id}"),
            email: format!("user{id}@example.org"),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn headers_with(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[tokio::test]
    async fn no_credentials_is_unauthenticated() {
        let f = fixture();
        let result = f.authenticator.authenticate(&HeaderMap::new()).await;
        assert!(matches!(result, Err(AuthError::Unauthenticated)));
    }

    #[tokio::test]
    async fn service_key_outranks_a_bearer_token() {
        let f = fixture();
        f.users.add_user(test_user(42, &["coach"]));
        let service_key = f.auth.ensure_service_key().await.unwrap();
        let bundle = f
            .auth
            .issue_token(&test_user(42, &["coach"]), serde_json::Map::new())
            .unwrap();

        let headers = headers_with(&[
            (API_KEY_HEADER, service_key.as_str()),
            ("authorization", &format!("Bearer {}", bundle.token)),
        ]);
        let context = f.authenticator.authenticate(&headers).await.unwrap();
        assert_eq!(context.subject, Subject::ServiceAccount);
    }

    #[tokio::test]
    async fn user_api_key_binds_the_owning_user() {
        let f = fixture();
        let issued = f.auth.create_api_key(7, "ci-bot", None, None).await.unwrap();

        let headers = headers_with(&[(API_KEY_HEADER, issued.api_key.as_str())]);
        let context = f.authenticator.authenticate(&headers).await.unwrap();
        assert_eq!(context.subject, Subject::User { id: 7 });
        assert!(context.claims.is_none());
    }

    #[tokio::test]
    async fn unrecognized_api_key_falls_through_to_the_bearer_token() {
        let f = fixture();
        f.auth.ensure_service_key().await.unwrap();
        let bundle = f
            .auth
            .issue_token(&test_user(42, &["coach"]), serde_json::Map::new())
            .unwrap();

        let headers = headers_with(&[
            (API_KEY_HEADER, "svc_not-a-real-key"),
            ("authorization", &format!("Bearer {}", bundle.token)),
        ]);
        let context = f.authenticator.authenticate(&headers).await.unwrap();
        assert_eq!(context.subject, Subject::User { id: 42 });
    }

    #[tokio::test]
    async fn bearer_token_carries_its_claims_into_the_context() {
        let f = fixture();
        let bundle = f
            .auth
            .issue_token(&test_user(42, &["coach"]), serde_json::Map::new())
            .unwrap();

        let headers =
            headers_with(&[("authorization", &format!("Bearer {}", bundle.token))]);
        let context = f.authenticator.authenticate(&headers).await.unwrap();
        assert_eq!(context.subject, Subject::User { id: 42 });
        assert_eq!(context.claims.unwrap().user_id, 42);
    }

    #[tokio::test]
    async fn malformed_bearer_header_is_unauthenticated() {
        let f = fixture();
        let headers = headers_with(&[("authorization", "Token abc")]);
        assert!(matches!(
            f.authenticator.authenticate(&headers).await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn authorize_keeps_401_and_403_distinct() {
        let f = fixture();
        f.users.add_user(test_user(5, &["coach"]));

        let service = AuthContext::service();
        assert!(f.authenticator.authorize(&service, "inventory", "delete").await.is_ok());

        let user = AuthContext::user(5);
        assert!(matches!(
            f.authenticator.authorize(&user, "inventory", "delete").await,
            Err(AuthError::InsufficientPermission)
        ));

        let anonymous = AuthContext::anonymous();
        assert!(matches!(
            f.authenticator.authorize(&anonymous, "inventory", "view").await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn rotated_out_service_key_falls_back_to_user_key_lookup_and_misses() {
        let f = fixture();
        let old_key = f.auth.ensure_service_key().await.unwrap();
        f.auth.rotate_service_key().await.unwrap();
        f.auth.purge_retired_service_key_at(Utc::now() + chrono::Duration::hours(25))
            .await
            .unwrap();

        let headers = headers_with(&[(API_KEY_HEADER, old_key.as_str())]);
        assert!(matches!(
            f.authenticator.authenticate(&headers).await,
            Err(AuthError::Unauthenticated)
        ));
    }
}
