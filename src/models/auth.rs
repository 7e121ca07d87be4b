use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Claims embedded in the access token payload.
///
/// `iat`/`exp` are Unix seconds. `extra` carries caller-supplied custom
/// claims and is flattened into the payload, so the wire format stays a flat
/// JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub iat: usize,
    pub exp: usize,
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// What `issue_token` hands back: the compact token plus expiry metadata.
#[derive(Debug, Clone, Serialize)]
pub struct TokenBundle {
    pub token: String,
    pub expires_in: u64,
    pub expires_at: usize,
}

/// Result of a successful refresh: a new access token and a new single-use
/// refresh token (the old one is consumed).
#[derive(Debug, Clone, Serialize)]
pub struct RefreshedSession {
    pub token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

/// DB row for a stored refresh token. Only the keyed hash is persisted;
/// one row per user (issuing a new token overwrites the old row).
#[derive(Debug, Clone, FromRow)]
pub struct RefreshTokenRecord {
    pub user_id: i64,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// The current/previous service-key pair. At most two keys validate at any
/// time; `previous` is cleared by the maintenance sweep once the grace
/// window after `rotated_at` has passed.
#[derive(Debug, Clone, Default, FromRow)]
pub struct ServiceKeyState {
    pub current: Option<String>,
    pub previous: Option<String>,
    pub rotated_at: Option<DateTime<Utc>>,
}

/// The authenticated principal of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// Internal service-to-service caller. Synthetic identity with the full
    /// capability set; never persisted as a user.
    ServiceAccount,
    User { id: i64 },
    Anonymous,
}

/// Established by the request authenticator before any business logic runs.
/// `claims` is populated only for bearer-token authentication.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: Subject,
    pub claims: Option<TokenClaims>,
}

impl AuthContext {
    pub fn service() -> Self {
        Self { subject: Subject::ServiceAccount, claims: None }
    }

    pub fn user(id: i64) -> Self {
        Self { subject: Subject::User { id }, claims: None }
    }

    pub fn anonymous() -> Self {
        Self { subject: Subject::Anonymous, claims: None }
    }

    pub fn user_id(&self) -> Option<i64> {
        match self.subject {
            Subject::User { id } => Some(id),
            _ => None,
        }
    }
}
