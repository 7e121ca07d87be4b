use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored per-user API key. The secret is persisted only as a keyed hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub api_key: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub name: String,
    pub permissions: Option<Vec<String>>,
    pub owner_id: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    /// Whether the key validates at `now`: active, and not past its expiry.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Returned exactly once, at creation. The plaintext key and secret cannot
/// be recovered later — only the secret's hash is stored.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedApiKey {
    pub id: Uuid,
    pub api_key: String,
    pub api_secret: String,
}
