use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{CredentialStore, UserDirectory};
use crate::error::{AuthError, StoreError};
use crate::models::api_key::{ApiKeyRecord, IssuedApiKey};
use crate::models::auth::{RefreshedSession, TokenBundle, TokenClaims};
use crate::models::user::User;
use crate::services::token::TokenCodec;

/// Prefix of the shared service-to-service key.
pub const SERVICE_KEY_PREFIX: &str = "svc_";

/// Generate an opaque credential string of `len` alphanumeric characters.
fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Deterministic keyed digest for refresh tokens and API-key secrets.
/// Deterministic on purpose: stored credentials are found by exact hash
/// match, never by scanning.
fn keyed_hash(key: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(b".");
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Token issuance, validation and refresh, plus the service-key and
/// API-key lifecycles.
///
/// A user's session material moves through: no session → authenticated
/// (access + refresh token issued) → refreshed (new pair, old refresh
/// consumed) → revoked. Expected auth failures come back as `None`; only
/// storage failures are errors.
pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    users: Arc<dyn UserDirectory>,
    config: Arc<Config>,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        users: Arc<dyn UserDirectory>,
        config: Arc<Config>,
    ) -> Self {
        Self { store, users, config }
    }

    /// Build and sign an access token for `user`. Stateless: nothing is
    /// persisted, the token carries everything.
    pub fn issue_token(
        &self,
        user: &User,
        custom_claims: serde_json::Map<String, serde_json::Value>,
    ) -> Result<TokenBundle, AuthError> {
        let now = Utc::now().timestamp() as usize;
        let expires_in = self.config.jwt_expiry_seconds;
        let expires_at = now + expires_in as usize;
        let claims = TokenClaims {
            iss: self.config.issuer.clone(),
            iat: now,
            exp: expires_at,
            user_id: user.id,
            username: Some(user.username.clone()),
            email: Some(user.email.clone()),
            roles: user.roles.clone(),
            extra: custom_claims,
        };
        let token = TokenCodec::encode(&claims, self.config.jwt_secret.as_bytes())?;
        Ok(TokenBundle { token, expires_in, expires_at })
    }

    /// Expired and malformed tokens both come back as `None` here; callers
    /// that need the distinction must go through `TokenCodec::decode`.
    pub fn validate_token(&self, token: &str) -> Option<TokenClaims> {
        TokenCodec::decode(token, self.config.jwt_secret.as_bytes()).ok()
    }

    /// Issue a new refresh token for the user, replacing any prior one
    /// (one active refresh token per user). Returns the raw value — only
    /// its keyed hash is stored, so this is the single chance to see it.
    pub async fn issue_refresh_token(&self, user_id: i64) -> Result<String, AuthError> {
        let raw = random_alphanumeric(48);
        let hash = keyed_hash(&self.config.hash_key, &raw);
        let expires_at =
            Utc::now() + Duration::seconds(self.config.refresh_expiry_seconds as i64);
        self.store.save_refresh_token(user_id, &hash, expires_at).await?;
        Ok(raw)
    }

    /// Resolve a raw refresh token to its user. A stored-but-expired token
    /// is deleted on the spot and treated as absent.
    pub async fn validate_refresh_token(&self, raw: &str) -> Result<Option<i64>, AuthError> {
        let hash = keyed_hash(&self.config.hash_key, raw);
        let Some(record) = self.store.find_refresh_token(&hash).await? else {
            return Ok(None);
        };
        if record.expires_at <= Utc::now() {
            self.store.delete_refresh_token(record.user_id).await?;
            return Ok(None);
        }
        Ok(Some(record.user_id))
    }

    /// Exchange a refresh token for a new access + refresh pair.
    /// Rotation-on-use: the presented token is consumed first via the
    /// store's conditional delete, so of two concurrent calls with the same
    /// token at most one succeeds.
    pub async fn refresh_access_token(
        &self,
        raw: &str,
    ) -> Result<Option<RefreshedSession>, AuthError> {
        let hash = keyed_hash(&self.config.hash_key, raw);
        let Some(record) = self.store.consume_refresh_token(&hash).await? else {
            return Ok(None);
        };
        if record.expires_at <= Utc::now() {
            return Ok(None);
        }
        let Some(user) = self.users.find_user(record.user_id).await? else {
            return Ok(None);
        };
        let bundle = self.issue_token(&user, serde_json::Map::new())?;
        let refresh_token = self.issue_refresh_token(user.id).await?;
        Ok(Some(RefreshedSession {
            token: bundle.token,
            refresh_token,
            expires_in: bundle.expires_in,
        }))
    }

    /// Delete the user's refresh token. Outstanding access tokens ride out
    /// their own short expiry — there is no revocation list.
    pub async fn revoke_all(&self, user_id: i64) -> Result<(), AuthError> {
        self.store.delete_refresh_token(user_id).await?;
        Ok(())
    }

    /// Return the current service key, generating one on first use.
    pub async fn ensure_service_key(&self) -> Result<String, AuthError> {
        let state = self.store.service_key_state().await?;
        if let Some(current) = state.current {
            return Ok(current);
        }
        let candidate = format!("{SERVICE_KEY_PREFIX}{}", random_alphanumeric(40));
        self.store.init_service_key(&candidate, Utc::now()).await?;
        // Re-read: a concurrent initializer may have won the set-if-absent.
        let state = self.store.service_key_state().await?;
        state.current.ok_or_else(|| {
            AuthError::Storage(StoreError::Backend("service key missing after init".into()))
        })
    }

    /// Rotate the service key. The outgoing key stays valid as "previous"
    /// until the maintenance sweep clears it after the grace window.
    pub async fn rotate_service_key(&self) -> Result<String, AuthError> {
        let new_key = format!("{SERVICE_KEY_PREFIX}{}", random_alphanumeric(40));
        self.store.rotate_service_key(&new_key, Utc::now()).await?;
        tracing::info!(
            "service API key rotated; outgoing key valid for another {}h",
            self.config.service_key_grace_hours
        );
        Ok(new_key)
    }

    /// Rotate when the configured interval since the last rotation has
    /// passed. Intended to run on a periodic scheduler tick. Returns
    /// whether a rotation happened.
    pub async fn check_rotation_due(&self) -> Result<bool, AuthError> {
        self.check_rotation_due_at(Utc::now()).await
    }

    pub(crate) async fn check_rotation_due_at(&self, now: DateTime<Utc>) -> Result<bool, AuthError> {
        let state = self.store.service_key_state().await?;
        let Some(rotated_at) = state.rotated_at else {
            // Never initialized: generate the first key instead of rotating.
            self.ensure_service_key().await?;
            return Ok(false);
        };
        let interval = Duration::days(self.config.service_key_rotation_days as i64);
        if now >= rotated_at + interval {
            self.rotate_service_key().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Clear the retired key once the grace window after rotation has
    /// passed. Returns whether it was cleared.
    pub async fn purge_retired_service_key(&self) -> Result<bool, AuthError> {
        self.purge_retired_service_key_at(Utc::now()).await
    }

    pub(crate) async fn purge_retired_service_key_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        let state = self.store.service_key_state().await?;
        if state.previous.is_none() {
            return Ok(false);
        }
        let grace = Duration::hours(self.config.service_key_grace_hours as i64);
        let due = state.rotated_at.map_or(true, |rotated_at| now >= rotated_at + grace);
        if due {
            self.store.clear_previous_service_key().await?;
        }
        Ok(due)
    }

    /// True when the candidate equals the current key, or the previous key
    /// while that one is still within its grace window.
    pub async fn validate_service_key(&self, candidate: &str) -> Result<bool, AuthError> {
        let state = self.store.service_key_state().await?;
        Ok(state.current.as_deref() == Some(candidate)
            || state.previous.as_deref() == Some(candidate))
    }

    /// Create a named API key for a user. The returned key and secret are
    /// shown exactly once; only the secret's keyed hash is stored.
    pub async fn create_api_key(
        &self,
        owner_id: i64,
        name: &str,
        permissions: Option<Vec<String>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedApiKey, AuthError> {
        let api_key = random_alphanumeric(32);
        let api_secret = random_alphanumeric(64);
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            api_key: api_key.clone(),
            secret_hash: keyed_hash(&self.config.hash_key, &api_secret),
            name: name.to_string(),
            permissions,
            owner_id,
            expires_at,
            is_active: true,
            last_used_at: None,
            created_at: Utc::now(),
        };
        self.store.insert_api_key(&record).await?;
        Ok(IssuedApiKey { id: record.id, api_key, api_secret })
    }

    /// Look up an API key for authentication: must be active and not past
    /// its expiry. Touches the last-used timestamp on success.
    pub async fn authenticate_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<ApiKeyRecord>, AuthError> {
        let Some(record) = self.store.find_api_key(api_key).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        if !record.is_valid_at(now) {
            return Ok(None);
        }
        self.store.touch_api_key_last_used(api_key, now).await?;
        Ok(Some(record))
    }

    /// Soft-deactivate a key. Pass `owner_id` to scope to that owner;
    /// admin contexts pass `None` and match any key.
    pub async fn revoke_api_key(
        &self,
        id: Uuid,
        owner_id: Option<i64>,
    ) -> Result<bool, AuthError> {
        Ok(self.store.revoke_api_key(id, owner_id).await?)
    }

    /// Hard-delete a key, with the same owner scoping as `revoke_api_key`.
    pub async fn delete_api_key(
        &self,
        id: Uuid,
        owner_id: Option<i64>,
    ) -> Result<bool, AuthError> {
        Ok(self.store.delete_api_key(id, owner_id).await?)
    }

    pub async fn list_api_keys(&self, owner_id: i64) -> Result<Vec<ApiKeyRecord>, AuthError> {
        Ok(self.store.list_api_keys(owner_id).await?)
    }
}
