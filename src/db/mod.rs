pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::api_key::ApiKeyRecord;
use crate::models::auth::{RefreshTokenRecord, ServiceKeyState};
use crate::models::permission::{AuditEntry, ResourceDef, RolePermission, UserOverride};
use crate::models::user::User;

pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run the migrations embedded in ./migrations/
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Durable storage for credential material and permission rules.
///
/// All lookups are exact-match. Every write failure surfaces as a
/// [`StoreError`]; callers must not assume a failed write left anything
/// behind.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    // Refresh tokens: one row per user, upsert replaces any prior token.
    async fn save_refresh_token(
        &self,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError>;
    /// Delete-if-matches on the stored hash, returning the deleted row.
    /// This is the concurrency primitive behind single-use refresh tokens:
    /// of two concurrent calls with the same hash, at most one gets the row.
    async fn consume_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError>;
    async fn delete_refresh_token(&self, user_id: i64) -> Result<(), StoreError>;
    async fn purge_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    // Service key: a single current/previous pair plus rotation timestamp.
    async fn service_key_state(&self) -> Result<ServiceKeyState, StoreError>;
    /// Set-if-absent; a no-op when a current key already exists.
    async fn init_service_key(&self, value: &str, now: DateTime<Utc>) -> Result<(), StoreError>;
    /// Atomic promote: previous ← current, current ← `new_key`. There is
    /// never a state in which zero keys validate.
    async fn rotate_service_key(&self, new_key: &str, now: DateTime<Utc>)
        -> Result<(), StoreError>;
    async fn clear_previous_service_key(&self) -> Result<(), StoreError>;

    // Per-user API keys.
    async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), StoreError>;
    async fn find_api_key(&self, api_key: &str) -> Result<Option<ApiKeyRecord>, StoreError>;
    async fn touch_api_key_last_used(
        &self,
        api_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Soft-deactivate. With `owner_id` set, only that owner's key matches.
    async fn revoke_api_key(&self, id: Uuid, owner_id: Option<i64>) -> Result<bool, StoreError>;
    /// Hard delete, same owner scoping as `revoke_api_key`.
    async fn delete_api_key(&self, id: Uuid, owner_id: Option<i64>) -> Result<bool, StoreError>;
    async fn list_api_keys(&self, owner_id: i64) -> Result<Vec<ApiKeyRecord>, StoreError>;
    async fn deactivate_expired_api_keys(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    // User overrides, unique per (user, resource, permission).
    async fn find_user_override(
        &self,
        user_id: i64,
        resource: &str,
        permission: &str,
    ) -> Result<Option<UserOverride>, StoreError>;
    async fn upsert_user_override(&self, row: &UserOverride) -> Result<(), StoreError>;
    async fn delete_user_override(
        &self,
        user_id: i64,
        resource: &str,
        permission: &str,
    ) -> Result<bool, StoreError>;
    async fn list_user_overrides(&self, user_id: i64) -> Result<Vec<UserOverride>, StoreError>;
    async fn purge_expired_overrides(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    // Role permissions, unique per (role, resource, permission).
    async fn find_role_permission(
        &self,
        role_slug: &str,
        resource: &str,
        permission: &str,
    ) -> Result<Option<RolePermission>, StoreError>;
    async fn upsert_role_permission(&self, row: &RolePermission) -> Result<(), StoreError>;
    async fn list_role_permissions(&self) -> Result<Vec<RolePermission>, StoreError>;

    // Resource registry.
    async fn upsert_resource(&self, def: &ResourceDef) -> Result<(), StoreError>;
    async fn list_resources(&self) -> Result<Vec<ResourceDef>, StoreError>;

    // Append-only audit log.
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
    async fn list_audit(&self, limit: i64, offset: i64) -> Result<Vec<AuditEntry>, StoreError>;
}

/// Lookup into the host application's user base. The user table itself
/// belongs to the host; this crate only needs id, username, email and the
/// ordered role list. Implementations must preserve role attachment order —
/// permission resolution depends on it.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: i64) -> Result<Option<User>, StoreError>;
}
