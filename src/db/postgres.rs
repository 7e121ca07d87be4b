use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::CredentialStore;
use crate::error::StoreError;
use crate::models::api_key::ApiKeyRecord;
use crate::models::auth::{RefreshTokenRecord, ServiceKeyState};
use crate::models::permission::{AuditEntry, ResourceDef, RolePermission, UserOverride};

/// Postgres-backed credential store over the tables in ./migrations/.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// The permission list is stored as JSON text (nullable column).
fn api_key_from_row(row: &sqlx::postgres::PgRow) -> Result<ApiKeyRecord, StoreError> {
    let permissions: Option<String> = row.try_get("permissions")?;
    let permissions = match permissions {
        Some(raw) => serde_json::from_str(&raw).ok(),
        None => None,
    };
    Ok(ApiKeyRecord {
        id: row.try_get("id")?,
        api_key: row.try_get("api_key")?,
        secret_hash: row.try_get("secret_hash")?,
        name: row.try_get("name")?,
        permissions,
        owner_id: row.try_get("owner_id")?,
        expires_at: row.try_get("expires_at")?,
        is_active: row.try_get("is_active")?,
        last_used_at: row.try_get("last_used_at")?,
        created_at: row.try_get("created_at")?,
    })
}

const API_KEY_COLUMNS: &str = "id, api_key, secret_hash, name, permissions, owner_id, \
     expires_at, is_active, last_used_at, created_at";

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn save_refresh_token(
        &self,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO auth_refresh_tokens (user_id, token_hash, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (user_id)
             DO UPDATE SET token_hash = EXCLUDED.token_hash,
                           expires_at = EXCLUDED.expires_at,
                           created_at = NOW()",
        )
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let record = sqlx::query_as::<_, RefreshTokenRecord>(
            "SELECT user_id, token_hash, expires_at
             FROM auth_refresh_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn consume_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let record = sqlx::query_as::<_, RefreshTokenRecord>(
            "DELETE FROM auth_refresh_tokens WHERE token_hash = $1
             RETURNING user_id, token_hash, expires_at",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn delete_refresh_token(&self, user_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM auth_refresh_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM auth_refresh_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn service_key_state(&self) -> Result<ServiceKeyState, StoreError> {
        let state = sqlx::query_as::<_, ServiceKeyState>(
            "SELECT current_key AS current, previous_key AS previous, rotated_at
             FROM auth_service_key WHERE id = TRUE",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(state.unwrap_or_default())
    }

    async fn init_service_key(&self, value: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE auth_service_key
             SET current_key = $1, rotated_at = $2
             WHERE id = TRUE AND current_key IS NULL",
        )
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rotate_service_key(
        &self,
        new_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // Single statement: the demote and the promote are never observable
        // separately, so some key always validates.
        sqlx::query(
            "UPDATE auth_service_key
             SET previous_key = current_key, current_key = $1, rotated_at = $2
             WHERE id = TRUE",
        )
        .bind(new_key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_previous_service_key(&self) -> Result<(), StoreError> {
        sqlx::query("UPDATE auth_service_key SET previous_key = NULL WHERE id = TRUE")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), StoreError> {
        let permissions = match &record.permissions {
            Some(list) => Some(serde_json::to_string(list).map_err(|e| {
                StoreError::Backend(format!("permission list not serializable: {e}"))
            })?),
            None => None,
        };
        sqlx::query(
            "INSERT INTO auth_api_keys
                (id, api_key, secret_hash, name, permissions, owner_id,
                 expires_at, is_active, last_used_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(record.id)
        .bind(&record.api_key)
        .bind(&record.secret_hash)
        .bind(&record.name)
        .bind(permissions)
        .bind(record.owner_id)
        .bind(record.expires_at)
        .bind(record.is_active)
        .bind(record.last_used_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_api_key(&self, api_key: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {API_KEY_COLUMNS} FROM auth_api_keys WHERE api_key = $1"
        ))
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(api_key_from_row).transpose()
    }

    async fn touch_api_key_last_used(
        &self,
        api_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE auth_api_keys SET last_used_at = $2 WHERE api_key = $1")
            .bind(api_key)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke_api_key(&self, id: Uuid, owner_id: Option<i64>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE auth_api_keys SET is_active = FALSE
             WHERE id = $1 AND ($2::BIGINT IS NULL OR owner_id = $2)",
        )
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_api_key(&self, id: Uuid, owner_id: Option<i64>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM auth_api_keys
             WHERE id = $1 AND ($2::BIGINT IS NULL OR owner_id = $2)",
        )
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_api_keys(&self, owner_id: i64) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {API_KEY_COLUMNS} FROM auth_api_keys
             WHERE owner_id = $1 ORDER BY created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(api_key_from_row).collect()
    }

    async fn deactivate_expired_api_keys(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE auth_api_keys SET is_active = FALSE
             WHERE is_active = TRUE AND expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_user_override(
        &self,
        user_id: i64,
        resource: &str,
        permission: &str,
    ) -> Result<Option<UserOverride>, StoreError> {
        let row = sqlx::query_as::<_, UserOverride>(
            "SELECT user_id, resource, permission, granted, expires_at, reason, granted_by
             FROM auth_user_overrides
             WHERE user_id = $1 AND resource = $2 AND permission = $3",
        )
        .bind(user_id)
        .bind(resource)
        .bind(permission)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_user_override(&self, row: &UserOverride) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO auth_user_overrides
                (user_id, resource, permission, granted, expires_at, reason, granted_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (user_id, resource, permission)
             DO UPDATE SET granted = EXCLUDED.granted,
                           expires_at = EXCLUDED.expires_at,
                           reason = EXCLUDED.reason,
                           granted_by = EXCLUDED.granted_by,
                           updated_at = NOW()",
        )
        .bind(row.user_id)
        .bind(&row.resource)
        .bind(&row.permission)
        .bind(row.granted)
        .bind(row.expires_at)
        .bind(&row.reason)
        .bind(row.granted_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_user_override(
        &self,
        user_id: i64,
        resource: &str,
        permission: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM auth_user_overrides
             WHERE user_id = $1 AND resource = $2 AND permission = $3",
        )
        .bind(user_id)
        .bind(resource)
        .bind(permission)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_user_overrides(&self, user_id: i64) -> Result<Vec<UserOverride>, StoreError> {
        let rows = sqlx::query_as::<_, UserOverride>(
            "SELECT user_id, resource, permission, granted, expires_at, reason, granted_by
             FROM auth_user_overrides
             WHERE user_id = $1 ORDER BY resource, permission",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn purge_expired_overrides(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM auth_user_overrides
             WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_role_permission(
        &self,
        role_slug: &str,
        resource: &str,
        permission: &str,
    ) -> Result<Option<RolePermission>, StoreError> {
        let row = sqlx::query_as::<_, RolePermission>(
            "SELECT role_slug, resource, permission, granted
             FROM auth_role_permissions
             WHERE role_slug = $1 AND resource = $2 AND permission = $3",
        )
        .bind(role_slug)
        .bind(resource)
        .bind(permission)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_role_permission(&self, row: &RolePermission) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO auth_role_permissions (role_slug, resource, permission, granted)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (role_slug, resource, permission)
             DO UPDATE SET granted = EXCLUDED.granted, updated_at = NOW()",
        )
        .bind(&row.role_slug)
        .bind(&row.resource)
        .bind(&row.permission)
        .bind(row.granted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_role_permissions(&self) -> Result<Vec<RolePermission>, StoreError> {
        let rows = sqlx::query_as::<_, RolePermission>(
            "SELECT role_slug, resource, permission, granted
             FROM auth_role_permissions
             ORDER BY role_slug, resource, permission",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn upsert_resource(&self, def: &ResourceDef) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO auth_resources (slug, display_name, category)
             VALUES ($1, $2, $3)
             ON CONFLICT (slug)
             DO UPDATE SET display_name = EXCLUDED.display_name,
                           category = EXCLUDED.category",
        )
        .bind(&def.slug)
        .bind(&def.display_name)
        .bind(&def.category)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDef>, StoreError> {
        let rows = sqlx::query_as::<_, ResourceDef>(
            "SELECT slug, display_name, category
             FROM auth_resources ORDER BY category, display_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO auth_permission_audit
                (id, action, user_id, resource, permission, granted, reason,
                 changed_by, changed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id)
        .bind(&entry.action)
        .bind(entry.user_id)
        .bind(&entry.resource)
        .bind(&entry.permission)
        .bind(entry.granted)
        .bind(&entry.reason)
        .bind(entry.changed_by)
        .bind(entry.changed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(&self, limit: i64, offset: i64) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query_as::<_, AuditEntry>(
            "SELECT id, action, user_id, resource, permission, granted, reason,
                    changed_by, changed_at
             FROM auth_permission_audit
             ORDER BY changed_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
