use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::{CredentialStore, UserDirectory};
use crate::error::StoreError;
use crate::models::api_key::ApiKeyRecord;
use crate::models::auth::{RefreshTokenRecord, ServiceKeyState};
use crate::models::permission::{AuditEntry, ResourceDef, RolePermission, UserOverride};
use crate::models::user::User;

#[derive(Default)]
struct MemoryInner {
    refresh_tokens: HashMap<i64, RefreshTokenRecord>,
    service_key: ServiceKeyState,
    api_keys: Vec<ApiKeyRecord>,
    overrides: HashMap<(i64, String, String), UserOverride>,
    role_permissions: HashMap<(String, String, String), RolePermission>,
    resources: Vec<ResourceDef>,
    audit: Vec<AuditEntry>,
}

/// In-memory credential store for tests and hosts without a database.
/// Single-mutex state; every operation holds the lock for its full duration,
/// which gives the same at-most-once consume semantics as the conditional
/// delete in the Postgres layer.
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MemoryInner> {
        // A poisoned lock only means another test panicked mid-write;
        // the boolean/row state underneath is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn save_refresh_token(
        &self,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner().refresh_tokens.insert(
            user_id,
            RefreshTokenRecord { user_id, token_hash: token_hash.to_string(), expires_at },
        );
        Ok(())
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        Ok(self
            .inner()
            .refresh_tokens
            .values()
            .find(|r| r.token_hash == token_hash)
            .cloned())
    }

    async fn consume_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let mut inner = self.inner();
        let user_id = inner
            .refresh_tokens
            .values()
            .find(|r| r.token_hash == token_hash)
            .map(|r| r.user_id);
        Ok(user_id.and_then(|id| inner.refresh_tokens.remove(&id)))
    }

    async fn delete_refresh_token(&self, user_id: i64) -> Result<(), StoreError> {
        self.inner().refresh_tokens.remove(&user_id);
        Ok(())
    }

    async fn purge_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner();
        let before = inner.refresh_tokens.len();
        inner.refresh_tokens.retain(|_, r| r.expires_at > now);
        Ok((before - inner.refresh_tokens.len()) as u64)
    }

    async fn service_key_state(&self) -> Result<ServiceKeyState, StoreError> {
        Ok(self.inner().service_key.clone())
    }

    async fn init_service_key(&self, value: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner();
        if inner.service_key.current.is_none() {
            inner.service_key.current = Some(value.to_string());
            inner.service_key.rotated_at = Some(now);
        }
        Ok(())
    }

    async fn rotate_service_key(
        &self,
        new_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner();
        inner.service_key.previous = inner.service_key.current.take();
        inner.service_key.current = Some(new_key.to_string());
        inner.service_key.rotated_at = Some(now);
        Ok(())
    }

    async fn clear_previous_service_key(&self) -> Result<(), StoreError> {
        self.inner().service_key.previous = None;
        Ok(())
    }

    async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), StoreError> {
        let mut inner = self.inner();
        if inner.api_keys.iter().any(|k| k.api_key == record.api_key) {
            return Err(StoreError::Backend("duplicate api key".into()));
        }
        inner.api_keys.push(record.clone());
        Ok(())
    }

    async fn find_api_key(&self, api_key: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        Ok(self.inner().api_keys.iter().find(|k| k.api_key == api_key).cloned())
    }

    async fn touch_api_key_last_used(
        &self,
        api_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner();
        if let Some(key) = inner.api_keys.iter_mut().find(|k| k.api_key == api_key) {
            key.last_used_at = Some(now);
        }
        Ok(())
    }

    async fn revoke_api_key(&self, id: Uuid, owner_id: Option<i64>) -> Result<bool, StoreError> {
        let mut inner = self.inner();
        match inner
            .api_keys
            .iter_mut()
            .find(|k| k.id == id && owner_id.map_or(true, |o| k.owner_id == o))
        {
            Some(key) => {
                key.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_api_key(&self, id: Uuid, owner_id: Option<i64>) -> Result<bool, StoreError> {
        let mut inner = self.inner();
        let before = inner.api_keys.len();
        inner
            .api_keys
            .retain(|k| !(k.id == id && owner_id.map_or(true, |o| k.owner_id == o)));
        Ok(inner.api_keys.len() < before)
    }

    async fn list_api_keys(&self, owner_id: i64) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let mut keys: Vec<ApiKeyRecord> = self
            .inner()
            .api_keys
            .iter()
            .filter(|k| k.owner_id == owner_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn deactivate_expired_api_keys(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner();
        let mut count = 0;
        for key in inner.api_keys.iter_mut() {
            if key.is_active && key.expires_at.map_or(false, |exp| exp <= now) {
                key.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn find_user_override(
        &self,
        user_id: i64,
        resource: &str,
        permission: &str,
    ) -> Result<Option<UserOverride>, StoreError> {
        let key = (user_id, resource.to_string(), permission.to_string());
        Ok(self.inner().overrides.get(&key).cloned())
    }

    async fn upsert_user_override(&self, row: &UserOverride) -> Result<(), StoreError> {
        let key = (row.user_id, row.resource.clone(), row.permission.clone());
        self.inner().overrides.insert(key, row.clone());
        Ok(())
    }

    async fn delete_user_override(
        &self,
        user_id: i64,
        resource: &str,
        permission: &str,
    ) -> Result<bool, StoreError> {
        let key = (user_id, resource.to_string(), permission.to_string());
        Ok(self.inner().overrides.remove(&key).is_some())
    }

    async fn list_user_overrides(&self, user_id: i64) -> Result<Vec<UserOverride>, StoreError> {
        let mut rows: Vec<UserOverride> = self
            .inner()
            .overrides
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.resource, &a.permission).cmp(&(&b.resource, &b.permission)));
        Ok(rows)
    }

    async fn purge_expired_overrides(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner();
        let before = inner.overrides.len();
        inner
            .overrides
            .retain(|_, o| o.expires_at.map_or(true, |exp| exp > now));
        Ok((before - inner.overrides.len()) as u64)
    }

    async fn find_role_permission(
        &self,
        role_slug: &str,
        resource: &str,
        permission: &str,
    ) -> Result<Option<RolePermission>, StoreError> {
        let key = (role_slug.to_string(), resource.to_string(), permission.to_string());
        Ok(self.inner().role_permissions.get(&key).cloned())
    }

    async fn upsert_role_permission(&self, row: &RolePermission) -> Result<(), StoreError> {
        let key = (row.role_slug.clone(), row.resource.clone(), row.permission.clone());
        self.inner().role_permissions.insert(key, row.clone());
        Ok(())
    }

    async fn list_role_permissions(&self) -> Result<Vec<RolePermission>, StoreError> {
        let mut rows: Vec<RolePermission> =
            self.inner().role_permissions.values().cloned().collect();
        rows.sort_by(|a, b| {
            (&a.role_slug, &a.resource, &a.permission).cmp(&(
                &b.role_slug,
                &b.resource,
                &b.permission,
            ))
        });
        Ok(rows)
    }

    async fn upsert_resource(&self, def: &ResourceDef) -> Result<(), StoreError> {
        let mut inner = self.inner();
        match inner.resources.iter_mut().find(|r| r.slug == def.slug) {
            Some(existing) => *existing = def.clone(),
            None => inner.resources.push(def.clone()),
        }
        Ok(())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDef>, StoreError> {
        let mut defs = self.inner().resources.clone();
        defs.sort_by(|a, b| (&a.category, &a.display_name).cmp(&(&b.category, &b.display_name)));
        Ok(defs)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.inner().audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, limit: i64, offset: i64) -> Result<Vec<AuditEntry>, StoreError> {
        let inner = self.inner();
        let mut entries = inner.audit.clone();
        entries.sort_by(|a, b| b.changed_at.cmp(&a.changed_at));
        Ok(entries
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

/// In-memory user directory for tests and embedding hosts.
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: Mutex<HashMap<i64, User>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: User) {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user.id, user);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user_id)
            .cloned())
    }
}
