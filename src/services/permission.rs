use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::{CredentialStore, UserDirectory};
use crate::error::AuthError;
use crate::models::permission::{
    AuditEntry, PermissionSet, ResourceDef, RolePermission, UserOverride, STANDARD_ACTIONS,
};
use crate::models::user::ADMINISTRATOR_ROLE;

/// The club resource registry seeded at install time.
const CLUB_RESOURCES: [(&str, &str, &str); 6] = [
    ("inventory", "Equipment inventory", "operations"),
    ("documents", "Documents", "operations"),
    ("teams", "Teams", "club"),
    ("players", "Players", "club"),
    ("events", "Events", "club"),
    ("messages", "Messages", "communication"),
];

/// Default grants for the coach role.
const COACH_GRANTS: [(&str, &str); 11] = [
    ("inventory", "view"),
    ("inventory", "edit"),
    ("documents", "view"),
    ("documents", "create"),
    ("teams", "view"),
    ("players", "view"),
    ("events", "view"),
    ("events", "create"),
    ("events", "edit"),
    ("messages", "view"),
    ("messages", "create"),
];

/// Default grants for the team-manager role: view-mostly, no inventory
/// edits and no event mutations.
const TEAM_MANAGER_GRANTS: [(&str, &str); 8] = [
    ("inventory", "view"),
    ("documents", "view"),
    ("documents", "create"),
    ("teams", "view"),
    ("players", "view"),
    ("events", "view"),
    ("messages", "view"),
    ("messages", "create"),
];

/// Resolves whether a user may perform an action on a resource.
///
/// Resolution order: administrator bypass, then cache, then an unexpired
/// per-user override, then the first matching role rule in the user's role
/// order, then default-deny. Every resolved outcome is cached until an
/// explicit invalidation.
pub struct PermissionEngine {
    store: Arc<dyn CredentialStore>,
    users: Arc<dyn UserDirectory>,
    admin_roles: Vec<String>,
    cache: Mutex<HashMap<(i64, String, String), bool>>,
}

impl PermissionEngine {
    pub fn new(store: Arc<dyn CredentialStore>, users: Arc<dyn UserDirectory>) -> Self {
        Self::with_admin_roles(store, users, vec![ADMINISTRATOR_ROLE.to_string()])
    }

    /// Override which role slugs bypass resolution entirely.
    pub fn with_admin_roles(
        store: Arc<dyn CredentialStore>,
        users: Arc<dyn UserDirectory>,
        admin_roles: Vec<String>,
    ) -> Self {
        Self { store, users, admin_roles, cache: Mutex::new(HashMap::new()) }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<(i64, String, String), bool>> {
        // The cache holds only resolved booleans; recover from a poisoned
        // lock rather than failing the permission check.
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn has_permission(
        &self,
        user_id: i64,
        resource: &str,
        permission: &str,
    ) -> Result<bool, AuthError> {
        let user = self.users.find_user(user_id).await?;

        // Administrator-equivalent roles bypass everything, cache included.
        if let Some(user) = &user {
            if user.roles.iter().any(|r| self.admin_roles.iter().any(|a| a == r)) {
                return Ok(true);
            }
        }

        let key = (user_id, resource.to_string(), permission.to_string());
        if let Some(cached) = self.cache().get(&key).copied() {
            return Ok(cached);
        }

        // 1. Per-user override, unless it has expired
        if let Some(overr) = self.store.find_user_override(user_id, resource, permission).await? {
            if !overr.is_expired_at(Utc::now()) {
                self.cache().insert(key, overr.granted);
                return Ok(overr.granted);
            }
        }

        // 2. Role rules, first match in the user's role order
        if let Some(user) = &user {
            for role in &user.roles {
                if let Some(rule) =
                    self.store.find_role_permission(role, resource, permission).await?
                {
                    self.cache().insert(key, rule.granted);
                    return Ok(rule.granted);
                }
            }
        }

        // 3. Default deny
        self.cache().insert(key, false);
        Ok(false)
    }

    /// Bulk resolution over the resource registry, for UI rendering.
    pub async fn get_user_permissions(
        &self,
        user_id: i64,
    ) -> Result<BTreeMap<String, PermissionSet>, AuthError> {
        let mut permissions = BTreeMap::new();
        for resource in self.store.list_resources().await? {
            let set = PermissionSet {
                view: self.has_permission(user_id, &resource.slug, "view").await?,
                create: self.has_permission(user_id, &resource.slug, "create").await?,
                edit: self.has_permission(user_id, &resource.slug, "edit").await?,
                delete: self.has_permission(user_id, &resource.slug, "delete").await?,
            };
            permissions.insert(resource.slug, set);
        }
        Ok(permissions)
    }

    /// Create or update a per-user override. Clears the user's cached
    /// resolutions and appends an audit entry.
    #[allow(clippy::too_many_arguments)]
    pub async fn grant_user_override(
        &self,
        user_id: i64,
        resource: &str,
        permission: &str,
        granted: bool,
        expires_at: Option<DateTime<Utc>>,
        reason: &str,
        granted_by: i64,
    ) -> Result<(), AuthError> {
        self.store
            .upsert_user_override(&UserOverride {
                user_id,
                resource: resource.to_string(),
                permission: permission.to_string(),
                granted,
                expires_at,
                reason: reason.to_string(),
                granted_by,
            })
            .await?;
        self.invalidate_user(user_id);
        self.store
            .append_audit(&AuditEntry {
                id: Uuid::new_v4(),
                action: "user_override".to_string(),
                user_id: Some(user_id),
                resource: resource.to_string(),
                permission: permission.to_string(),
                granted,
                reason: reason.to_string(),
                changed_by: granted_by,
                changed_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Remove a per-user override. The deletion itself is the only trace;
    /// no separate audit entry is written.
    pub async fn revoke_user_override(
        &self,
        user_id: i64,
        resource: &str,
        permission: &str,
    ) -> Result<bool, AuthError> {
        let removed = self.store.delete_user_override(user_id, resource, permission).await?;
        self.invalidate_user(user_id);
        Ok(removed)
    }

    /// Create or update a role rule. Role changes affect every holder, so
    /// the whole cache is dropped.
    pub async fn update_role_permission(
        &self,
        role_slug: &str,
        resource: &str,
        permission: &str,
        granted: bool,
        changed_by: i64,
    ) -> Result<(), AuthError> {
        self.store
            .upsert_role_permission(&RolePermission {
                role_slug: role_slug.to_string(),
                resource: resource.to_string(),
                permission: permission.to_string(),
                granted,
            })
            .await?;
        self.invalidate_all();
        self.store
            .append_audit(&AuditEntry {
                id: Uuid::new_v4(),
                action: "role_permission".to_string(),
                user_id: None,
                resource: resource.to_string(),
                permission: permission.to_string(),
                granted,
                reason: format!("role: {role_slug}"),
                changed_by,
                changed_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    pub async fn list_user_overrides(
        &self,
        user_id: i64,
    ) -> Result<Vec<UserOverride>, AuthError> {
        Ok(self.store.list_user_overrides(user_id).await?)
    }

    pub async fn list_role_permissions(&self) -> Result<Vec<RolePermission>, AuthError> {
        Ok(self.store.list_role_permissions().await?)
    }

    pub async fn list_audit(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEntry>, AuthError> {
        Ok(self.store.list_audit(limit, offset).await?)
    }

    /// Drop cached resolutions for one user (override mutations).
    pub fn invalidate_user(&self, user_id: i64) {
        self.cache().retain(|(id, _, _), _| *id != user_id);
    }

    /// Drop the whole cache (role-permission mutations).
    pub fn invalidate_all(&self) {
        self.cache().clear();
    }

    /// Install the club resource registry and the default role grants.
    /// Upsert semantics — safe to run on every startup.
    pub async fn seed_defaults(&self) -> Result<(), AuthError> {
        for (slug, display_name, category) in CLUB_RESOURCES {
            self.store
                .upsert_resource(&ResourceDef {
                    slug: slug.to_string(),
                    display_name: display_name.to_string(),
                    category: category.to_string(),
                })
                .await?;
        }

        // Board members get the full grid
        for (slug, _, _) in CLUB_RESOURCES {
            for action in STANDARD_ACTIONS {
                self.store
                    .upsert_role_permission(&RolePermission {
                        role_slug: "board_member".to_string(),
                        resource: slug.to_string(),
                        permission: action.to_string(),
                        granted: true,
                    })
                    .await?;
            }
        }
        for (resource, permission) in COACH_GRANTS {
            self.store
                .upsert_role_permission(&RolePermission {
                    role_slug: "coach".to_string(),
                    resource: resource.to_string(),
                    permission: permission.to_string(),
                    granted: true,
                })
                .await?;
        }
        for (resource, permission) in TEAM_MANAGER_GRANTS {
            self.store
                .upsert_role_permission(&RolePermission {
                    role_slug: "team_manager".to_string(),
                    resource: resource.to_string(),
                    permission: permission.to_string(),
                    granted: true,
                })
                .await?;
        }

        self.invalidate_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryCredentialStore, MemoryUserDirectory};
    use crate::models::user::User;
    use chrono::Duration;

    fn user_with_roles(id: i64, roles: &[&str]) -> User {
        User {
            id,
            username: format!("user{id}"),
            email: format!("user{id}@example.org"),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    struct Fixture {
        store: Arc<MemoryCredentialStore>,
        users: Arc<MemoryUserDirectory>,
        engine: PermissionEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryCredentialStore::new());
        let users = Arc::new(MemoryUserDirectory::new());
        let engine = PermissionEngine::new(store.clone(), users.clone());
        Fixture { store, users, engine }
    }

    #[tokio::test]
    async fn override_beats_role_and_role_beats_default_deny() {
        let f = fixture();
        f.users.add_user(user_with_roles(5, &["coach"]));
        f.engine
            .update_role_permission("coach", "inventory", "edit", true, 1)
            .await
            .unwrap();
        f.engine
            .grant_user_override(5, "inventory", "edit", false, None, "loaner ban", 1)
            .await
            .unwrap();

        // Override wins over the role grant
        assert!(!f.engine.has_permission(5, "inventory", "edit").await.unwrap());

        // Remove the override: the role grant applies
        assert!(f.engine.revoke_user_override(5, "inventory", "edit").await.unwrap());
        assert!(f.engine.has_permission(5, "inventory", "edit").await.unwrap());

        // With neither: default deny
        assert!(!f.engine.has_permission(5, "inventory", "delete").await.unwrap());
    }

    #[tokio::test]
    async fn expired_override_falls_through_to_role() {
        let f = fixture();
        f.users.add_user(user_with_roles(5, &["coach"]));
        f.engine
            .update_role_permission("coach", "inventory", "edit", true, 1)
            .await
            .unwrap();
        f.engine
            .grant_user_override(
                5,
                "inventory",
                "edit",
                false,
                Some(Utc::now() - Duration::days(1)),
                "expired ban",
                1,
            )
            .await
            .unwrap();

        assert!(f.engine.has_permission(5, "inventory", "edit").await.unwrap());
    }

    #[tokio::test]
    async fn administrator_bypasses_resolution_entirely() {
        let f = fixture();
        f.users.add_user(user_with_roles(1, &["administrator"]));
        // No role rule, no override, not even a known resource
        assert!(f.engine.has_permission(1, "nonexistent", "delete").await.unwrap());
    }

    #[tokio::test]
    async fn first_matching_role_wins_in_attachment_order() {
        let f = fixture();
        f.users.add_user(user_with_roles(6, &["team_manager", "coach"]));
        f.engine
            .update_role_permission("team_manager", "inventory", "edit", false, 1)
            .await
            .unwrap();
        f.engine
            .update_role_permission("coach", "inventory", "edit", true, 1)
            .await
            .unwrap();

        // team_manager is attached first, so its explicit deny applies
        assert!(!f.engine.has_permission(6, "inventory", "edit").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_user_is_denied_by_default() {
        let f = fixture();
        assert!(!f.engine.has_permission(999, "inventory", "view").await.unwrap());
    }

    #[tokio::test]
    async fn override_mutation_invalidates_the_cached_denial() {
        let f = fixture();
        f.users.add_user(user_with_roles(5, &["coach"]));

        // Resolve once so the denial is cached
        assert!(!f.engine.has_permission(5, "inventory", "delete").await.unwrap());

        f.engine
            .grant_user_override(
                5,
                "inventory",
                "delete",
                true,
                Some(Utc::now() + Duration::days(7)),
                "season cleanup",
                1,
            )
            .await
            .unwrap();
        assert!(f.engine.has_permission(5, "inventory", "delete").await.unwrap());

        assert!(f.engine.revoke_user_override(5, "inventory", "delete").await.unwrap());
        assert!(!f.engine.has_permission(5, "inventory", "delete").await.unwrap());
    }

    #[tokio::test]
    async fn role_mutation_invalidates_every_cached_entry() {
        let f = fixture();
        f.users.add_user(user_with_roles(5, &["coach"]));

        assert!(!f.engine.has_permission(5, "documents", "delete").await.unwrap());
        f.engine
            .update_role_permission("coach", "documents", "delete", true, 1)
            .await
            .unwrap();
        assert!(f.engine.has_permission(5, "documents", "delete").await.unwrap());
    }

    #[tokio::test]
    async fn mutations_append_audit_entries_but_revoke_does_not() {
        let f = fixture();
        f.users.add_user(user_with_roles(5, &["coach"]));

        f.engine
            .grant_user_override(5, "inventory", "edit", true, None, "trial period", 2)
            .await
            .unwrap();
        f.engine
            .update_role_permission("coach", "teams", "edit", true, 2)
            .await
            .unwrap();
        f.engine.revoke_user_override(5, "inventory", "edit").await.unwrap();

        let audit = f.store.list_audit(10, 0).await.unwrap();
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().any(|e| {
            e.action == "user_override" && e.user_id == Some(5) && e.changed_by == 2
        }));
        assert!(audit.iter().any(|e| {
            e.action == "role_permission" && e.user_id.is_none() && e.reason == "role: coach"
        }));
    }

    #[tokio::test]
    async fn seeded_defaults_resolve_per_role() {
        let f = fixture();
        f.users.add_user(user_with_roles(10, &["coach"]));
        f.users.add_user(user_with_roles(11, &["team_manager"]));
        f.engine.seed_defaults().await.unwrap();

        assert!(f.engine.has_permission(10, "inventory", "view").await.unwrap());
        assert!(f.engine.has_permission(10, "inventory", "edit").await.unwrap());
        assert!(f.engine.has_permission(11, "inventory", "view").await.unwrap());
        assert!(!f.engine.has_permission(11, "inventory", "edit").await.unwrap());
        assert!(!f.engine.has_permission(11, "events", "create").await.unwrap());
    }

    #[tokio::test]
    async fn bulk_resolution_covers_the_registry() {
        let f = fixture();
        f.users.add_user(user_with_roles(10, &["team_manager"]));
        f.engine.seed_defaults().await.unwrap();

        let permissions = f.engine.get_user_permissions(10).await.unwrap();
        assert_eq!(permissions.len(), CLUB_RESOURCES.len());
        let inventory = permissions.get("inventory").unwrap();
        assert!(inventory.view);
        assert!(!inventory.edit);
        assert!(!inventory.delete);
    }
}
