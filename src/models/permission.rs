use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The four standard permission verbs resolved for every resource.
pub const STANDARD_ACTIONS: [&str; 4] = ["view", "create", "edit", "delete"];

/// A default authorization rule attached to a role. Unique per
/// (role, resource, permission) — writes are upserts.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RolePermission {
    pub role_slug: String,
    pub resource: String,
    pub permission: String,
    pub granted: bool,
}

/// A per-user exception that takes precedence over role rules. An expired
/// override is treated as absent at resolution time even before the sweep
/// physically deletes it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserOverride {
    pub user_id: i64,
    pub resource: String,
    pub permission: String,
    pub granted: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub granted_by: i64,
}

impl UserOverride {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |exp| exp <= now)
    }
}

/// Append-only record of a permission mutation.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    /// "user_override" or "role_permission".
    pub action: String,
    /// Affected user; absent for role-level changes.
    pub user_id: Option<i64>,
    pub resource: String,
    pub permission: String,
    pub granted: bool,
    pub reason: String,
    pub changed_by: i64,
    pub changed_at: DateTime<Utc>,
}

/// An entry in the resource registry that permission rules refer to.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ResourceDef {
    pub slug: String,
    pub display_name: String,
    pub category: String,
}

/// Resolved standard-verb permissions for one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PermissionSet {
    pub view: bool,
    pub create: bool,
    pub edit: bool,
    pub delete: bool,
}
