use serde::{Deserialize, Serialize};

/// Role slug whose holders bypass permission resolution entirely.
pub const ADMINISTRATOR_ROLE: &str = "administrator";

/// A user as seen by this crate: identity plus an ordered role list.
///
/// The role order is significant — permission resolution walks the roles in
/// attachment order and takes the first one with a matching rule, so
/// `UserDirectory` implementations must preserve it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
}

impl User {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}
