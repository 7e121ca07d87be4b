/// Credential hygiene sweep.
/// Schedule: run daily (e.g. 3 AM UTC via cron — see the sweep-credentials
/// binary).
///
/// None of this is required for correctness: refresh tokens, API keys and
/// permission overrides are all checked lazily at use. The sweep keeps the
/// tables from accumulating dead rows, retires the previous service key
/// after its grace window, and triggers scheduled key rotation.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::CredentialStore;
use crate::error::AuthError;
use crate::services::auth::AuthService;

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub refresh_tokens_purged: u64,
    pub api_keys_deactivated: u64,
    pub overrides_purged: u64,
    pub previous_service_key_cleared: bool,
    pub service_key_rotated: bool,
}

pub struct MaintenanceService {
    store: Arc<dyn CredentialStore>,
    auth: Arc<AuthService>,
}

impl MaintenanceService {
    pub fn new(store: Arc<dyn CredentialStore>, auth: Arc<AuthService>) -> Self {
        Self { store, auth }
    }

    pub async fn run_sweep(&self) -> Result<SweepReport, AuthError> {
        self.run_sweep_at(Utc::now()).await
    }

    pub(crate) async fn run_sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, AuthError> {
        let refresh_tokens_purged = self.store.purge_expired_refresh_tokens(now).await?;
        if refresh_tokens_purged > 0 {
            tracing::info!("Purged {} expired refresh tokens", refresh_tokens_purged);
        }

        let api_keys_deactivated = self.store.deactivate_expired_api_keys(now).await?;
        if api_keys_deactivated > 0 {
            tracing::info!("Deactivated {} expired API keys", api_keys_deactivated);
        }

        let overrides_purged = self.store.purge_expired_overrides(now).await?;
        if overrides_purged > 0 {
            tracing::info!("Purged {} expired permission overrides", overrides_purged);
        }

        let previous_service_key_cleared =
            self.auth.purge_retired_service_key_at(now).await?;
        if previous_service_key_cleared {
            tracing::info!("Cleared retired service key after grace window");
        }

        let service_key_rotated = self.auth.check_rotation_due_at(now).await?;

        Ok(SweepReport {
            refresh_tokens_purged,
            api_keys_deactivated,
            overrides_purged,
            previous_service_key_cleared,
            service_key_rotated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::memory::{MemoryCredentialStore, MemoryUserDirectory};
    use crate::models::permission::UserOverride;
    use chrono::Duration;

    fn fixture() -> (Arc<MemoryCredentialStore>, Arc<AuthService>, MaintenanceService) {
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
        let auth = Arc::new(AuthService::new(store.clone(), users, config));
        let maintenance = MaintenanceService::new(store.clone(), auth.clone());
        (store, auth, maintenance)
    }

    #[tokio::test]
    async fn sweep_purges_expired_credentials() {
        let (store, auth, maintenance) = fixture();
        let now = Utc::now();

        store
            .save_refresh_token(1, "stale-hash", now - Duration::hours(1))
            .await
            .unwrap();
        auth.create_api_key(2, "old", None, Some(now - Duration::hours(1))).await.unwrap();
        store
            .upsert_user_override(&UserOverride {
                user_id: 3,
                resource: "inventory".into(),
                permission: "edit".into(),
                granted: true,
                expires_at: Some(now - Duration::hours(1)),
                reason: "season loan".into(),
                granted_by: 1,
            })
            .await
            .unwrap();

        let report = maintenance.run_sweep_at(now).await.unwrap();
        assert_eq!(report.refresh_tokens_purged, 1);
        assert_eq!(report.api_keys_deactivated, 1);
        assert_eq!(report.overrides_purged, 1);
    }

    #[tokio::test]
    async fn sweep_retires_previous_key_and_rotates_when_due() {
        let (store, auth, maintenance) = fixture();
        let old_key = auth.ensure_service_key().await.unwrap();
        let new_key = auth.rotate_service_key().await.unwrap();

        // Inside the grace window nothing happens to the old key
        let report = maintenance.run_sweep_at(Utc::now()).await.unwrap();
        assert!(!report.previous_service_key_cleared);
        assert!(auth.validate_service_key(&old_key).await.unwrap());

        // Past the grace window the previous key is cleared
        let report =
            maintenance.run_sweep_at(Utc::now() + Duration::hours(25)).await.unwrap();
        assert!(report.previous_service_key_cleared);
        assert!(!auth.validate_service_key(&old_key).await.unwrap());
        assert!(auth.validate_service_key(&new_key).await.unwrap());

        // A month later the sweep triggers the scheduled rotation
        let report =
            maintenance.run_sweep_at(Utc::now() + Duration::days(31)).await.unwrap();
        assert!(report.service_key_rotated);
        let state = store.service_key_state().await.unwrap();
        assert_eq!(state.previous.as_deref(), Some(new_key.as_str()));
    }
}
