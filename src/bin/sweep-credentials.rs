/// Credential hygiene sweep for the auth core.
/// Run daily (e.g. via cron job: 0 3 * * * /app/sweep-credentials)
///
/// Usage: sweep-credentials [--seed-defaults]
///   --seed-defaults : also (re)install the resource registry and default
///                     role grants before sweeping (idempotent)

use std::sync::Arc;

use clap::Parser;

use clubhouse_auth::config::Config;
use clubhouse_auth::db::{self, memory::MemoryUserDirectory, postgres::PgCredentialStore};
use clubhouse_auth::services::auth::AuthService;
use clubhouse_auth::services::maintenance::MaintenanceService;
use clubhouse_auth::services::permission::PermissionEngine;

#[derive(Parser)]
#[command(name = "sweep-credentials", about = "Purge expired credential material")]
struct Args {
    /// Also seed the default resource registry and role permissions
    #[arg(long)]
    seed_defaults: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::from_env()?);

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable not set"))?;
    let pool = db::create_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(PgCredentialStore::new(pool));
    // The sweep never resolves users, so an empty directory satisfies the
    // service constructors.
    let users = Arc::new(MemoryUserDirectory::new());
    let auth = Arc::new(AuthService::new(store.clone(), users.clone(), config));

    if args.seed_defaults {
        let permissions = PermissionEngine::new(store.clone(), users);
        permissions.seed_defaults().await?;
        tracing::info!("Seeded resource registry and default role permissions");
    }

    let maintenance = MaintenanceService::new(store, auth);
    let report = maintenance.run_sweep().await?;

    tracing::info!(
        "Sweep complete: {} refresh tokens purged, {} API keys deactivated, {} overrides purged",
        report.refresh_tokens_purged,
        report.api_keys_deactivated,
        report.overrides_purged,
    );
    if report.service_key_rotated {
        tracing::info!("Service key rotation was due and has been performed");
    }

    Ok(())
}
