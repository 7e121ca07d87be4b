use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// Secret used to sign access tokens (HS256).
    pub jwt_secret: String,
    /// Key for the deterministic digests of refresh tokens and API-key
    /// secrets. Must stay stable across restarts or stored hashes become
    /// unmatchable.
    pub hash_key: String,
    /// Issuer stamped into every access token (`iss` claim).
    pub issuer: String,
    pub jwt_expiry_seconds: u64,
    pub refresh_expiry_seconds: u64,
    pub service_key_rotation_days: u64,
    pub service_key_grace_hours: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            jwt_secret: required("CLUBHOUSE_JWT_SECRET")?,
            hash_key: required("CLUBHOUSE_HASH_KEY")?,
            issuer: env::var("CLUBHOUSE_ISSUER")
                .unwrap_or_else(|_| "https://clubhouse.local".into()),
            jwt_expiry_seconds: env::var("CLUBHOUSE_JWT_EXPIRY_SECONDS")
                .unwrap_or_else(|_| "900".into())
                .parse()?,
            refresh_expiry_seconds: env::var("CLUBHOUSE_REFRESH_EXPIRY_SECONDS")
                .unwrap_or_else(|_| "604800".into())
                .parse()?,
            service_key_rotation_days: env::var("CLUBHOUSE_SERVICE_KEY_ROTATION_DAYS")
                .unwrap_or_else(|_| "30".into())
                .parse()?,
            service_key_grace_hours: env::var("CLUBHOUSE_SERVICE_KEY_GRACE_HOURS")
                .unwrap_or_else(|_| "24".into())
                .parse()?,
        })
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}
