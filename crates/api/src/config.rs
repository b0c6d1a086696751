//! API server configuration

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string (pooled; regular queries).
    pub database_url: String,
    /// Direct Postgres connection string for migrations; falls back to
    /// `database_url` when unset.
    pub database_direct_url: Option<String>,
    /// Address the HTTP listener binds to.
    pub bind_address: String,
    /// Secret for HS256 bearer-token validation.
    pub jwt_secret: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let database_direct_url = std::env::var("DATABASE_DIRECT_URL").ok();
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let jwt_secret =
            std::env::var("JWT_SECRET").map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?;

        if jwt_secret.len() < 32 {
            anyhow::bail!("JWT_SECRET must be at least 32 bytes");
        }

        Ok(Self {
            database_url,
            database_direct_url,
            bind_address,
            jwt_secret,
        })
    }
}
