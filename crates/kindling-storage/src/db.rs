//! PostgreSQL pool
//!
//! One pool is shared by every repository and the readiness check. Schema
//! changes live in `migrations/` and are applied at startup.

use std::time::Duration;

use kindling_common::config::DatabaseConfig;
use kindling_common::{Error, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = connection_url(config)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections.min(config.max_connections))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs.max(1)))
            .connect(url)
            .await
            .map_err(|e| Error::Database(format!("Cannot reach PostgreSQL: {}", e)))?;

        info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations
    pub async fn migrate(&self) -> Result<()> {
        debug!(known = MIGRATOR.iter().count(), "Applying schema migrations");
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Schema migration failed: {}", e)))?;
        info!("Schema is up to date");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| Error::Database(format!("PostgreSQL is not answering: {}", e)))
    }
}

fn connection_url(config: &DatabaseConfig) -> Result<&str> {
    if config.backend != "postgres" {
        return Err(Error::Config(format!(
            "database.backend `{}` is not supported, use `postgres`",
            config.backend
        )));
    }
    config
        .url
        .as_deref()
        .ok_or_else(|| Error::Config("database.url is required".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_connection_url_requires_postgres() {
        let mut config = DatabaseConfig::default();
        assert!(matches!(connection_url(&config), Err(Error::Config(_))));

        config.url = Some("postgres://localhost/kindling".to_string());
        assert_eq!(connection_url(&config).unwrap(), "postgres://localhost/kindling");

        config.backend = "sqlite".to_string();
        let err = connection_url(&config).unwrap_err();
        assert!(err.to_string().contains("sqlite"));
    }

    #[test]
    fn test_migrations_are_embedded_in_order() {
        let versions: Vec<i64> = MIGRATOR.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![20240101000000, 20240201000000]);
    }
}
