use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::errors::{AppError, Result};
use crate::utils::identifier::{is_valid_database_name, validate_database_name};

/// Databases that exist on the engine instance.
#[async_trait]
pub trait DatabaseCatalog: Send + Sync {
    /// Every user database on the instance, sorted by name.
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// Creates the database if it is missing. Returns true when it was created.
    async fn ensure_database(&self, name: &str, owner: Option<&str>) -> Result<bool>;

    async fn drop_database(&self, name: &str) -> Result<()>;
}

pub struct PgCatalog {
    pool: PgPool,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl PgCatalog {
    /// Builds a lazily-connecting pool against the engine's `postgres` maintenance database.
    pub fn connect_lazy(engine_url: &Url) -> Result<Self> {
        let mut admin_url = engine_url.clone();
        admin_url.set_path("/postgres");
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy(admin_url.as_str())?;
        Ok(Self { pool })
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

#[async_trait]
impl DatabaseCatalog for PgCatalog {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT datname FROM pg_database \
             WHERE datistemplate = false AND datallowconn = true AND datname <> 'postgres' \
             ORDER BY datname",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(names
            .into_iter()
            .filter(|name| {
                let ok = is_valid_database_name(name);
                if !ok {
                    warn!(database = %name, "Ignoring database with a name the runner cannot accept");
                }
                ok
            })
            .collect())
    }

    async fn ensure_database(&self, name: &str, owner: Option<&str>) -> Result<bool> {
        validate_database_name(name)?;
        if self.exists(name).await? {
            return Ok(false);
        }
        let mut create_sql = format!("CREATE DATABASE {}", quote_ident(name));
        if let Some(owner) = owner.filter(|o| !o.is_empty()) {
            create_sql.push_str(&format!(" OWNER {}", quote_ident(owner)));
        }
        sqlx::query(&create_sql).execute(&self.pool).await?;
        info!(database = %name, "Created database");
        Ok(true)
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        validate_database_name(name)?;
        if name.eq_ignore_ascii_case("postgres") {
            return Err(AppError::PermissionDenied(
                "refusing to drop the maintenance database".to_string(),
            ));
        }
        sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(name)
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(name)))
            .execute(&self.pool)
            .await?;
        info!(database = %name, "Dropped database");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_doubles_quotes() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
