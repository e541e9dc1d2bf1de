use std::fs;
use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{PgPool, SqlitePool};

/// Connection pool to the engine database (PostgreSQL or SQLite).
#[derive(Clone, Debug)]
pub enum Database {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl Database {
    /// Connect to the database named by `dsn`.
    pub async fn connect(dsn: &str) -> Result<Self, sqlx::Error> {
        log::info!("Connecting to database with DSN: {dsn}");

        let database = if dsn.starts_with("sqlite:") {
            if is_sqlite_memory(dsn) {
                // Every connection to :memory: is its own database, keep exactly one alive
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect(dsn)
                    .await?;
                Database::Sqlite(pool)
            } else {
                ensure_data_directory(dsn).map_err(sqlx::Error::Io)?;

                // Add mode=rwc to create database file if it doesn't exist
                let dsn_with_create = if dsn.contains('?') {
                    if dsn.contains("mode=") {
                        dsn.to_string()
                    } else {
                        format!("{dsn}&mode=rwc")
                    }
                } else {
                    format!("{dsn}?mode=rwc")
                };

                let pool = SqlitePool::connect(&dsn_with_create).await.map_err(|e| {
                    log::error!(
                        "Failed to connect to SQLite database with DSN '{dsn_with_create}': {e}"
                    );
                    e
                })?;
                Database::Sqlite(pool)
            }
        } else {
            let pool = PgPool::connect(dsn).await.map_err(|e| {
                log::error!("Failed to connect to PostgreSQL database with DSN '{dsn}': {e}");
                e
            })?;
            Database::Postgres(pool)
        };

        log::info!("Database connection established successfully");
        Ok(database)
    }

    /// Open a private in-memory SQLite database.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        Self::connect("sqlite::memory:").await
    }

    pub async fn close(&self) {
        match self {
            Database::Postgres(pool) => pool.close().await,
            Database::Sqlite(pool) => pool.close().await,
        }
    }
}

fn is_sqlite_memory(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

/// Ensure the parent directory of a SQLite database file exists
fn ensure_data_directory(dsn: &str) -> std::io::Result<()> {
    let Some(file_path) = dsn.strip_prefix("sqlite:") else {
        return Ok(());
    };
    let file_path = file_path.trim_start_matches("//");
    let file_path = file_path.split('?').next().unwrap_or(file_path);

    if let Some(parent) = Path::new(file_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent)?;
        log::info!("Created data directory: {}", parent.display());
    }
    Ok(())
}

/// Rewrite `?` placeholders into PostgreSQL's numbered `$n` form.
pub(crate) fn numbered(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    for c in sql.chars() {
        if c == '?' {
            n += 1;
            out.push('$');
            out.push_str(&n.to_string());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_placeholders() {
        assert_eq!(
            numbered("SELECT * FROM t WHERE a = ? AND b > ? LIMIT ?"),
            "SELECT * FROM t WHERE a = $1 AND b > $2 LIMIT $3"
        );
        assert_eq!(numbered("SELECT 1"), "SELECT 1");
    }

    #[tokio::test]
    async fn test_connect_sqlite_file_creates_directory() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/dir/engine.db");
        let dsn = format!("sqlite://{}", db_path.display());

        let db = Database::connect(&dsn).await.unwrap();
        assert!(matches!(db, Database::Sqlite(_)));
        assert!(db_path.parent().unwrap().exists());
        db.close().await;
    }

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::in_memory().await.unwrap();
        let Database::Sqlite(pool) = &db else {
            panic!("expected sqlite");
        };
        sqlx::query("CREATE TABLE t (x INTEGER)")
            .execute(pool)
            .await
            .unwrap();
        // Same connection is reused, so the table is still visible
        sqlx::query("INSERT INTO t (x) VALUES (1)")
            .execute(pool)
            .await
            .unwrap();
    }
}
