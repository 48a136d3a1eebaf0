use std::{path::Path, time::Duration};

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};

/// Opens a SQLite connection pool, creating the parent directory of the
/// database file when needed.
pub async fn connect_sqlite(url: &str) -> Result<DatabaseConnection, DbErr> {
    if let Some(parent) = sqlite_file_path(url).and_then(|p| p.parent()) {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DbErr::Custom(format!("cannot create {}: {e}", parent.display())))?;
        }
    }

    Database::connect(connect_options(url)).await
}

// An in-memory database lives and dies with its connection, and each
// pooled connection would see a database of its own.
const MEMORY_CONNECTION_LIFETIME: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn connect_options(url: &str) -> ConnectOptions {
    let mut opt = ConnectOptions::new(url.to_string());
    opt.sqlx_logging_level(tracing::log::LevelFilter::Debug);
    if is_memory_url(url) {
        opt.max_connections(1)
            .min_connections(1)
            .idle_timeout(MEMORY_CONNECTION_LIFETIME)
            .max_lifetime(MEMORY_CONNECTION_LIFETIME);
    }
    opt
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

fn sqlite_file_path(url: &str) -> Option<&Path> {
    let rest = url.strip_prefix("sqlite://")?;
    let path = rest.split('?').next()?;
    (!path.is_empty() && path != ":memory:").then(|| Path::new(path))
}

/// Runs schema statements in order. Each must be idempotent.
pub(crate) async fn ensure_schema(db: &DatabaseConnection, statements: &[&str]) -> Result<(), DbErr> {
    for sql in statements {
        db.execute(Statement::from_string(db.get_database_backend(), *sql))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_file_path() {
        assert_eq!(
            sqlite_file_path("sqlite://.runtime/queue.db?mode=rwc"),
            Some(Path::new(".runtime/queue.db"))
        );
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("sqlite://:memory:"), None);
        assert_eq!(sqlite_file_path("postgres://localhost/db"), None);
    }

    #[test]
    fn memory_urls_use_a_single_connection() {
        for url in ["sqlite::memory:", "sqlite://:memory:", "sqlite://file:kv?mode=memory"] {
            let opt = connect_options(url);
            assert_eq!(opt.get_max_connections(), Some(1), "{url}");
            assert_eq!(opt.get_min_connections(), Some(1), "{url}");
        }
        assert_eq!(
            connect_options("sqlite://.runtime/queue.db?mode=rwc").get_max_connections(),
            None
        );
    }
}
