//! PostgreSQL backends through sea-orm: the authoritative tenant store with
//! its outbox and leases, the administrative storage provisioner, and the
//! per-tenant migration executor.

mod engine;
mod store;

pub use engine::{PgMigrationExecutor, PgStorageProvisioner};
pub use store::PgTenantStore;

use sea_orm::{ConnectOptions, DatabaseConnection, DbErr, RuntimeErr};
use std::time::Duration;

/// Open a small pool against `url`.
pub(crate) async fn connect(url: &str, max_connections: u32) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(url.to_string());
    options
        .max_connections(max_connections)
        .min_connections(0)
        .connect_timeout(Duration::from_secs(5))
        .acquire_timeout(Duration::from_secs(5))
        .sqlx_logging(false);
    sea_orm::Database::connect(options).await
}

/// Double-quote an identifier. Identifiers here are always derived from
/// tenant ids; quoting keeps them literal regardless.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Whether a failure is about reaching the server rather than the statement.
pub(crate) fn is_connection_error(err: &DbErr) -> bool {
    matches!(err, DbErr::Conn(_) | DbErr::ConnectionAcquire(_))
}

/// SQLSTATE reported by the server, if the error came from one.
pub(crate) fn sqlstate(err: &DbErr) -> Option<String> {
    let runtime = match err {
        DbErr::Conn(e) | DbErr::Exec(e) | DbErr::Query(e) => e,
        _ => return None,
    };
    match runtime {
        RuntimeErr::SqlxError(sea_orm::sqlx::Error::Database(db)) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("tenant_ab"), "\"tenant_ab\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
