pub mod connection;
pub mod source;
pub mod sql;
pub mod target;

pub use connection::{ConnectionManager, ConnectionPool, Endpoint, PooledConnection};
pub use source::PgSource;
pub use target::PgTarget;

/// Human-readable cause of a PostgreSQL failure, including server detail.
pub(crate) fn describe(error: &crate::Error) -> String {
    if let crate::Error::Postgres(pg) = error {
        if let Some(db) = pg.as_db_error() {
            let mut text = format!("{} (SQLSTATE {})", db.message(), db.code().code());
            if let Some(detail) = db.detail() {
                text.push_str(": ");
                text.push_str(detail);
            }
            return text;
        }
    }
    error.to_string()
}
