//! # rdbms_layer
//!
//! A relational database access layer: one [`Connection`](core::Connection)
//! type speaking to SQLite, MySQL/MariaDB or PostgreSQL through a pluggable
//! backend driver, with savepoint-backed atomic sections and session-loss recovery.
//!
//! ## Features
//!
//! - **Atomic sections**: nested, LIFO-checked units of work mapped onto
//!   savepoints, with optional cancellation
//! - **Transaction callbacks**: post-commit and resolution hooks
//!   that follow savepoint rollbacks
//! - **Session-loss recovery**: transparent reconnect and retry when nothing
//!   session-bound would be lost
//! - **Named locks**: re-entrant advisory locks with scoped guards
//! - **Domains**: `database-schema-prefix` identifiers for table namespacing
//! - **SQL builders**: conditions, assignments and select options rendered in
//!   each backend's dialect
//!
//! ## Supported Databases
//!
//! | Database | Cargo feature | Driver |
//! |----------|---------------|--------|
//! | SQLite | `sqlite` (default) | rusqlite, bundled |
//! | PostgreSQL | `postgres` | tokio-postgres |
//! | MySQL / MariaDB | `mysql` | mysql_async |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rdbms_layer::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let factory = DatabaseFactory::new();
//!     let mut db = factory
//!         .create("sqlite", ConnectionConfig::sqlite(":memory:"), ConnectMode::Connected)
//!         .await?;
//!
//!     db.query(
//!         "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
//!         "setup",
//!         QueryFlags::empty(),
//!     )
//!     .await?;
//!
//!     let mut row = DatabaseRow::new();
//!     row.insert("name", "Alice".into());
//!     db.insert("users", &[row], "setup", false).await?;
//!
//!     let name = db
//!         .select_field(&["users"], "name", &Conditions::new(), "setup", &SelectOptions::default(), &[])
//!         .await?;
//!     println!("{:?}", name);
//!     Ok(())
//! }
//! ```
//!
//! ### Atomic sections
//!
//! ```rust,no_run
//! use rdbms_layer::prelude::*;
//!
//! # async fn demo(db: &mut Connection) -> Result<()> {
//! let section = db.start_atomic("demo", Cancelable::Yes).await?;
//! if let Err(e) = db.query("UPDATE accounts SET balance = 0", "demo", QueryFlags::empty()).await {
//!     db.cancel_atomic("demo", Some(section)).await?;
//!     return Err(e);
//! }
//! db.end_atomic("demo").await?;
//! # Ok(())
//! # }
//! ```

/// Backend-agnostic types and the connection engine
pub mod core;

/// Backend drivers
pub mod backends;

/// Connection factory
pub mod factory;

/// Prelude for convenient imports
///
/// ```rust
/// use rdbms_layer::prelude::*;
///
/// let config = ConnectionConfig::sqlite(":memory:");
/// assert_eq!(config.table_prefix, "");
/// ```
pub mod prelude {
    pub use crate::core::{
        try_silently, Assignments, Cancelable, Condition, Conditions, Connection, ConnectionConfig,
        ConnectionFlags, Database, DatabaseDomain, DatabaseError, DatabaseRow, DatabaseType,
        DatabaseValue, FlushMode, QueryFlags, ReadableDatabase, Result, ResultWrapper,
        SelectOptions, TransactionMode, TransactionOutcome,
    };
    pub use crate::factory::{ConnectMode, DatabaseFactory};
}

// Re-export at root level for convenience
pub use crate::core::{Connection, ConnectionConfig, Database, DatabaseError, DatabaseType, Result};
pub use factory::{ConnectMode, DatabaseFactory};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_imports() {
        use prelude::*;

        let db_type: DatabaseType = "postgresql".parse().unwrap();
        assert_eq!(db_type.to_str(), "postgres");
        assert_eq!(DatabaseDomain::from_id("wiki-mw_").unwrap().table_prefix(), "mw_");
    }

    #[test]
    fn test_value_conversions() {
        use prelude::*;

        let val: DatabaseValue = 42.into();
        assert_eq!(val.as_int(), Some(42));

        let val: DatabaseValue = "test".into();
        assert_eq!(val.as_string(), "test");

        let val: DatabaseValue = true.into();
        assert_eq!(val.as_bool(), Some(true));
    }
}
