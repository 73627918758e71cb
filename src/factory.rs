//! Connection factory
//!
//! An explicit registry maps backend type names to driver constructors.
//! Types whose cargo feature is disabled stay registered without drivers, so
//! asking for them reports a missing driver instead of an unknown type.

use crate::backends::BackendDriver;
use crate::core::config::ConnectionConfig;
use crate::core::connection::Connection;
use crate::core::database_types::{DatabaseAttributes, DatabaseType};
use crate::core::error::{DatabaseError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds an unopened driver for a config
pub type DriverConstructor = Arc<dyn Fn(&ConnectionConfig) -> Box<dyn BackendDriver> + Send + Sync>;

/// Whether `create()` opens the connection right away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// Open now; connection failures are returned from `create()`
    #[default]
    Connected,
    /// Open on first use
    Unconnected,
}

struct BackendEntry {
    attributes: DatabaseAttributes,
    drivers: Vec<(String, DriverConstructor)>,
}

/// Registry of backend types and their drivers
pub struct DatabaseFactory {
    backends: HashMap<String, BackendEntry>,
    aliases: HashMap<String, String>,
}

impl DatabaseFactory {
    /// A factory with every built-in backend registered
    pub fn new() -> Self {
        let mut factory = Self {
            backends: HashMap::new(),
            aliases: HashMap::new(),
        };
        for db_type in DatabaseType::all() {
            factory.backends.insert(
                db_type.to_str().to_string(),
                BackendEntry {
                    attributes: db_type.attributes(),
                    drivers: Vec::new(),
                },
            );
        }
        factory.alias("sqlite3", "sqlite");
        factory.alias("mariadb", "mysql");
        factory.alias("postgresql", "postgres");

        #[cfg(feature = "sqlite")]
        factory.register(
            "sqlite",
            "rusqlite",
            DatabaseType::Sqlite.attributes(),
            Arc::new(|_: &ConnectionConfig| Box::new(crate::backends::SqliteDriver::new()) as Box<dyn BackendDriver>),
        );
        #[cfg(feature = "mysql")]
        factory.register(
            "mysql",
            "mysql_async",
            DatabaseType::Mysql.attributes(),
            Arc::new(|_: &ConnectionConfig| Box::new(crate::backends::MysqlDriver::new()) as Box<dyn BackendDriver>),
        );
        #[cfg(feature = "postgres")]
        factory.register(
            "postgres",
            "tokio-postgres",
            DatabaseType::Postgres.attributes(),
            Arc::new(|_: &ConnectionConfig| Box::new(crate::backends::PostgresDriver::new()) as Box<dyn BackendDriver>),
        );

        factory
    }

    /// Make `alias` resolve to `target`
    pub fn alias(&mut self, alias: &str, target: &str) {
        self.aliases
            .insert(alias.to_lowercase(), target.to_lowercase());
    }

    /// Register a driver for a backend type, creating the type if needed
    ///
    /// The first driver registered for a type is the default one.
    pub fn register(
        &mut self,
        db_type: &str,
        driver_name: &str,
        attributes: DatabaseAttributes,
        constructor: DriverConstructor,
    ) {
        let entry = self
            .backends
            .entry(db_type.to_lowercase())
            .or_insert_with(|| BackendEntry {
                attributes,
                drivers: Vec::new(),
            });
        entry.attributes = attributes;
        entry.drivers.retain(|(name, _)| name != driver_name);
        entry.drivers.push((driver_name.to_string(), constructor));
    }

    /// Registered type names
    pub fn types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Driver names available for a type
    pub fn drivers(&self, db_type: &str) -> Result<Vec<&str>> {
        Ok(self
            .entry(db_type)?
            .drivers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect())
    }

    /// Create a connection
    pub async fn create(
        &self,
        db_type: &str,
        config: ConnectionConfig,
        mode: ConnectMode,
    ) -> Result<Connection> {
        let entry = self.entry(db_type)?;
        let constructor = Self::pick_driver(db_type, entry, config.driver.as_deref())?;

        let driver = constructor(&config);
        let mut conn = Connection::new(driver, config, entry.attributes);
        tracing::debug!(
            target: "rdbms::connection",
            db_type,
            server = %conn.server_name(),
            ?mode,
            "created connection"
        );
        if mode == ConnectMode::Connected {
            conn.open().await?;
        }
        Ok(conn)
    }

    /// Capability attributes of a type
    pub fn attributes_from_type(&self, db_type: &str, driver: Option<&str>) -> Result<DatabaseAttributes> {
        let entry = self.entry(db_type)?;
        if let Some(driver) = driver {
            if !entry.drivers.iter().any(|(name, _)| name == driver) {
                return Err(DatabaseError::unexpected(format!(
                    "{} database type has no driver \"{}\"",
                    db_type, driver
                )));
            }
        }
        Ok(entry.attributes)
    }

    fn entry(&self, db_type: &str) -> Result<&BackendEntry> {
        let key = db_type.to_lowercase();
        let key = self.aliases.get(&key).cloned().unwrap_or(key);
        self.backends.get(&key).ok_or_else(|| {
            DatabaseError::unexpected(format!("Unsupported database type \"{}\"", db_type))
        })
    }

    fn pick_driver<'a>(
        db_type: &str,
        entry: &'a BackendEntry,
        requested: Option<&str>,
    ) -> Result<&'a DriverConstructor> {
        match requested {
            Some(name) => entry
                .drivers
                .iter()
                .find(|(driver, _)| driver == name)
                .map(|(_, constructor)| constructor)
                .ok_or_else(|| {
                    DatabaseError::unexpected(format!(
                        "{} database type has no driver \"{}\"",
                        db_type, name
                    ))
                }),
            None => entry
                .drivers
                .first()
                .map(|(_, constructor)| constructor)
                .ok_or_else(|| {
                    DatabaseError::unexpected(format!(
                        "No driver available for {} (is its cargo feature enabled?)",
                        db_type
                    ))
                }),
        }
    }
}

impl Default for DatabaseFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types_registered() {
        let factory = DatabaseFactory::new();
        assert_eq!(factory.types(), vec!["mysql", "postgres", "sqlite"]);
        assert!(factory.drivers("SQLite3").is_ok());
        assert!(factory.drivers("oracle").is_err());
    }

    #[test]
    fn test_attributes_from_type() {
        let factory = DatabaseFactory::new();
        let attrs = factory.attributes_from_type("sqlite", None).unwrap();
        assert!(attrs.db_is_file);
        assert!(factory
            .attributes_from_type("postgresql", None)
            .unwrap()
            .schemas_as_table_groups);
        assert!(matches!(
            factory.attributes_from_type("oracle", None),
            Err(DatabaseError::Unexpected(_))
        ));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_create_sqlite() {
        let factory = DatabaseFactory::new();
        let conn = factory
            .create("sqlite", ConnectionConfig::sqlite(":memory:"), ConnectMode::Connected)
            .await
            .unwrap();
        assert!(conn.is_open());
        assert_eq!(conn.database_type(), DatabaseType::Sqlite);

        let lazy = factory
            .create("sqlite", ConnectionConfig::sqlite(":memory:"), ConnectMode::Unconnected)
            .await
            .unwrap();
        assert!(!lazy.is_open());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_unknown_driver_is_rejected() {
        let factory = DatabaseFactory::new();
        let mut config = ConnectionConfig::sqlite(":memory:");
        config.driver = Some("nope".into());
        let err = factory
            .create("sqlite", config, ConnectMode::Unconnected)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Unexpected(_)));
    }

    #[cfg(not(feature = "mysql"))]
    #[tokio::test]
    async fn test_disabled_backend_reports_missing_driver() {
        let factory = DatabaseFactory::new();
        let err = factory
            .create("mariadb", ConnectionConfig::default(), ConnectMode::Unconnected)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No driver available"));
    }
}
