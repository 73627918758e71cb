//! Database type definitions
//!
//! This module defines the backend families the factory knows about and the
//! capability attributes each family reports.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported database types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// SQLite database
    Sqlite,
    /// MySQL/MariaDB database
    Mysql,
    /// PostgreSQL database
    Postgres,
}

impl DatabaseType {
    /// Convert database type to its canonical registry name
    pub fn to_str(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => "sqlite",
            DatabaseType::Mysql => "mysql",
            DatabaseType::Postgres => "postgres",
        }
    }

    /// Every built-in type
    pub fn all() -> [DatabaseType; 3] {
        [DatabaseType::Sqlite, DatabaseType::Mysql, DatabaseType::Postgres]
    }

    /// Capability attributes of this backend family
    pub fn attributes(&self) -> DatabaseAttributes {
        match self {
            DatabaseType::Sqlite => DatabaseAttributes {
                db_is_file: true,
                db_level_locking: true,
                ..DatabaseAttributes::default()
            },
            DatabaseType::Mysql => DatabaseAttributes::default(),
            DatabaseType::Postgres => DatabaseAttributes {
                schemas_as_table_groups: true,
                ..DatabaseAttributes::default()
            },
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl FromStr for DatabaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(DatabaseType::Sqlite),
            "mysql" | "mariadb" => Ok(DatabaseType::Mysql),
            "postgres" | "postgresql" => Ok(DatabaseType::Postgres),
            _ => Err(format!("Invalid database type: '{}'", s)),
        }
    }
}

/// Backend capability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseAttributes {
    /// The database lives in a single local file
    pub db_is_file: bool,
    /// Writers lock the whole database rather than rows
    pub db_level_locking: bool,
    /// Schemas act as namespaces grouping tables inside one database
    pub schemas_as_table_groups: bool,
}
