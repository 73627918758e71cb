//! Database domains
//!
//! A domain is the `(database, schema, table prefix)` triple that unqualified
//! table names resolve against. Domains have a compact string ID so they can
//! be passed around as plain keys.

use super::error::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Addressable scope of unqualified table references
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseDomain {
    database: Option<String>,
    schema: Option<String>,
    prefix: String,
}

impl DatabaseDomain {
    /// Create a domain
    ///
    /// A schema without a database is rejected: the schema has nothing to
    /// resolve against.
    pub fn new(
        database: Option<impl Into<String>>,
        schema: Option<impl Into<String>>,
        prefix: impl Into<String>,
    ) -> Result<Self> {
        let database = database.map(Into::into);
        let schema = schema.map(Into::into);
        if database.is_none() && schema.is_some() {
            return Err(DatabaseError::expected(
                "Schema set without a database in domain",
            ));
        }
        Ok(Self {
            database,
            schema,
            prefix: prefix.into(),
        })
    }

    /// The "don't care" domain: no database, no schema, no prefix
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a domain ID as produced by [`DatabaseDomain::id`]
    pub fn from_id(id: &str) -> Result<Self> {
        if id.is_empty() {
            return Ok(Self::empty());
        }
        let parts: Vec<String> = id.split('-').map(unescape_part).collect();
        let (database, schema, prefix) = match parts.as_slice() {
            [database] => (Some(database.clone()), None, String::new()),
            [database, prefix] => (Some(database.clone()), None, prefix.clone()),
            [database, schema, prefix] => {
                (Some(database.clone()), Some(schema.clone()), prefix.clone())
            }
            _ => {
                return Err(DatabaseError::expected(format!(
                    "Domain ID '{}' has too many components",
                    id
                )))
            }
        };
        Ok(Self {
            database: database.filter(|db| !db.is_empty()),
            schema,
            prefix,
        })
    }

    /// Database name, if one is selected
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Schema name, if one is selected
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Table prefix (possibly empty)
    pub fn table_prefix(&self) -> &str {
        &self.prefix
    }

    /// Copy with a different database
    pub fn with_database(&self, database: Option<String>) -> Self {
        Self {
            database,
            ..self.clone()
        }
    }

    /// Copy with a different schema
    pub fn with_schema(&self, schema: Option<String>) -> Self {
        Self {
            schema,
            ..self.clone()
        }
    }

    /// Copy with a different table prefix
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..self.clone()
        }
    }

    /// String ID: `database[-schema][-prefix]` with `?` → `??` and `-` → `?h`
    pub fn id(&self) -> String {
        let mut parts = vec![escape_part(self.database.as_deref().unwrap_or(""))];
        if let Some(schema) = &self.schema {
            parts.push(escape_part(schema));
        }
        let mut id = parts.join("-");
        if !self.prefix.is_empty() || self.schema.is_some() {
            id.push('-');
            id.push_str(&escape_part(&self.prefix));
        }
        id
    }

    /// Whether every component set on `self` agrees with `other`
    pub fn is_compatible(&self, other: &DatabaseDomain) -> bool {
        let db_ok = self.database.is_none() || self.database == other.database;
        let schema_ok = self.schema.is_none() || self.schema == other.schema;
        db_ok && schema_ok && self.prefix == other.prefix
    }

    /// Whether no component is set
    pub fn is_unset(&self) -> bool {
        self.database.is_none() && self.schema.is_none() && self.prefix.is_empty()
    }
}

impl fmt::Display for DatabaseDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

impl FromStr for DatabaseDomain {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_id(s)
    }
}

fn escape_part(part: &str) -> String {
    part.replace('?', "??").replace('-', "?h")
}

fn unescape_part(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut chars = part.chars();
    while let Some(c) = chars.next() {
        if c != '?' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push('-'),
            Some('?') => out.push('?'),
            Some(other) => {
                out.push('?');
                out.push(other);
            }
            None => out.push('?'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_forms() {
        let d = DatabaseDomain::new(Some("wiki"), None::<String>, "").unwrap();
        assert_eq!(d.id(), "wiki");

        let d = DatabaseDomain::new(Some("wiki"), None::<String>, "mw_").unwrap();
        assert_eq!(d.id(), "wiki-mw_");

        let d = DatabaseDomain::new(Some("wiki"), Some("public"), "mw_").unwrap();
        assert_eq!(d.id(), "wiki-public-mw_");

        let d = DatabaseDomain::new(Some("my-db"), None::<String>, "a?b").unwrap();
        assert_eq!(d.id(), "my?hdb-a??b");
    }

    #[test]
    fn test_from_id() {
        let d = DatabaseDomain::from_id("my?hdb-public-pre_").unwrap();
        assert_eq!(d.database(), Some("my-db"));
        assert_eq!(d.schema(), Some("public"));
        assert_eq!(d.table_prefix(), "pre_");

        let d = DatabaseDomain::from_id("wiki-mw_").unwrap();
        assert_eq!(d.database(), Some("wiki"));
        assert_eq!(d.schema(), None);
        assert_eq!(d.table_prefix(), "mw_");

        assert!(DatabaseDomain::from_id("").unwrap().is_unset());
        assert!(DatabaseDomain::from_id("a-b-c-d").is_err());
    }

    #[test]
    fn test_schema_requires_database() {
        assert!(DatabaseDomain::new(None::<String>, Some("public"), "").is_err());
    }

    #[test]
    fn test_compatibility() {
        let full = DatabaseDomain::new(Some("wiki"), Some("public"), "").unwrap();
        let loose = DatabaseDomain::new(None::<String>, None::<String>, "").unwrap();
        assert!(loose.is_compatible(&full));
        assert!(!full.is_compatible(&loose));
    }
}
