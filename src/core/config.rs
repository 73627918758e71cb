//! Connection configuration
//!
//! [`ConnectionConfig`] is fully defaulted: every field has a value, so there
//! is no "merge unless present" step when a connection is created. Build it
//! fluently with [`ConnectionConfig::builder`] or deserialize it from a
//! camelCase parameter map.

use super::domain::DatabaseDomain;
use super::error::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

bitflags::bitflags! {
    /// Connection behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConnectionFlags: u32 {
        /// Log every statement at debug level
        const DEBUG = 1;
        /// Do not buffer result sets client side
        const NO_BUFFER = 2;
        /// Wrap statements in an implicit transaction opened on first use
        const TRX = 8;
        /// Keep the connection open across requests
        const PERSISTENT = 32;
        /// Negotiate TLS
        const SSL = 256;
        /// Use protocol compression
        const COMPRESS = 512;
    }
}

/// Flags travel as their integer bit pattern in parameter maps
mod flag_bits {
    use super::ConnectionFlags;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(flags: &ConnectionFlags, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u32(flags.bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ConnectionFlags, D::Error> {
        u32::deserialize(d).map(ConnectionFlags::from_bits_truncate)
    }
}

/// Replication role of the server behind a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyRole {
    /// Writable primary
    #[default]
    Primary,
    /// Replica applying the primary's changes
    StreamingReplica,
    /// Frozen copy that never receives changes
    StaticClone,
}

/// SQLite transaction start mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqliteTrxMode {
    /// Take locks lazily
    #[default]
    Deferred,
    /// Take the write lock at BEGIN
    Immediate,
    /// Take an exclusive lock at BEGIN
    Exclusive,
}

impl SqliteTrxMode {
    /// The BEGIN statement for this mode
    pub fn begin_sql(&self) -> &'static str {
        match self {
            SqliteTrxMode::Deferred => "BEGIN",
            SqliteTrxMode::Immediate => "BEGIN IMMEDIATE",
            SqliteTrxMode::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Everything a backend driver needs to open and run a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Server host name or address
    pub host: Option<String>,
    /// Server port
    pub port: Option<u16>,
    /// User name
    pub user: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Database selected at connect time
    pub dbname: Option<String>,
    /// Schema selected at connect time
    pub schema: Option<String>,
    /// Prefix prepended to unqualified table names
    pub table_prefix: String,
    /// Behaviour flags
    #[serde(with = "flag_bits")]
    pub flags: ConnectionFlags,
    /// Client driver for backends that have more than one
    pub driver: Option<String>,
    /// Session variables applied right after connecting
    pub variables: BTreeMap<String, String>,
    /// Replication role of the server
    pub topology_role: TopologyRole,
    /// Load balancer hints (`readOnlyReason` marks the server read-only)
    pub lb_info: BTreeMap<String, String>,
    /// Whether the process is a long running command line job
    pub cli_mode: bool,
    /// Agent string attached to statements for server-side attribution
    pub agent: Option<String>,
    /// Display name of the server in logs and errors
    pub server_name: Option<String>,
    /// Rows per batch when INSERT…SELECT is emulated client side
    pub non_native_insert_select_batch_size: usize,
    /// SQLite: database file path (`:memory:` for an in-memory database)
    pub db_file_path: Option<String>,
    /// SQLite: directory holding `<dbname>.sqlite` files
    pub db_directory: Option<String>,
    /// SQLite: directory for named-lock files
    pub lock_directory: Option<String>,
    /// SQLite: transaction start mode
    pub trx_mode: SqliteTrxMode,
    /// Connect timeout in seconds
    pub conn_timeout: u64,
    /// Per-statement timeout in seconds
    pub receive_timeout: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            user: None,
            password: None,
            dbname: None,
            schema: None,
            table_prefix: String::new(),
            flags: ConnectionFlags::empty(),
            driver: None,
            variables: BTreeMap::new(),
            topology_role: TopologyRole::Primary,
            lb_info: BTreeMap::new(),
            cli_mode: true,
            agent: None,
            server_name: None,
            non_native_insert_select_batch_size: 10_000,
            db_file_path: None,
            db_directory: None,
            lock_directory: None,
            trx_mode: SqliteTrxMode::Deferred,
            conn_timeout: 10,
            receive_timeout: 30,
        }
    }
}

impl ConnectionConfig {
    /// Start a fluent builder
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::default()
    }

    /// Deserialize from a JSON parameter map
    ///
    /// Unknown keys (loggers, profilers, caches) are ignored; logging goes
    /// through `tracing`.
    pub fn from_params(params: serde_json::Value) -> Result<Self> {
        serde_json::from_value(params)
            .map_err(|e| DatabaseError::unexpected(format!("Invalid connection parameters: {}", e)))
    }

    /// SQLite config for a database file (or `:memory:`)
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            db_file_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Domain selected when the connection opens
    pub fn initial_domain(&self) -> DatabaseDomain {
        let schema = self.dbname.as_ref().and(self.schema.clone());
        DatabaseDomain::new(self.dbname.clone(), schema, self.table_prefix.clone())
            .unwrap_or_else(|_| DatabaseDomain::empty().with_prefix(self.table_prefix.clone()))
    }

    /// Name used for the server in logs and errors
    pub fn display_server(&self) -> String {
        if let Some(name) = &self.server_name {
            return name.clone();
        }
        if let Some(path) = &self.db_file_path {
            return path.clone();
        }
        match (&self.host, self.port) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.clone(),
            _ => "localhost".to_string(),
        }
    }

    /// Whether a flag is set
    pub fn has_flag(&self, flag: ConnectionFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.conn_timeout.max(1))
    }

    /// Statement timeout
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout.max(1))
    }

    /// Why the server must not be written to, if it must not
    pub fn read_only_reason(&self) -> Option<String> {
        if let Some(reason) = self.lb_info.get("readOnlyReason") {
            return Some(reason.clone());
        }
        match self.topology_role {
            TopologyRole::Primary => None,
            TopologyRole::StreamingReplica => {
                Some("Server is configured as a read-only replica database".to_string())
            }
            TopologyRole::StaticClone => {
                Some("Server is configured as a read-only static clone database".to_string())
            }
        }
    }
}

/// Fluent builder for [`ConnectionConfig`]
#[derive(Debug, Clone, Default)]
pub struct ConnectionBuilder {
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    /// Set the database host
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = Some(host.into());
        self
    }

    /// Set the database port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Set the database name
    pub fn database<S: Into<String>>(mut self, database: S) -> Self {
        self.config.dbname = Some(database.into());
        self
    }

    /// Set the schema
    pub fn schema<S: Into<String>>(mut self, schema: S) -> Self {
        self.config.schema = Some(schema.into());
        self
    }

    /// Set the table prefix
    pub fn table_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.table_prefix = prefix.into();
        self
    }

    /// Set the username
    pub fn username<S: Into<String>>(mut self, username: S) -> Self {
        self.config.user = Some(username.into());
        self
    }

    /// Set the password
    pub fn password<S: Into<String>>(mut self, password: S) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Add connection flags
    pub fn flags(mut self, flags: ConnectionFlags) -> Self {
        self.config.flags |= flags;
        self
    }

    /// Pick the client driver
    pub fn driver<S: Into<String>>(mut self, driver: S) -> Self {
        self.config.driver = Some(driver.into());
        self
    }

    /// Add a session variable
    pub fn variable<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.config.variables.insert(key.into(), value.into());
        self
    }

    /// Set the replication role
    pub fn topology_role(mut self, role: TopologyRole) -> Self {
        self.config.topology_role = role;
        self
    }

    /// Add a load balancer hint
    pub fn lb_info<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.config.lb_info.insert(key.into(), value.into());
        self
    }

    /// Mark the process as a command line job (or not)
    pub fn cli_mode(mut self, cli_mode: bool) -> Self {
        self.config.cli_mode = cli_mode;
        self
    }

    /// Set the agent string
    pub fn agent<S: Into<String>>(mut self, agent: S) -> Self {
        self.config.agent = Some(agent.into());
        self
    }

    /// Set the server display name
    pub fn server_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.server_name = Some(name.into());
        self
    }

    /// Set the emulated INSERT…SELECT batch size
    pub fn insert_select_batch_size(mut self, size: usize) -> Self {
        self.config.non_native_insert_select_batch_size = size.max(1);
        self
    }

    /// SQLite database file
    pub fn db_file_path<S: Into<String>>(mut self, path: S) -> Self {
        self.config.db_file_path = Some(path.into());
        self
    }

    /// SQLite database directory
    pub fn db_directory<S: Into<String>>(mut self, dir: S) -> Self {
        self.config.db_directory = Some(dir.into());
        self
    }

    /// SQLite lock directory
    pub fn lock_directory<S: Into<String>>(mut self, dir: S) -> Self {
        self.config.lock_directory = Some(dir.into());
        self
    }

    /// SQLite transaction start mode
    pub fn trx_mode(mut self, mode: SqliteTrxMode) -> Self {
        self.config.trx_mode = mode;
        self
    }

    /// Connect timeout in seconds
    pub fn conn_timeout(mut self, secs: u64) -> Self {
        self.config.conn_timeout = secs;
        self
    }

    /// Statement timeout in seconds
    pub fn receive_timeout(mut self, secs: u64) -> Self {
        self.config.receive_timeout = secs;
        self
    }

    /// Finish building
    pub fn build(self) -> ConnectionConfig {
        self.config
    }

    /// Libpq-style key/value connection string
    pub fn build_postgres_connection_string(&self) -> String {
        postgres_connection_string(&self.config)
    }
}

/// Libpq-style key/value connection string for a config
pub fn postgres_connection_string(config: &ConnectionConfig) -> String {
    let mut parts = Vec::new();
    if let Some(host) = &config.host {
        parts.push(format!("host={}", host));
    }
    if let Some(port) = config.port {
        parts.push(format!("port={}", port));
    }
    if let Some(database) = &config.dbname {
        parts.push(format!("dbname={}", database));
    }
    if let Some(user) = &config.user {
        parts.push(format!("user={}", user));
    }
    if let Some(password) = &config.password {
        parts.push(format!("password={}", password));
    }
    parts.push(format!("connect_timeout={}", config.conn_timeout.max(1)));
    if let Some(agent) = &config.agent {
        parts.push(format!("application_name='{}'", agent.replace('\'', "")));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_complete() {
        let config = ConnectionConfig::default();
        assert_eq!(config.table_prefix, "");
        assert!(config.flags.is_empty());
        assert_eq!(config.topology_role, TopologyRole::Primary);
        assert_eq!(config.non_native_insert_select_batch_size, 10_000);
        assert!(config.read_only_reason().is_none());
    }

    #[test]
    fn test_from_params_ignores_logger_keys() {
        let config = ConnectionConfig::from_params(serde_json::json!({
            "dbFilePath": ":memory:",
            "tablePrefix": "mw_",
            "flags": 8,
            "variables": { "synchronous": "NORMAL" },
            "queryLogger": "ignored",
            "topologyRole": "streaming-replica"
        }))
        .unwrap();

        assert_eq!(config.db_file_path.as_deref(), Some(":memory:"));
        assert_eq!(config.table_prefix, "mw_");
        assert!(config.has_flag(ConnectionFlags::TRX));
        assert_eq!(config.variables.get("synchronous").map(String::as_str), Some("NORMAL"));
        assert!(config.read_only_reason().is_some());
    }

    #[test]
    fn test_builder_postgres_string() {
        let builder = ConnectionConfig::builder()
            .host("localhost")
            .port(5432)
            .database("mydb")
            .username("user")
            .password("pass");

        let conn_str = builder.build_postgres_connection_string();
        assert!(conn_str.contains("host=localhost"));
        assert!(conn_str.contains("port=5432"));
        assert!(conn_str.contains("dbname=mydb"));
        assert!(conn_str.contains("user=user"));
        assert!(conn_str.contains("password=pass"));
    }

    #[test]
    fn test_initial_domain() {
        let config = ConnectionConfig::builder()
            .database("wiki")
            .schema("public")
            .table_prefix("mw_")
            .build();
        assert_eq!(config.initial_domain().id(), "wiki-public-mw_");

        let config = ConnectionConfig::builder().schema("public").build();
        assert!(config.initial_domain().database().is_none());
    }

    #[test]
    fn test_lb_info_read_only() {
        let config = ConnectionConfig::builder()
            .lb_info("readOnlyReason", "maintenance")
            .build();
        assert_eq!(config.read_only_reason().as_deref(), Some("maintenance"));
    }
}
