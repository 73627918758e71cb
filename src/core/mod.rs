//! Backend-agnostic types and the connection engine
//!
//! Value types, configuration, statement classification, transaction
//! bookkeeping and the [`Connection`] that ties them to a backend driver.

mod atomic;
pub mod config;
pub mod connection;
mod crud;
pub mod database;
pub mod database_types;
pub mod domain;
pub mod error;
mod locking;
pub mod query;
pub mod query_builder;
pub mod transaction;
pub mod value;

pub use config::{ConnectionBuilder, ConnectionConfig, ConnectionFlags, SqliteTrxMode, TopologyRole};
pub use connection::{try_silently, Connection, ConnectionState, NamedLock};
pub use database::{Database, ReadableDatabase};
pub use database_types::{DatabaseAttributes, DatabaseType};
pub use domain::DatabaseDomain;
pub use error::{DatabaseError, QueryErrorKind, Result};
pub use locking::ScopedLock;
pub use query::{ErrorCode, Query, QueryFlags, QueryStatus, QueryVerb};
pub use query_builder::{
    Assignments, Condition, Conditions, DeleteBuilder, InsertBuilder, Join, JoinType, LikeMatch,
    Operator, OrderDirection, SelectBuilder, SelectOptions, UpdateBuilder,
};
pub use transaction::{
    AtomicSection, AtomicSectionId, Cancelable, FlushMode, SavepointState, TransactionMode,
    TransactionOutcome, TransactionStatus,
};
pub use value::{DatabaseResult, DatabaseRow, DatabaseValue, ResultWrapper};
