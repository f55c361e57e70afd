mod config;
mod connection;
mod error;
mod schema;
mod storage;

pub use config::DbConfig;
pub use connection::{ConnectionPool, DbConnection, TransactionWrapper};
pub use error::{DbError, Result};
pub use schema::{validate_schema_name, SchemaManager, INDEXERS_TABLE, SCHEMA_SEQUENCE};
pub use storage::{allocate_schema_name, PgStorage, PgTransaction};
