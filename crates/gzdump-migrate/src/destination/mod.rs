//! Destination database drivers.
//!
//! A destination validates the mapped schema up front and performs batched
//! upserts using the dedup-key columns as the conflict target. The writer
//! pool works against `Arc<dyn Destination>`, so drivers can be swapped per
//! configuration:
//!
//! - [`postgres::PostgresDestination`]: deadpool-postgres + tokio-postgres
//! - [`mysql::MysqlDestination`]: SQLx MySQL pool

pub mod mysql;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{DestinationConfig, DestinationType};
use crate::error::Result;
use crate::mapping::{CompiledMapping, TableSpec};
use crate::value::SqlValue;

/// A relational destination accepting idempotent batched writes.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<()>;

    /// Verify every mapped table exists and each destination column's type
    /// is compatible with its conversion tag. Runs before any write;
    /// failures are `MigrateError::SchemaMismatch`.
    async fn validate_mapping(&self, mapping: &CompiledMapping) -> Result<()>;

    /// Upsert a batch of rows into one table. Rows are in mapping column
    /// order; the conflict target is the table's dedup-key columns.
    async fn upsert(&self, table: &TableSpec, rows: &[Vec<SqlValue>]) -> Result<u64>;
}

/// Connect to the configured destination.
pub async fn connect(
    config: &DestinationConfig,
    max_conns: usize,
) -> Result<Arc<dyn Destination>> {
    match config.r#type {
        DestinationType::Postgres => Ok(Arc::new(
            postgres::PostgresDestination::connect(&config.dsn, max_conns).await?,
        )),
        DestinationType::Mysql => Ok(Arc::new(
            mysql::MysqlDestination::connect(&config.dsn, max_conns).await?,
        )),
    }
}
