//! PostgreSQL destination implementation.
//!
//! Uses deadpool-postgres for connection pooling and multi-row
//! `INSERT ... ON CONFLICT` upserts with cached prepared statements.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tracing::info;

use crate::config::Conv;
use crate::error::{MigrateError, Result};
use crate::mapping::{CompiledMapping, TableSpec};
use crate::value::SqlValue;

use super::Destination;

const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PostgresDestination {
    pool: Pool,
}

impl PostgresDestination {
    /// Create a pooled connection from a DSN and probe it.
    pub async fn connect(dsn: &str, max_conns: usize) -> Result<Self> {
        let mut pg_config = tokio_postgres::Config::from_str(dsn)
            .map_err(|e| MigrateError::Config(format!("invalid PostgreSQL DSN: {}", e)))?;
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);
        pg_config.keepalives(true);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(max_conns)
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL destination pool"))?;

        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "testing PostgreSQL destination connection"))?;
        client.simple_query("SELECT 1").await?;

        info!("connected to PostgreSQL destination");
        Ok(Self { pool })
    }
}

/// Quote a PostgreSQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Build a multi-row upsert statement with `$n` placeholders.
///
/// Non-key columns take the incoming value on conflict; a table whose
/// columns are all keys degrades to DO NOTHING.
pub(crate) fn build_upsert_sql(
    table: &str,
    columns: &[&str],
    conflict_columns: &[&str],
    num_rows: usize,
) -> String {
    let col_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();

    let mut placeholders = Vec::with_capacity(num_rows);
    let mut p = 1;
    for _ in 0..num_rows {
        let row: Vec<String> = (0..columns.len())
            .map(|_| {
                let s = format!("${}", p);
                p += 1;
                s
            })
            .collect();
        placeholders.push(format!("({})", row.join(", ")));
    }

    let conflict_list: Vec<String> = conflict_columns.iter().map(|c| quote_ident(c)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !conflict_columns.contains(c))
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {}",
        quote_ident(table),
        col_list.join(", "),
        placeholders.join(", "),
        conflict_list.join(", "),
        action
    )
}

/// PostgreSQL column types each conversion tag may feed.
fn compatible_types(conv: Conv) -> &'static [&'static str] {
    match conv {
        Conv::Int => &["smallint", "integer", "bigint"],
        Conv::Float => &["real", "double precision"],
        Conv::String => &["text", "character varying", "character"],
        Conv::Bool => &["boolean"],
        Conv::Date => &["date"],
        Conv::Datetime | Conv::Timestamp => {
            &["timestamp without time zone", "timestamp with time zone"]
        }
        Conv::Bson => &["jsonb", "json"],
        Conv::Base64 => &["bytea"],
    }
}

#[async_trait]
impl Destination for PostgresDestination {
    async fn ping(&self) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "pinging PostgreSQL destination"))?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn validate_mapping(&self, mapping: &CompiledMapping) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "validating destination mapping"))?;

        for table in &mapping.tables {
            let exists: bool = client
                .query_one(
                    "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
                    &[&table.name],
                )
                .await?
                .get(0);
            if !exists {
                return Err(MigrateError::SchemaMismatch(format!(
                    "destination table '{}' does not exist",
                    table.name
                )));
            }

            for column in &table.columns {
                let row = client
                    .query_opt(
                        "SELECT data_type FROM information_schema.columns \
                         WHERE table_name = $1 AND column_name = $2",
                        &[&table.name, &column.name],
                    )
                    .await?;
                let data_type: String = match row {
                    Some(row) => row.get(0),
                    None => {
                        return Err(MigrateError::SchemaMismatch(format!(
                            "destination column '{}.{}' does not exist",
                            table.name, column.name
                        )))
                    }
                };

                let accepted = compatible_types(column.conv);
                if !accepted.contains(&data_type.as_str()) {
                    return Err(MigrateError::SchemaMismatch(format!(
                        "column '{}.{}' has type '{}', incompatible with conv '{}' \
                         (accepts: {})",
                        table.name,
                        column.name,
                        data_type,
                        column.conv.as_str(),
                        accepted.join(", ")
                    )));
                }
            }
        }

        Ok(())
    }

    async fn upsert(&self, table: &TableSpec, rows: &[Vec<SqlValue>]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let client = self
            .pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "acquiring connection for upsert"))?;

        let sql = build_upsert_sql(
            &table.name,
            &table.column_names(),
            &table.conflict_columns(),
            rows.len(),
        );
        let stmt = client.prepare_cached(&sql).await?;

        let params: Vec<&(dyn ToSql + Sync)> = rows
            .iter()
            .flatten()
            .map(|v| v as &(dyn ToSql + Sync))
            .collect();

        let affected = client.execute(&stmt, &params).await?;
        Ok(affected)
    }
}
