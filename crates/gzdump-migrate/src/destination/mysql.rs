//! MySQL/MariaDB destination implementation.
//!
//! Uses SQLx for connection pooling and `INSERT ... ON DUPLICATE KEY UPDATE`
//! batching. MySQL resolves the conflict target through unique indexes, so
//! the dedup-key columns must be covered by one.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use tracing::info;

use crate::config::Conv;
use crate::error::{MigrateError, Result};
use crate::mapping::{CompiledMapping, TableSpec};
use crate::value::SqlValue;

use super::Destination;

const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// MySQL caps prepared statements at 65,535 placeholders.
const MYSQL_MAX_PLACEHOLDERS: usize = 65_535;

pub struct MysqlDestination {
    pool: MySqlPool,
}

impl MysqlDestination {
    /// Create a pooled connection from a DSN and probe it.
    pub async fn connect(dsn: &str, max_conns: usize) -> Result<Self> {
        let options = MySqlConnectOptions::from_str(dsn)
            .map_err(|e| MigrateError::Config(format!("invalid MySQL DSN: {}", e)))?
            .charset("utf8mb4");

        let pool = MySqlPoolOptions::new()
            .max_connections(max_conns as u32)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::pool(e, "creating MySQL destination pool"))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| MigrateError::pool(e, "testing MySQL destination connection"))?;

        info!("connected to MySQL destination");
        Ok(Self { pool })
    }
}

/// Quote a MySQL identifier.
fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Build a multi-row `INSERT ... ON DUPLICATE KEY UPDATE` statement.
///
/// Non-key columns take the incoming value on conflict; a table whose
/// columns are all keys self-assigns the first column, which MySQL treats
/// as a no-op update.
pub(crate) fn build_upsert_sql(
    table: &str,
    columns: &[&str],
    conflict_columns: &[&str],
    num_rows: usize,
) -> String {
    let col_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();

    let row_placeholder = format!(
        "({})",
        std::iter::repeat("?")
            .take(columns.len())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let placeholders = std::iter::repeat(row_placeholder.as_str())
        .take(num_rows)
        .collect::<Vec<_>>()
        .join(", ");

    let mut updates: Vec<String> = columns
        .iter()
        .filter(|c| !conflict_columns.contains(c))
        .map(|c| format!("{} = VALUES({})", quote_ident(c), quote_ident(c)))
        .collect();
    if updates.is_empty() {
        let first = quote_ident(columns[0]);
        updates.push(format!("{} = {}", first, first));
    }

    format!(
        "INSERT INTO {} ({}) VALUES {} ON DUPLICATE KEY UPDATE {}",
        quote_ident(table),
        col_list.join(", "),
        placeholders,
        updates.join(", ")
    )
}

/// MySQL column types each conversion tag may feed.
fn compatible_types(conv: Conv) -> &'static [&'static str] {
    match conv {
        Conv::Int => &["tinyint", "smallint", "mediumint", "int", "bigint", "decimal"],
        Conv::Float => &["float", "double", "decimal"],
        Conv::String => &["char", "varchar", "tinytext", "text", "mediumtext", "longtext"],
        Conv::Bool => &["tinyint", "bit"],
        Conv::Date => &["date"],
        Conv::Datetime | Conv::Timestamp => &["datetime", "timestamp"],
        Conv::Bson => &["json", "text", "mediumtext", "longtext"],
        Conv::Base64 => &["blob", "tinyblob", "mediumblob", "longblob", "binary", "varbinary"],
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, MySqlArguments>,
    value: &SqlValue,
) -> sqlx::query::Query<'q, sqlx::MySql, MySqlArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Bytes(b) => query.bind(b.clone()),
        SqlValue::Date(d) => query.bind(*d),
        SqlValue::DateTime(dt) => query.bind(*dt),
        SqlValue::Json(v) => query.bind(sqlx::types::Json(v.clone())),
    }
}

#[async_trait]
impl Destination for MysqlDestination {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn validate_mapping(&self, mapping: &CompiledMapping) -> Result<()> {
        for table in &mapping.tables {
            let exists: i64 = sqlx::query(
                "SELECT COUNT(*) AS n FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = ?",
            )
            .bind(&table.name)
            .fetch_one(&self.pool)
            .await?
            .get("n");
            if exists == 0 {
                return Err(MigrateError::SchemaMismatch(format!(
                    "destination table '{}' does not exist",
                    table.name
                )));
            }

            for column in &table.columns {
                let row = sqlx::query(
                    "SELECT DATA_TYPE AS data_type FROM information_schema.columns \
                     WHERE table_schema = DATABASE() AND table_name = ? AND column_name = ?",
                )
                .bind(&table.name)
                .bind(&column.name)
                .fetch_optional(&self.pool)
                .await?;

                let data_type: String = match row {
                    Some(row) => row.get("data_type"),
                    None => {
                        return Err(MigrateError::SchemaMismatch(format!(
                            "destination column '{}.{}' does not exist",
                            table.name, column.name
                        )))
                    }
                };

                let accepted = compatible_types(column.conv);
                if !accepted.contains(&data_type.to_lowercase().as_str()) {
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
        if rows.len() * table.columns.len() > MYSQL_MAX_PLACEHOLDERS {
            return Err(MigrateError::DestinationWrite(format!(
                "batch of {} rows x {} columns exceeds MySQL's placeholder limit",
                rows.len(),
                table.columns.len()
            )));
        }

        let sql = build_upsert_sql(
            &table.name,
            &table.column_names(),
            &table.conflict_columns(),
            rows.len(),
        );

        let mut query = sqlx::query(&sql);
        for row in rows {
            for value in row {
                query = bind_value(query, value);
            }
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
