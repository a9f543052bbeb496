//! Compiled form of the field mapping.
//!
//! The YAML mapping groups entries under operator-chosen names; at runtime
//! the processor needs them grouped by destination table with pre-split
//! source paths and stable column order. Compilation also merges duplicate
//! columns across mapping groups, keeping the first definition.

use std::collections::BTreeMap;

use crate::config::{split_destination, Config, Conv};
use crate::error::{MigrateError, Result};

/// One destination column and the source field feeding it.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    /// Pre-split dotted path into the source document.
    pub src_path: Vec<String>,
    pub conv: Conv,
    pub required: bool,
    pub dupe_check: bool,
}

/// All columns mapped into one destination table.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    /// Column names in mapping order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Names of the columns forming the upsert conflict target.
    pub fn conflict_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.dupe_check)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Indexes of the dedup-key columns within `columns`.
    pub fn dupe_check_indexes(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.dupe_check)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Mapping grouped by destination table, ready for the processor and writer.
#[derive(Debug, Clone)]
pub struct CompiledMapping {
    pub tables: Vec<TableSpec>,
}

impl CompiledMapping {
    pub fn compile(config: &Config) -> Result<Self> {
        let mut tables: BTreeMap<String, TableSpec> = BTreeMap::new();

        for (group, entries) in &config.mapping {
            for entry in entries {
                let (table, column) = split_destination(&entry.dst).ok_or_else(|| {
                    MigrateError::Config(format!(
                        "mapping.{}: dst '{}' must be in table.column form",
                        group, entry.dst
                    ))
                })?;

                let spec = tables.entry(table.to_string()).or_insert_with(|| TableSpec {
                    name: table.to_string(),
                    columns: Vec::new(),
                });

                // First mapping of a column wins; later groups may repeat it.
                if spec.columns.iter().any(|c| c.name == column) {
                    continue;
                }

                spec.columns.push(ColumnSpec {
                    name: column.to_string(),
                    src_path: entry.src.split('.').map(str::to_string).collect(),
                    conv: entry.conv,
                    required: entry.required,
                    dupe_check: entry.dupe_check,
                });
            }
        }

        Ok(Self {
            tables: tables.into_values().collect(),
        })
    }
}
