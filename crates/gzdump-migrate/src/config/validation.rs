//! Configuration validation.

use std::str::FromStr;
use std::time::Duration;

use super::{Config, DestinationType};
use crate::error::{MigrateError, Result};

const MIN_WORKERS: usize = 1;
const MAX_WORKERS: usize = 100;
const MIN_BATCH_SIZE: usize = 1;
const MAX_BATCH_SIZE: usize = 10_000;
const MIN_CHECKPOINT_INTERVAL: Duration = Duration::from_millis(1);
const MAX_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(3600);

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_pipeline(config)?;
    validate_source(config)?;
    validate_destination(config)?;
    validate_mapping(config)?;
    Ok(())
}

fn validate_pipeline(config: &Config) -> Result<()> {
    let p = &config.pipeline;

    if let Some(n) = p.num_processors {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&n) {
            return Err(MigrateError::Config(format!(
                "pipeline.num_processors must be between {} and {}",
                MIN_WORKERS, MAX_WORKERS
            )));
        }
    }
    if let Some(n) = p.num_writers {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&n) {
            return Err(MigrateError::Config(format!(
                "pipeline.num_writers must be between {} and {}",
                MIN_WORKERS, MAX_WORKERS
            )));
        }
    }
    if let Some(n) = p.batch_size {
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&n) {
            return Err(MigrateError::Config(format!(
                "pipeline.batch_size must be between {} and {}",
                MIN_BATCH_SIZE, MAX_BATCH_SIZE
            )));
        }
    }
    if let Some(d) = p.checkpoint_interval {
        if d.0 < MIN_CHECKPOINT_INTERVAL || d.0 > MAX_CHECKPOINT_INTERVAL {
            return Err(MigrateError::Config(
                "pipeline.checkpoint_interval must be between 1ms and 1h".into(),
            ));
        }
    }
    if let Some(0) = p.max_record_len {
        return Err(MigrateError::Config(
            "pipeline.max_record_len must be at least 1".into(),
        ));
    }
    if let Some(0) = p.index_interval {
        return Err(MigrateError::Config(
            "pipeline.index_interval must be at least 1".into(),
        ));
    }
    if let Some(path) = &p.checkpoint_file {
        if path.as_os_str().is_empty() {
            return Err(MigrateError::Config(
                "pipeline.checkpoint_file cannot be empty".into(),
            ));
        }
    }

    Ok(())
}

fn validate_source(config: &Config) -> Result<()> {
    let s = &config.source;
    if s.file.as_os_str().is_empty() {
        return Err(MigrateError::Config("source.file cannot be empty".into()));
    }
    match std::fs::metadata(&s.file) {
        Ok(meta) if meta.is_dir() => Err(MigrateError::Config(format!(
            "source.file {} is a directory",
            s.file.display()
        ))),
        Ok(_) => Ok(()),
        Err(_) => Err(MigrateError::Config(format!(
            "source.file {} does not exist",
            s.file.display()
        ))),
    }
}

fn validate_destination(config: &Config) -> Result<()> {
    let d = &config.destination;
    if d.dsn.is_empty() {
        return Err(MigrateError::Config(
            "destination.dsn cannot be empty".into(),
        ));
    }
    match d.r#type {
        DestinationType::Postgres => {
            tokio_postgres::Config::from_str(&d.dsn).map_err(|e| {
                MigrateError::Config(format!("destination.dsn is not a valid PostgreSQL DSN: {}", e))
            })?;
        }
        DestinationType::Mysql => {
            sqlx::mysql::MySqlConnectOptions::from_str(&d.dsn).map_err(|e| {
                MigrateError::Config(format!("destination.dsn is not a valid MySQL DSN: {}", e))
            })?;
        }
    }
    Ok(())
}

fn validate_mapping(config: &Config) -> Result<()> {
    if config.mapping.is_empty() {
        return Err(MigrateError::Config("mapping cannot be empty".into()));
    }

    for (name, entries) in &config.mapping {
        if entries.is_empty() {
            return Err(MigrateError::Config(format!(
                "mapping.{} has no entries",
                name
            )));
        }
        for entry in entries {
            if entry.src.is_empty() {
                return Err(MigrateError::Config(format!(
                    "mapping.{}: src cannot be empty",
                    name
                )));
            }
            if super::split_destination(&entry.dst).is_none() {
                return Err(MigrateError::Config(format!(
                    "mapping.{}: dst '{}' must be in table.column form",
                    name, entry.dst
                )));
            }
        }
    }

    // Upserts use the dedup keys as conflict target, so every destination
    // table needs at least one when dedup is enabled.
    if !config.pipeline.disable_dupecheck {
        use std::collections::BTreeMap;
        let mut tables: BTreeMap<&str, bool> = BTreeMap::new();
        for entries in config.mapping.values() {
            for entry in entries {
                if let Some((table, _)) = super::split_destination(&entry.dst) {
                    let has_key = tables.entry(table).or_insert(false);
                    *has_key |= entry.dupe_check;
                }
            }
        }
        for (table, has_key) in tables {
            if !has_key {
                return Err(MigrateError::Config(format!(
                    "destination table '{}' has no dupe_check column; \
                     add one or set pipeline.disable_dupecheck",
                    table
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::valid_config;

    #[test]
    fn test_valid_config() {
        let (_dir, config) = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_source_file() {
        let (_dir, mut config) = valid_config();
        config.source.file = "/nonexistent/dump.gz".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_out_of_range_workers() {
        let (_dir, mut config) = valid_config();
        config.pipeline.num_processors = Some(0);
        assert!(validate(&config).is_err());

        config.pipeline.num_processors = Some(101);
        assert!(validate(&config).is_err());

        config.pipeline.num_processors = Some(8);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_out_of_range_batch_size() {
        let (_dir, mut config) = valid_config();
        config.pipeline.batch_size = Some(0);
        assert!(validate(&config).is_err());
        config.pipeline.batch_size = Some(10_001);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_checkpoint_interval_bounds() {
        use crate::config::ConfigDuration;
        let (_dir, mut config) = valid_config();
        config.pipeline.checkpoint_interval =
            Some(ConfigDuration(Duration::from_micros(500)));
        assert!(validate(&config).is_err());
        config.pipeline.checkpoint_interval = Some(ConfigDuration(Duration::from_secs(7200)));
        assert!(validate(&config).is_err());
        config.pipeline.checkpoint_interval = Some(ConfigDuration(Duration::from_millis(1)));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_bad_dsn() {
        let (_dir, mut config) = valid_config();
        config.destination.dsn = "::not a dsn::".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_bad_dst_format() {
        let (_dir, mut config) = valid_config();
        config.mapping.get_mut("docs").unwrap()[0].dst = "no_column_part".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_dupe_check_column() {
        let (_dir, mut config) = valid_config();
        for entries in config.mapping.values_mut() {
            for e in entries.iter_mut() {
                e.dupe_check = false;
            }
        }
        assert!(validate(&config).is_err());

        // Disabling dedup lifts the requirement.
        config.pipeline.disable_dupecheck = true;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_empty_mapping() {
        let (_dir, mut config) = valid_config();
        config.mapping.clear();
        assert!(validate(&config).is_err());
    }
}
