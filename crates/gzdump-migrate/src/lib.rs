//! # gzdump-migrate
//!
//! Resumable streaming migration of very large gzip-compressed,
//! newline-delimited document dumps into a relational destination
//! (PostgreSQL or MySQL).
//!
//! The pipeline is built to be killed and restarted without re-reading
//! terabytes of source data:
//!
//! - **Indexed decompression**: [`gzindex::GzipReader`] records restore
//!   points while it reads, so a later run seeks straight to the last
//!   durable offset instead of decompressing from the start.
//! - **Bounded staging**: reader, processor pool, writer pool and
//!   checkpointer communicate over bounded channels and share one
//!   cancellation token.
//! - **Ordered durable progress**: the checkpointer only persists offsets
//!   whose entire prefix of records has been acknowledged, and upserts make
//!   at-least-once redelivery harmless.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gzdump_migrate::{Config, Migrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> gzdump_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let migrator = Migrator::new(config).await?;
//!     let result = migrator.run(CancellationToken::new()).await?;
//!     println!("migrated {} records", result.records_read);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod destination;
pub mod error;
pub mod gzindex;
pub mod mapping;
pub mod migrator;
pub mod source;
pub mod value;

// Re-exports for convenient access
pub use checkpoint::Checkpoint;
pub use config::{Config, Conv, DestinationType, FileContents, SourceFileType};
pub use error::{MigrateError, Result};
pub use gzindex::{GzipReader, Index, IndexPoint};
pub use mapping::CompiledMapping;
pub use migrator::{MigrationResult, Migrator, RunStatus, StatsSnapshot};
pub use value::SqlValue;
