//! Backup of PostgreSQL databases.
//!
//! A run consists of two collaborators driven by the [Orchestrator]:
//!
//! - [Catalog]: Lists the databases known to the server, once per run.
//! - [Dump]: Writes a compressed dump of a single database.
//!
//! [PgCatalog] and [PgDump] are the implementations talking to a real server.

pub mod catalog;
pub mod dump;
pub mod orchestrator;
pub mod task;

use std::collections::HashSet;
use std::path::Path;

pub use catalog::{CatalogError, PgCatalog};
pub use dump::{DumpError, PgDump};
pub use orchestrator::{BackupReport, Orchestrator};
pub use task::{BackupTask, SkipReason, TaskState};

use crate::config::BackupConfig;

/// Source of the databases existing on the server.
pub trait Catalog {
    /// Error that may happen while listing the databases.
    type Error: std::error::Error;

    /// Fetches the names of all databases of the server.
    fn existing_databases(&self, config: &BackupConfig) -> Result<ExistingDatabases, Self::Error>;
}

/// Creator of database dumps.
pub trait Dump {
    /// Dumps `database` compressed into the file at `destination`.
    ///
    /// The caller is responsible to check that the database exists.
    /// On failure a partially written `destination` is left behind.
    fn dump(
        &self,
        config: &BackupConfig,
        database: &str,
        destination: &Path,
    ) -> Result<(), DumpError>;
}

/// Names of the databases present in the server's catalog.
///
/// Fetched once per run and never refreshed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingDatabases(HashSet<String>);

impl ExistingDatabases {
    pub fn contains(&self, database: &str) -> bool {
        self.0.contains(database)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ExistingDatabases {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}
