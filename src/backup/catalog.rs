use derive_more::{Display, Error};
use postgres::{Client, NoTls};

use super::{Catalog, ExistingDatabases};
use crate::config::BackupConfig;

const LIST_DATABASES: &str = "SELECT datname FROM pg_database";

/// Errors on fetching the catalog of the server.
#[derive(Debug, Display, Error)]
pub enum CatalogError {
    /// The server is unreachable or rejected the credentials.
    #[display("Connecting to database '{database}' on {host}:{port} failed: {source}")]
    Connect {
        #[error(not(source))]
        host: String,
        #[error(not(source))]
        port: u16,
        #[error(not(source))]
        database: String,
        source: postgres::Error,
    },
    /// Listing the databases failed.
    #[display("Listing the databases failed: {_0}")]
    Query(postgres::Error),
}

/// [Catalog] reading `pg_database` of a PostgreSQL server.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgCatalog;

impl PgCatalog {
    fn connect(config: &BackupConfig) -> Result<Client, CatalogError> {
        log::debug!(
            target: "backup::catalog",
            "Connecting to {}:{} as '{}' using database '{}'",
            config.host(),
            config.port(),
            config.user(),
            config.probe_database()
        );

        postgres::Config::new()
            .host(config.host())
            .port(config.port())
            .user(config.user())
            .password(config.password().expose())
            .dbname(config.probe_database())
            .connect(NoTls)
            .map_err(|source| CatalogError::Connect {
                host: config.host().to_string(),
                port: config.port(),
                database: config.probe_database().to_string(),
                source,
            })
    }
}

impl Catalog for PgCatalog {
    type Error = CatalogError;

    fn existing_databases(&self, config: &BackupConfig) -> Result<ExistingDatabases, Self::Error> {
        // dropping the client on an early return closes the connection as well
        let mut client = Self::connect(config)?;

        let rows = client.query(LIST_DATABASES, &[]).map_err(CatalogError::Query)?;
        let databases = rows
            .iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<Result<ExistingDatabases, _>>()
            .map_err(CatalogError::Query)?;

        if let Err(e) = client.close() {
            log::warn!(target: "backup::catalog", "Closing the catalog connection failed: {e}");
        }

        log::debug!(target: "backup::catalog", "Server knows {} database(s)", databases.len());
        Ok(databases)
    }
}
