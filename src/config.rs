//! Reading and validating the backup configuration.
//!
//! The configuration is a TOML file with a single `[backup]` table:
//!
//! ```toml
//! [backup]
//! host = "localhost"
//! port = 5432
//! db = "app,analytics"
//! user = "backup"
//! password = "secret"
//! # optional
//! probe_db = "postgres"
//! backup_root = "/var/backups/postgres"
//! pg_dump = "/usr/lib/postgresql/16/bin/pg_dump"
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

const DEFAULT_BACKUP_ROOT: &str = "./";
const DEFAULT_PG_DUMP: &str = "pg_dump";

/// Password of the database user.
///
/// Never printed, neither by [Debug] nor by [Display].
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    /// The clear text password.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

impl fmt::Display for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Errors on resolving the [BackupConfig].
#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    /// The configuration file can't be read.
    #[display("Reading the config file {} failed: {source}", path.display())]
    Read {
        #[error(not(source))]
        path: PathBuf,
        source: io::Error,
    },
    /// The configuration isn't valid TOML or has fields of the wrong type.
    #[display("Parsing the config failed: {_0}")]
    #[from]
    Parse(toml::de::Error),
    /// A required key of the `[backup]` table is absent.
    #[display("Required config key '{_0}' is missing")]
    Missing(#[error(not(source))] &'static str),
    /// A key is present but its value is unusable.
    #[display("Config key '{field}' is malformed: {reason}")]
    Malformed {
        #[error(not(source))]
        field: &'static str,
        #[error(not(source))]
        reason: String,
    },
}

#[derive(Debug, serde::Deserialize)]
struct ConfigFile {
    backup: Option<RawBackup>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(i64),
    Text(String),
}

#[derive(Debug, serde::Deserialize)]
struct RawBackup {
    host: Option<String>,
    port: Option<RawPort>,
    db: Option<String>,
    user: Option<String>,
    password: Option<String>,
    probe_db: Option<String>,
    backup_root: Option<PathBuf>,
    pg_dump: Option<PathBuf>,
}

/// Resolved configuration of a backup run.
///
/// Immutable once resolved. There is always at least one target database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    host: String,
    port: u16,
    probe_database: String,
    user: String,
    password: Password,
    target_databases: Vec<String>,
    backup_root: PathBuf,
    pg_dump: PathBuf,
}

impl BackupConfig {
    /// Reads and resolves the configuration file at `path`.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&config_str)
    }

    /// Resolves the configuration from TOML source text.
    pub fn from_toml_str(config_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(config_str)?;
        let raw = file.backup.ok_or(ConfigError::Missing("backup"))?;

        let host = required("host", raw.host)?;
        let port = parse_port(raw.port.ok_or(ConfigError::Missing("port"))?)?;
        let user = required("user", raw.user)?;
        let password = raw.password.ok_or(ConfigError::Missing("password"))?;
        let target_databases = split_database_list(&required("db", raw.db)?)?;

        let probe_database = match raw.probe_db {
            Some(probe) if probe.trim().is_empty() => {
                return Err(ConfigError::Malformed {
                    field: "probe_db",
                    reason: "must not be empty".into(),
                })
            }
            Some(probe) => probe.trim().to_string(),
            // first target doubles as the catalog probe
            None => target_databases[0].clone(),
        };

        Ok(Self {
            host,
            port,
            probe_database,
            user,
            password: Password(password),
            target_databases,
            backup_root: raw
                .backup_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_ROOT)),
            pg_dump: raw.pg_dump.unwrap_or_else(|| PathBuf::from(DEFAULT_PG_DUMP)),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Database used solely to open the connection listing the catalog.
    pub fn probe_database(&self) -> &str {
        &self.probe_database
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &Password {
        &self.password
    }

    /// Databases to back up, in configured order and including duplicates.
    pub fn target_databases(&self) -> &[String] {
        &self.target_databases
    }

    /// Directory the archives are written to.
    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// The `pg_dump` executable.
    pub fn pg_dump(&self) -> &Path {
        &self.pg_dump
    }
}

fn required(field: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    let value = value.ok_or(ConfigError::Missing(field))?;
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::Malformed {
            field,
            reason: "must not be empty".into(),
        });
    }
    Ok(value.to_string())
}

fn parse_port(raw: RawPort) -> Result<u16, ConfigError> {
    let malformed = |reason: String| ConfigError::Malformed {
        field: "port",
        reason,
    };

    let port = match raw {
        RawPort::Number(n) => {
            u16::try_from(n).map_err(|_| malformed(format!("{n} is out of range")))?
        }
        RawPort::Text(s) => s
            .trim()
            .parse::<u16>()
            .map_err(|e| malformed(format!("'{s}': {e}")))?,
    };

    if port == 0 {
        return Err(malformed("0 is not a valid port".into()));
    }
    Ok(port)
}

/// Splits the comma separated `db` value, keeping order and duplicates.
fn split_database_list(list: &str) -> Result<Vec<String>, ConfigError> {
    list.split(',')
        .map(|name| {
            let name = name.trim();
            if name.is_empty() {
                Err(ConfigError::Malformed {
                    field: "db",
                    reason: format!("empty database name in '{list}'"),
                })
            } else {
                Ok(name.to_string())
            }
        })
        .collect()
}
