use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{self, Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use derive_more::{Display, Error};
use flate2::write::GzEncoder;
use flate2::Compression;

use super::Dump;
use crate::config::BackupConfig;

/// Environment variable `pg_dump` reads the password from.
const PASSWORD_ENV: &str = "PGPASSWORD";

/// Errors on dumping a single database.
#[derive(Debug, Display, Error)]
pub enum DumpError {
    /// `pg_dump` couldn't be started.
    #[display("Running pg_dump failed: {_0}")]
    Spawn(io::Error),
    /// Writing the compressed archive failed.
    #[display("Writing {} failed: {source}", destination.display())]
    Output {
        #[error(not(source))]
        destination: PathBuf,
        source: io::Error,
    },
    /// `pg_dump` exited unsuccessfully.
    #[display("pg_dump {} while writing {}", describe_exit(*code), destination.display())]
    Exit {
        #[error(not(source))]
        code: Option<i32>,
        #[error(not(source))]
        destination: PathBuf,
        /// What `pg_dump` printed to stderr.
        #[error(not(source))]
        stderr: String,
    },
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

impl DumpError {
    /// Exit code of `pg_dump`, if it ran and exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit { code, .. } => *code,
            _ => None,
        }
    }
}

/// [Dump] running [`pg_dump`] and compressing its output with gzip.
///
/// [`pg_dump`]: https://www.postgresql.org/docs/current/app-pgdump.html
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDump;

impl PgDump {
    /// The `pg_dump` invocation for `database`.
    ///
    /// The password is passed in the environment of the child only.
    fn command(config: &BackupConfig, database: &str) -> Command {
        let mut pg_dump = Command::new(config.pg_dump());
        pg_dump
            .arg(format!("--host={}", config.host()))
            .arg(format!("--port={}", config.port()))
            .arg(format!("--dbname={database}"))
            .arg(format!("--username={}", config.user()))
            .arg("--no-password") // never prompt
            .arg("--format=c")
            .env(PASSWORD_ENV, config.password().expose())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        pg_dump
    }

    /// Archives are written directly into the backup root.
    ///
    /// Database names may contain path separators, which would place the
    /// archive elsewhere.
    fn check_destination(config: &BackupConfig, database: &str, destination: &Path) -> io::Result<()> {
        let root = config.backup_root();
        if database.chars().any(path::is_separator) || destination.parent() != Some(root) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("database '{database}' doesn't map to an archive in {}", root.display()),
            ));
        }
        Ok(())
    }

    fn compress(stdout: ChildStdout, destination: &Path) -> io::Result<()> {
        let archive = File::create(destination)?;
        let mut encoder = GzEncoder::new(archive, Compression::default());
        let mut reader = BufReader::new(stdout);

        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?.sync_all()
    }
}

impl Dump for PgDump {
    fn dump(
        &self,
        config: &BackupConfig,
        database: &str,
        destination: &Path,
    ) -> Result<(), DumpError> {
        let output_err = |source: io::Error| DumpError::Output {
            destination: destination.to_path_buf(),
            source,
        };

        Self::check_destination(config, database, destination).map_err(output_err)?;
        fs::create_dir_all(config.backup_root()).map_err(output_err)?;
        if destination.exists() {
            log::warn!(target: "backup::dump", "Overwriting existing archive {}", destination.display());
        }

        log::trace!(
            target: "backup::dump",
            "Running: {} --host={} --port={} --dbname={database} --username={} --no-password --format=c",
            config.pg_dump().display(),
            config.host(),
            config.port(),
            config.user(),
        );
        let mut process = DumpProcess::spawn(Self::command(config, database))?;

        let stdout = process.stdout();
        let stderr = process.collect_stderr();

        if let Some(stdout) = stdout {
            Self::compress(stdout, destination).map_err(output_err)?;
        }

        let status = process.wait().map_err(output_err)?;
        let stderr = stderr.map(join_stderr).unwrap_or_default();
        if !stderr.is_empty() {
            log::warn!(target: "backup::dump", "pg_dump {database}: {stderr}");
        }

        if !status.success() {
            return Err(DumpError::Exit {
                code: status.code(),
                destination: destination.to_path_buf(),
                stderr,
            });
        }

        log::trace!(target: "backup::dump", "pg_dump of {database} exited successfully");
        Ok(())
    }
}

/// Running `pg_dump` child.
///
/// A process not waited for is killed and reaped on drop.
struct DumpProcess {
    child: Child,
    reaped: bool,
}

impl DumpProcess {
    fn spawn(mut command: Command) -> Result<Self, DumpError> {
        let child = command.spawn().map_err(DumpError::Spawn)?;
        Ok(Self {
            child,
            reaped: false,
        })
    }

    fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Drains stderr on a separate thread so a chatty child can't block on it.
    fn collect_stderr(&mut self) -> Option<JoinHandle<String>> {
        let mut stderr = self.child.stderr.take()?;
        Some(thread::spawn(move || {
            let mut buf = Vec::new();
            // a read error only loses diagnostics
            let _ = stderr.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).trim_end().to_string()
        }))
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for DumpProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        if let Err(e) = self.child.kill() {
            log::debug!(target: "backup::dump", "Killing pg_dump failed: {e}");
        }
        let _ = self.child.wait();
    }
}

fn join_stderr(handle: JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
