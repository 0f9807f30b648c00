use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};

use super::task::destination_path;
use super::{BackupTask, Catalog, Dump, SkipReason, TaskState};
use crate::config::BackupConfig;

type Clock = Box<dyn Fn() -> NaiveDateTime>;

/// Drives a backup run over all configured databases.
///
/// Databases are processed strictly in configured order, one at a time.
/// A missing database or a failed dump is recorded and the run continues
/// with the next database.
pub struct Orchestrator<C, D> {
    catalog: C,
    dumper: D,
    clock: Clock,
    cancelled: Arc<AtomicBool>,
}

impl<C: Catalog, D: Dump> Orchestrator<C, D> {
    pub fn new(catalog: C, dumper: D) -> Self {
        Self {
            catalog,
            dumper,
            clock: Box::new(|| Local::now().naive_local()),
            cancelled: Arc::default(),
        }
    }

    /// Replace the wall clock naming the archives.
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Flag that, once set, cancels all databases not started yet.
    pub fn cancellation(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Backs up every target database of `config`.
    ///
    /// Fails only if the catalog can't be fetched, in which case no dump is
    /// attempted. Per-database failures are part of the returned [BackupReport].
    pub fn run(&self, config: &BackupConfig) -> Result<BackupReport, C::Error> {
        let existing = self.catalog.existing_databases(config)?;

        let mut tasks: Vec<_> = config
            .target_databases()
            .iter()
            .cloned()
            .map(BackupTask::new)
            .collect();

        for task in &mut tasks {
            if self.cancelled.load(Ordering::SeqCst) {
                log::warn!(target: "backup::orchestrator", "Backup of {} cancelled", task.database());
                task.finish(TaskState::Cancelled);
                continue;
            }

            if !existing.contains(task.database()) {
                let reason = SkipReason::DoesNotExist;
                log::error!(target: "backup::orchestrator", "Skipping {}: {reason}", task.database());
                task.finish(TaskState::Skipped(reason));
                continue;
            }

            let destination = destination_path(config.backup_root(), task.database(), (self.clock)());
            log::info!(
                target: "backup::orchestrator",
                "Backing up {} database to {}",
                task.database(),
                destination.display()
            );
            task.start(destination.clone());

            match self.dumper.dump(config, task.database(), &destination) {
                Ok(()) => {
                    log::info!(target: "backup::orchestrator", "Backup of {} complete", task.database());
                    task.finish(TaskState::Success);
                }
                Err(e) => {
                    log::error!(target: "backup::orchestrator", "Backup of {} failed: {e}", task.database());
                    task.finish(TaskState::Failed(e));
                }
            }
        }

        let report = BackupReport { tasks };
        log::info!(
            target: "backup::orchestrator",
            "Backed up {} of {} database(s): {} skipped, {} failed, {} cancelled",
            report.succeeded(),
            report.tasks().len(),
            report.skipped(),
            report.failed(),
            report.cancelled(),
        );
        Ok(report)
    }
}

/// Outcomes of a backup run, in configured order.
#[derive(Debug)]
pub struct BackupReport {
    tasks: Vec<BackupTask>,
}

impl BackupReport {
    pub fn tasks(&self) -> &[BackupTask] {
        &self.tasks
    }

    /// Returns if every database was backed up.
    pub fn all_succeeded(&self) -> bool {
        self.tasks.iter().all(BackupTask::is_success)
    }

    pub fn succeeded(&self) -> usize {
        self.count(|state| matches!(state, TaskState::Success))
    }

    pub fn skipped(&self) -> usize {
        self.count(|state| matches!(state, TaskState::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|state| matches!(state, TaskState::Failed(_)))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|state| matches!(state, TaskState::Cancelled))
    }

    fn count(&self, predicate: impl Fn(&TaskState) -> bool) -> usize {
        self.tasks.iter().filter(|task| predicate(task.state())).count()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::io;
    use std::path::{Path, PathBuf};

    use chrono::{NaiveDate, TimeDelta};

    use super::*;
    use crate::backup::{DumpError, ExistingDatabases};

    fn config(databases: &str) -> BackupConfig {
        BackupConfig::from_toml_str(&format!(
            r#"
            [backup]
            host = "localhost"
            port = 5432
            db = "{databases}"
            user = "backup"
            password = "secret"
            backup_root = "/srv/backups"
            "#
        ))
        .unwrap()
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    struct FakeCatalog {
        databases: Option<Vec<&'static str>>,
        calls: Cell<usize>,
    }

    impl FakeCatalog {
        fn with(databases: &[&'static str]) -> Self {
            Self {
                databases: Some(databases.to_vec()),
                calls: Cell::new(0),
            }
        }

        fn refusing() -> Self {
            Self {
                databases: None,
                calls: Cell::new(0),
            }
        }
    }

    impl Catalog for &FakeCatalog {
        type Error = io::Error;

        fn existing_databases(&self, _config: &BackupConfig) -> Result<ExistingDatabases, Self::Error> {
            self.calls.set(self.calls.get() + 1);
            match &self.databases {
                Some(databases) => Ok(databases.iter().copied().collect()),
                None => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
            }
        }
    }

    /// Succeeds unless an exit code is registered for the database.
    #[derive(Default)]
    struct FakeDump {
        exit_codes: HashMap<&'static str, i32>,
        calls: RefCell<Vec<(String, PathBuf)>>,
    }

    impl FakeDump {
        fn failing(database: &'static str, code: i32) -> Self {
            Self {
                exit_codes: HashMap::from([(database, code)]),
                ..Default::default()
            }
        }

        fn dumped(&self) -> Vec<String> {
            self.calls.borrow().iter().map(|(db, _)| db.clone()).collect()
        }
    }

    impl Dump for &FakeDump {
        fn dump(
            &self,
            _config: &BackupConfig,
            database: &str,
            destination: &Path,
        ) -> Result<(), DumpError> {
            self.calls
                .borrow_mut()
                .push((database.to_string(), destination.to_path_buf()));
            match self.exit_codes.get(database) {
                Some(&code) => Err(DumpError::Exit {
                    code: Some(code),
                    destination: destination.to_path_buf(),
                    stderr: String::new(),
                }),
                None => Ok(()),
            }
        }
    }

    #[test]
    fn mixed_batch_records_every_outcome() {
        let catalog = FakeCatalog::with(&["db1", "db3", "postgres"]);
        let dump = FakeDump::failing("db3", 1);

        let report = Orchestrator::new(&catalog, &dump)
            .with_clock(noon)
            .run(&config("db1,db2,db3"))
            .unwrap();

        let tasks = report.tasks();
        assert_eq!(tasks.len(), 3);

        assert_eq!(tasks[0].database(), "db1");
        assert!(matches!(tasks[0].state(), TaskState::Success));
        assert_eq!(
            tasks[0].destination(),
            Some(Path::new("/srv/backups/backup-20240309-120000-db1.gz"))
        );

        assert_eq!(tasks[1].database(), "db2");
        assert!(matches!(
            tasks[1].state(),
            TaskState::Skipped(SkipReason::DoesNotExist)
        ));
        assert_eq!(tasks[1].destination(), None);

        assert_eq!(tasks[2].database(), "db3");
        assert!(matches!(tasks[2].state(), TaskState::Failed(e) if e.exit_code() == Some(1)));

        assert_eq!(dump.dumped(), ["db1", "db3"]);
        assert!(!report.all_succeeded());
        assert_eq!(
            (report.succeeded(), report.skipped(), report.failed(), report.cancelled()),
            (1, 1, 1, 0)
        );
    }

    #[test]
    fn order_and_duplicates_are_preserved() {
        let catalog = FakeCatalog::with(&["a", "b", "c"]);
        let dump = FakeDump::default();

        let report = Orchestrator::new(&catalog, &dump)
            .with_clock(noon)
            .run(&config("c,a,c,b"))
            .unwrap();

        let databases: Vec<_> = report.tasks().iter().map(BackupTask::database).collect();
        assert_eq!(databases, ["c", "a", "c", "b"]);
        assert_eq!(dump.dumped(), ["c", "a", "c", "b"]);
        assert!(report.all_succeeded());
        assert_eq!(catalog.calls.get(), 1);
    }

    #[test]
    fn missing_databases_are_never_dumped() {
        let catalog = FakeCatalog::with(&[]);
        let dump = FakeDump::default();

        let report = Orchestrator::new(&catalog, &dump)
            .run(&config("db1,db2"))
            .unwrap();

        assert_eq!(report.skipped(), 2);
        assert!(dump.dumped().is_empty());
    }

    #[test]
    fn failed_dump_does_not_abort_the_batch() {
        let catalog = FakeCatalog::with(&["db1", "db2", "db3"]);
        let dump = FakeDump::failing("db1", 2);

        let report = Orchestrator::new(&catalog, &dump)
            .run(&config("db1,db2,db3"))
            .unwrap();

        assert!(matches!(report.tasks()[0].state(), TaskState::Failed(e) if e.exit_code() == Some(2)));
        assert!(report.tasks()[1].is_success());
        assert!(report.tasks()[2].is_success());
        assert_eq!(dump.dumped(), ["db1", "db2", "db3"]);
    }

    #[test]
    fn catalog_failure_aborts_before_any_dump() {
        let catalog = FakeCatalog::refusing();
        let dump = FakeDump::default();

        let err = Orchestrator::new(&catalog, &dump)
            .run(&config("db1,db2,db3"))
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert!(dump.dumped().is_empty());
    }

    #[test]
    fn timestamp_is_taken_per_database() {
        let catalog = FakeCatalog::with(&["db1", "db2"]);
        let dump = FakeDump::default();
        let ticks = Cell::new(0);

        let clock = move || {
            let tick = ticks.get();
            ticks.set(tick + 1);
            noon() + TimeDelta::seconds(tick)
        };
        let report = Orchestrator::new(&catalog, &dump)
            .with_clock(clock)
            .run(&config("db1,db2"))
            .unwrap();

        let destinations: Vec<_> = report
            .tasks()
            .iter()
            .filter_map(BackupTask::destination)
            .collect();
        assert_eq!(
            destinations,
            [
                Path::new("/srv/backups/backup-20240309-120000-db1.gz"),
                Path::new("/srv/backups/backup-20240309-120001-db2.gz"),
            ]
        );
        let dumped_to: Vec<_> = dump.calls.borrow().iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(dumped_to, destinations);
    }

    #[test]
    fn cancellation_skips_remaining_databases() {
        let catalog = FakeCatalog::with(&["db1", "db2"]);
        let dump = FakeDump::default();

        let orchestrator = Orchestrator::new(&catalog, &dump);
        orchestrator.cancellation().store(true, Ordering::SeqCst);
        let report = orchestrator.run(&config("db1,db2")).unwrap();

        assert_eq!(report.cancelled(), 2);
        assert!(report
            .tasks()
            .iter()
            .all(|task| matches!(task.state(), TaskState::Cancelled)));
        assert!(dump.dumped().is_empty());
    }

    #[cfg(unix)]
    fn echo_config(databases: &str, backup_root: &Path) -> BackupConfig {
        BackupConfig::from_toml_str(&format!(
            r#"
            [backup]
            host = "localhost"
            port = 5432
            db = "{databases}"
            user = "backup"
            password = "secret"
            pg_dump = "echo"
            backup_root = "{}"
            "#,
            backup_root.display()
        ))
        .unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn successful_dump_leaves_single_archive() {
        use crate::backup::PgDump;

        let dir = tempfile::tempdir().unwrap();
        let catalog = FakeCatalog::with(&["db1"]);

        let report = Orchestrator::new(&catalog, PgDump)
            .with_clock(noon)
            .run(&echo_config("db1", dir.path()))
            .unwrap();

        assert!(report.all_succeeded());
        let archive = dir.path().join("backup-20240309-120000-db1.gz");
        assert_eq!(report.tasks()[0].destination(), Some(archive.as_path()));

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(files, [archive]);
    }

    #[cfg(unix)]
    #[test]
    fn database_name_escaping_the_backup_root_fails() {
        use crate::backup::PgDump;

        let dir = tempfile::tempdir().unwrap();
        let backup_root = dir.path().join("root");
        let catalog = FakeCatalog::with(&["db1", "../../esc"]);

        let report = Orchestrator::new(&catalog, PgDump)
            .with_clock(noon)
            .run(&echo_config("db1,db2,../../esc", &backup_root))
            .unwrap();

        let tasks = report.tasks();
        assert!(tasks[0].is_success());
        assert!(matches!(tasks[1].state(), TaskState::Skipped(_)));
        assert!(matches!(
            tasks[2].state(),
            TaskState::Failed(DumpError::Output { source, .. })
                if source.kind() == io::ErrorKind::InvalidInput
        ));

        assert!(!backup_root.join("esc.gz").exists());
        assert!(!dir.path().join("esc.gz").exists());
        let files: Vec<_> = std::fs::read_dir(&backup_root)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(files, ["backup-20240309-120000-db1.gz"]);
    }
}
