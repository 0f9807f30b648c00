use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(version, about = "PostgreSQL database management", long_about = None)]
pub struct Cli {
    /// Action to perform.
    #[arg(long, value_enum)]
    pub action: Action,

    /// Database configuration file.
    #[arg(long = "configfile", value_name = "PATH")]
    pub config_file: PathBuf,
}

#[derive(Copy, Clone, ValueEnum, Debug, PartialEq, Eq)]
pub enum Action {
    /// Backup every configured database into a compressed archive.
    Backup,
}
