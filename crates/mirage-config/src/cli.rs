//! Command line surface.

use std::path::PathBuf;

use clap::Parser;

use crate::loader::{load_file, load_stdin, ConfigError, StdinFormat};
use crate::Config;

/// The server reads one config document per run: either from `--config`,
/// or from standard input when no path is given.
#[derive(Debug, Parser)]
#[command(name = "mirage", version, about = "TLS tunnel proxy server")]
pub struct Args {
    /// Config file path (.json/.yaml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Document format when reading from standard input
    #[arg(long, value_enum, default_value = "json")]
    pub stdin_format: StdinFormat,
}

impl Args {
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        match &self.config {
            Some(path) => load_file(path),
            None => load_stdin(self.stdin_format),
        }
    }
}
