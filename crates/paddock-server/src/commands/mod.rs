//! Command-line definitions and dispatch.

pub mod config;
pub mod serve;

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use paddock_common::config::{IsolationMode, PaddockConfig};

/// Paddock container server.
#[derive(Parser, Debug)]
#[command(name = "paddockd", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file. Every field is optional.
    #[arg(long, global = true, env = "PADDOCK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding container data and the state file.
    #[arg(long, global = true, env = "PADDOCK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// How containers are isolated from the host.
    #[arg(long, global = true, env = "PADDOCK_ISOLATION", value_enum)]
    pub isolation: Option<Isolation>,

    /// Log output format.
    #[arg(long, global = true, env = "PADDOCK_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the server until interrupted.
    Serve(serve::ServeArgs),
    /// Print the effective configuration as JSON.
    Config,
}

/// Isolation mode flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Isolation {
    /// Namespaces, cgroups and project quotas.
    Linux,
    /// Plain host processes, for unprivileged development.
    Host,
}

impl From<Isolation> for IsolationMode {
    fn from(isolation: Isolation) -> Self {
        match isolation {
            Isolation::Linux => Self::Linux,
            Isolation::Host => Self::Host,
        }
    }
}

/// Log output format flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

impl Cli {
    /// Configuration file overlaid with flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or the result is invalid.
    pub fn load_config(&self) -> anyhow::Result<PaddockConfig> {
        let mut config = match &self.config {
            Some(path) => PaddockConfig::load(path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?,
            None => PaddockConfig {
                data_dir: paddock_common::constants::resolve_data_dir(),
                ..PaddockConfig::default()
            },
        };
        if let Some(data_dir) = &self.data_dir {
            config.data_dir.clone_from(data_dir);
        }
        if let Some(isolation) = self.isolation {
            config.isolation = isolation.into();
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Dispatches the parsed command to its handler.
///
/// # Errors
///
/// Returns an error if the command fails.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = cli.load_config()?;
    match cli.command {
        Command::Serve(args) => serve::execute(config, args).await,
        Command::Config => config::execute(&config),
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;

    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from(["paddockd", "--data-dir", "/srv/paddock", "--isolation", "host", "config"]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/paddock"));
        assert_eq!(config.isolation, IsolationMode::Host);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paddock.json");
        std::fs::write(&path, r#"{"isolation":"linux","max_containers":4}"#).unwrap();

        let cli = Cli::parse_from([
            OsStr::new("paddockd"),
            OsStr::new("--config"),
            path.as_os_str(),
            OsStr::new("--isolation"),
            OsStr::new("host"),
            OsStr::new("serve"),
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.max_containers, 4);
        assert_eq!(config.isolation, IsolationMode::Host);
    }

    #[test]
    fn broken_config_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paddock.json");
        std::fs::write(&path, "{").unwrap();
        let cli = Cli::parse_from([OsStr::new("paddockd"), OsStr::new("--config"), path.as_os_str(), OsStr::new("config")]);
        let err = cli.load_config().unwrap_err();
        assert!(err.to_string().contains("failed to load configuration"));
    }
}
