use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ConfigOverrides;

/// Resumable NZB downloader for Usenet
#[derive(Parser, Debug)]
#[command(name = "nzb-fetch")]
#[command(version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    Download NZB files:
        nzb-fetch first.nzb second.nzb

    Download to specific directory:
        nzb-fetch -o /downloads file.nzb

    List contents without downloading:
        nzb-fetch -l file.nzb

    Show configuration:
        nzb-fetch config

    Test connection:
        nzb-fetch test

Interrupted downloads resume where they stopped when run again.
For advanced options, edit ~/.config/nzb-fetch/config.toml")]
pub struct Cli {
    /// NZB files to download
    #[arg(value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Download root; each NZB gets its own folder below it
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// List contents without downloading
    #[arg(short, long)]
    pub list: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Verbose output (-vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print the final progress snapshot as JSON
    #[arg(long)]
    pub json: bool,

    /// Config file path
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of connections
    #[arg(short = 'c', long = "connections")]
    pub connections: Option<u16>,

    /// Skip PAR2 repair and archive extraction
    #[arg(long)]
    pub no_post_processing: bool,

    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    #[arg(long = "log-file", value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Test connection to Usenet server
    Test,

    /// Show configuration
    Config,
}

impl Cli {
    /// Parse arguments and handle special cases
    pub fn parse_and_validate() -> Self {
        let mut cli = Self::parse();
        if cli.quiet {
            cli.verbose = 0;
        }
        cli
    }

    /// Get the effective log level
    pub fn get_log_level(&self) -> &str {
        if let Some(ref level) = self.log_level {
            level
        } else {
            match self.verbose {
                0 if self.quiet => "error",
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }

    /// Get configuration overrides from CLI arguments
    pub fn get_config_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            connections: self.connections,
            download_dir: self.output.clone(),
            no_post_processing: self.no_post_processing,
            log_level: self.log_level.clone(),
            ..Default::default()
        }
    }
}

/// CLI-specific error messages
pub mod messages {
    pub const NO_FILES: &str =
        "No NZB files specified. Use 'nzb-fetch --help' for usage information.";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_arguments() {
        let cli = Cli::try_parse_from([
            "nzb-fetch", "-o", "/dl", "-c", "8", "--json", "a.nzb", "b.nzb",
        ])
        .unwrap();
        assert_eq!(cli.files, vec![PathBuf::from("a.nzb"), PathBuf::from("b.nzb")]);
        assert!(cli.json);
        assert!(cli.command.is_none());

        let overrides = cli.get_config_overrides();
        assert_eq!(overrides.download_dir, Some(PathBuf::from("/dl")));
        assert_eq!(overrides.connections, Some(8));
        assert!(!overrides.no_post_processing);
    }

    #[test]
    fn test_subcommands() {
        let cli = Cli::try_parse_from(["nzb-fetch", "test"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Test));
        let cli = Cli::try_parse_from(["nzb-fetch", "config"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Config));
    }

    #[test]
    fn test_log_level() {
        let cli = Cli::try_parse_from(["nzb-fetch", "-vv"]).unwrap();
        assert_eq!(cli.get_log_level(), "trace");
        let cli = Cli::try_parse_from(["nzb-fetch", "-q"]).unwrap();
        assert_eq!(cli.get_log_level(), "error");
        let cli = Cli::try_parse_from(["nzb-fetch", "--log-level", "warn", "-v"]).unwrap();
        assert_eq!(cli.get_log_level(), "warn");
    }
}
