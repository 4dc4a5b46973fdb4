use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};

/// Name of the configuration file looked up in the working directory
pub const LOCAL_CONFIG: &str = "nzb-fetch.toml";

/// Prefix of the environment variables overriding the file
const ENV_PREFIX: &str = "NZB_FETCH_";

/// Expand tilde (~) in paths to the actual home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(path_str) = path.to_str() {
        if let Some(stripped) = path_str.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if path_str == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub usenet: UsenetConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub post_processing: PostProcessingConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsenetConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub ssl: bool,
    pub verify_ssl_certs: bool,
    pub connections: u16,
    pub timeout: u64, // seconds, per socket operation
}

// Custom Debug implementation to hide sensitive data
impl std::fmt::Debug for UsenetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsenetConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .field("ssl", &self.ssl)
            .field("verify_ssl_certs", &self.verify_ssl_certs)
            .field("connections", &self.connections)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessingConfig {
    /// Verify with PAR2, repair when needed, then extract archives
    pub repair_and_extract: bool,
    pub remove_par2_and_archives: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Let NZBs below `small_nzb_threshold` bypass the queue
    pub prioritize_small: bool,
    /// Queue an NZB found alone inside a finished download
    pub recurse_nzb: bool,
    pub small_nzb_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for UsenetConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 563,
            username: String::new(),
            password: String::new(),
            ssl: true,
            verify_ssl_certs: true,
            connections: 3,
            timeout: 10,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("downloads"),
        }
    }
}

impl Default for PostProcessingConfig {
    fn default() -> Self {
        Self {
            repair_and_extract: true,
            remove_par2_and_archives: true,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prioritize_small: true,
            recurse_nzb: true,
            small_nzb_threshold: 5_000_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Settings frozen into every group when it is added
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub download_root: PathBuf,
    pub repair_and_extract: bool,
    pub remove_after: bool,
    pub prioritize_small: bool,
    pub recurse: bool,
    pub small_threshold: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for GroupConfig {
    fn from(config: &Config) -> Self {
        Self {
            download_root: config.download.dir.clone(),
            repair_and_extract: config.post_processing.repair_and_extract,
            remove_after: config.post_processing.remove_par2_and_archives,
            prioritize_small: config.queue.prioritize_small,
            recurse: config.queue.recurse_nzb,
            small_threshold: config.queue.small_nzb_threshold,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = env_var(name)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring {}{}={:?}: not a valid value", ENV_PREFIX, name, value);
            None
        }
    }
}

/// Apply NZB_FETCH_ prefixed environment variables
fn load_env_overrides(mut config: Config) -> Config {
    if let Some(val) = env_var("USENET_SERVER") {
        config.usenet.server = val;
    }
    if let Some(port) = env_parse("USENET_PORT") {
        config.usenet.port = port;
    }
    if let Some(val) = env_var("USENET_USERNAME") {
        config.usenet.username = val;
    }
    if let Some(val) = env_var("USENET_PASSWORD") {
        config.usenet.password = val;
    }
    if let Some(ssl) = env_parse("USENET_SSL") {
        config.usenet.ssl = ssl;
    }
    if let Some(connections) = env_parse("USENET_CONNECTIONS") {
        config.usenet.connections = connections;
    }
    if let Some(timeout) = env_parse("USENET_TIMEOUT") {
        config.usenet.timeout = timeout;
    }
    if let Some(val) = env_var("DOWNLOAD_DIR") {
        config.download.dir = PathBuf::from(val);
    }
    if let Some(repair) = env_parse("REPAIR_AND_EXTRACT") {
        config.post_processing.repair_and_extract = repair;
    }
    if let Some(level) = env_var("LOG_LEVEL") {
        config.logging.level = level;
    }

    config
}

impl Config {
    /// Get the standard config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| ConfigError::Invalid {
            field: "config_dir".to_string(),
            reason: "Could not determine config directory".to_string(),
        })?;
        Ok(config_dir.join("nzb-fetch").join("config.toml"))
    }

    /// Load configuration from the working directory or the standard location
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from(LOCAL_CONFIG);

        let config_path = if local_config.exists() {
            local_config
        } else {
            let standard_config = Self::config_path()?;
            if !standard_config.exists() {
                tracing::debug!(
                    "Config file not found, creating default at: {}",
                    standard_config.display()
                );
                if let Some(parent) = standard_config.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Self::create_sample(&standard_config)?;

                eprintln!(
                    "Created default configuration at: {}",
                    standard_config.display()
                );
                eprintln!("Please edit this file with your Usenet server details.");
            }
            standard_config
        };

        tracing::debug!("Loading configuration from: {}", config_path.display());
        Self::load_from(&config_path)
    }

    /// Load a specific file, then apply environment overrides and validate
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;
        config.finish()
    }

    fn finish(self) -> Result<Self> {
        let mut config = load_env_overrides(self);

        config.download.dir = expand_tilde(&config.download.dir);
        if let Some(log_file) = config.logging.file.as_ref() {
            config.logging.file = Some(expand_tilde(log_file));
        }

        config.validate()?;
        Ok(config)
    }

    /// Create a sample configuration file
    pub fn create_sample<P: AsRef<Path>>(path: P) -> Result<()> {
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {}", e)))?;

        let commented_content = format!(
            r#"# nzb-fetch configuration
#
# Every setting can be overridden with an NZB_FETCH_ environment variable,
# for example: NZB_FETCH_USENET_SERVER=news.example.com
#
# REQUIRED: set your Usenet server below

{}

# [usenet]
# server       - Usenet provider address (REQUIRED)
# port         - Usually 563 for TLS, 119 for plain text
# username     - Leave empty if the server needs no authentication
# ssl          - Use an encrypted connection
# connections  - Simultaneous connections (check your provider's limit)
# timeout      - Seconds allowed for each socket operation
#
# [post_processing]
# repair_and_extract       - Verify with PAR2, repair if needed, extract archives
# remove_par2_and_archives - Delete PAR2 files and archives once they are used
#
# [queue]
# prioritize_small    - Start small NZBs right away instead of queueing them
# small_nzb_threshold - Size in bytes below which an NZB counts as small
# recurse_nzb         - Download an NZB found alone inside a finished download
"#,
            content
        );

        std::fs::write(path, commented_content)?;
        Ok(())
    }

    /// Validate basic configuration (always run)
    pub fn validate(&self) -> Result<()> {
        if self.usenet.connections == 0 || self.usenet.connections > 100 {
            return Err(ConfigError::InvalidConnections {
                count: self.usenet.connections,
            }
            .into());
        }

        if self.download.dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidPath {
                path: self.download.dir.clone(),
                reason: "Download directory not specified".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Validate configuration for download operations
    pub fn validate_for_download(&self) -> Result<()> {
        if self.usenet.server.is_empty() {
            return Err(ConfigError::NoServer.into());
        }
        Ok(())
    }

    /// Ensure required directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.download.dir)?;

        if let Some(log_file) = &self.logging.file {
            if let Some(parent) = log_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(())
    }

    /// Apply command-line overrides
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(server) = overrides.server {
            self.usenet.server = server;
        }
        if let Some(port) = overrides.port {
            self.usenet.port = port;
        }
        if let Some(connections) = overrides.connections {
            self.usenet.connections = connections;
        }
        if let Some(dir) = overrides.download_dir {
            self.download.dir = dir;
        }
        if overrides.no_post_processing {
            self.post_processing.repair_and_extract = false;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
    }

    pub fn group_config(&self) -> GroupConfig {
        GroupConfig::from(self)
    }
}

/// Command-line configuration overrides
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub connections: Option<u16>,
    pub download_dir: Option<PathBuf>,
    pub no_post_processing: bool,
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.usenet.port, 563);
        assert!(config.usenet.ssl);
        assert_eq!(config.usenet.connections, 3);
        assert_eq!(config.usenet.timeout, 10);
        assert_eq!(config.queue.small_nzb_threshold, 5_000_000);
        assert!(config.validate().is_ok());
        assert!(config.validate_for_download().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[usenet]\nserver = \"news.example.org\"\nconnections = 8\n\n[queue]\nprioritize_small = false\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.usenet.connections, 8);
        assert_eq!(config.usenet.port, 563);
        assert!(!config.queue.prioritize_small);
        assert!(config.queue.recurse_nzb);
        assert!(config.validate_for_download().is_ok());
    }

    #[test]
    fn test_invalid_connections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[usenet]\nconnections = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());

        std::fs::write(&path, "[usenet\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_sample_parses_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        Config::create_sample(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Config = toml::from_str(&content).unwrap();
        assert_eq!(parsed.usenet.port, 563);
        assert!(parsed.post_processing.remove_par2_and_archives);
    }

    #[test]
    fn test_group_config_and_overrides() {
        let mut config = Config::default();
        config.apply_overrides(ConfigOverrides {
            download_dir: Some(PathBuf::from("/tmp/nzb")),
            no_post_processing: true,
            connections: Some(12),
            ..Default::default()
        });

        let group = config.group_config();
        assert_eq!(group.download_root, PathBuf::from("/tmp/nzb"));
        assert!(!group.repair_and_extract);
        assert!(group.remove_after);
        assert!(group.prioritize_small);
        assert_eq!(group.small_threshold, 5_000_000);
        assert_eq!(config.usenet.connections, 12);
    }

    #[test]
    fn test_password_is_redacted() {
        let usenet = UsenetConfig {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        assert!(!format!("{:?}", usenet).contains("hunter2"));
    }

    #[test]
    fn test_expand_tilde() {
        let plain = PathBuf::from("/data/downloads");
        assert_eq!(expand_tilde(&plain), plain);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/dl")), home.join("dl"));
        }
    }
}
