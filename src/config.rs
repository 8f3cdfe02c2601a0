use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables that override values from the configuration file
pub const ENV_BIND_ADDRESS: &str = "FASTPUSH_BIND_ADDRESS";
pub const ENV_PORT: &str = "FASTPUSH_PORT";
pub const ENV_BASE_PATH: &str = "FASTPUSH_BASE_PATH";
pub const ENV_AUTH_TOKEN: &str = "FASTPUSH_AUTH_TOKEN";
pub const ENV_BACKEND_COMMAND: &str = "FASTPUSH_BACKEND_COMMAND";
pub const ENV_APP_DIRS: &str = "FASTPUSH_APP_DIRS";
pub const ENV_BACKEND_PORT: &str = "FASTPUSH_BACKEND_PORT";
pub const ENV_BACKEND_HOST: &str = "FASTPUSH_BACKEND_HOST";
pub const ENV_RESTART_REGEX: &str = "FASTPUSH_RESTART_REGEX";
pub const ENV_IGNORE_REGEX: &str = "FASTPUSH_IGNORE_REGEX";

/// Global configuration for the controller
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener settings for the controller itself
    #[serde(default)]
    pub server: ServerConfig,

    /// The supervised backend process
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port the controller listens on (default: 9000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Prefix under which the control endpoints are mounted (default: /)
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Shared secret expected in the `x-auth-token` header.
    /// An empty token disables authentication.
    #[serde(default)]
    pub auth_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_listen_port(),
            base_path: default_base_path(),
            auth_token: String::new(),
        }
    }
}

/// Configuration for the supervised backend
///
/// # Security Warning
///
/// `command` is executed directly and uploads are written wherever the client
/// asks. Only expose the controller to trusted clients, with `auth_token` set.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Command line used to launch the backend
    pub command: Option<String>,

    /// Space-separated list of directories scanned for file listings
    #[serde(default = "default_backend_dirs")]
    pub dirs: String,

    /// Port the backend listens on, exported to it as `PORT`
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Host pass-through traffic is forwarded to
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Uploaded paths matching this pattern trigger a restart
    pub restart_regex: Option<String>,

    /// Uploaded paths matching this pattern never trigger a restart
    pub ignore_regex: Option<String>,

    /// Working directory for the backend process
    pub working_dir: Option<String>,

    /// Extra environment variables for the backend process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Seconds between SIGTERM and SIGKILL. Unset waits indefinitely.
    pub shutdown_grace_period_secs: Option<u64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: None,
            dirs: default_backend_dirs(),
            port: default_backend_port(),
            host: default_backend_host(),
            restart_regex: None,
            ignore_regex: None,
            working_dir: None,
            env: HashMap::new(),
            shutdown_grace_period_secs: None,
        }
    }
}

impl BackendConfig {
    /// Directories to scan, split on whitespace
    pub fn app_dirs(&self) -> Vec<PathBuf> {
        self.dirs.split_whitespace().map(PathBuf::from).collect()
    }

    /// The launch command, with blank values treated as unset
    pub fn command(&self) -> Option<&str> {
        non_blank(self.command.as_deref())
    }

    pub fn restart_pattern(&self) -> Option<&str> {
        non_blank(self.restart_regex.as_deref())
    }

    pub fn ignore_pattern(&self) -> Option<&str> {
        non_blank(self.ignore_regex.as_deref())
    }

    pub fn shutdown_grace_period(&self) -> Option<Duration> {
        self.shutdown_grace_period_secs.map(Duration::from_secs)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    9000
}

fn default_base_path() -> String {
    "/".to_string()
}

fn default_backend_dirs() -> String {
    "./".to_string()
}

fn default_backend_port() -> u16 {
    8080
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

impl Config {
    /// Load the configuration file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from defaults and the environment only
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overwrite settings with any values `lookup` returns
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_BIND_ADDRESS) {
            self.server.bind_address = v;
        }
        if let Some(v) = lookup(ENV_PORT) {
            self.server.port = parse_port(ENV_PORT, &v)?;
        }
        if let Some(v) = lookup(ENV_BASE_PATH) {
            self.server.base_path = v;
        }
        if let Some(v) = lookup(ENV_AUTH_TOKEN) {
            self.server.auth_token = v;
        }
        if let Some(v) = lookup(ENV_BACKEND_COMMAND) {
            self.backend.command = Some(v);
        }
        if let Some(v) = lookup(ENV_APP_DIRS) {
            self.backend.dirs = v;
        }
        if let Some(v) = lookup(ENV_BACKEND_PORT) {
            self.backend.port = parse_port(ENV_BACKEND_PORT, &v)?;
        }
        if let Some(v) = lookup(ENV_BACKEND_HOST) {
            self.backend.host = v;
        }
        if let Some(v) = lookup(ENV_RESTART_REGEX) {
            self.backend.restart_regex = Some(v);
        }
        if let Some(v) = lookup(ENV_IGNORE_REGEX) {
            self.backend.ignore_regex = Some(v);
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !self.server.base_path.starts_with('/') {
            errors.push(format!(
                "'base_path' must start with '/', got '{}'",
                self.server.base_path
            ));
        }

        if self.backend.port == 0 {
            errors.push("'backend.port' must be greater than 0".to_string());
        }

        if self.backend.app_dirs().is_empty() {
            errors.push("'backend.dirs' must name at least one directory".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn parse_port(key: &str, value: &str) -> anyhow::Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", value, key, e))
}
