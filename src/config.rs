//! Configuration schema for Mockka.
//!
//! YAML config with the `section:key` families of the service: `data`,
//! `http`, `processing`, `access`, `listing`, `template`, plus `logging` and
//! `metrics`. Env vars (`$VAR`, `${VAR}`, `${VAR:-default}`) are expanded
//! before parsing. Range violations are startup-fatal.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root config (mockka.yaml).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub data: DataConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,

    #[serde(default)]
    pub access: AccessConfig,

    /// Display URLs for the list command.
    #[serde(default)]
    pub listing: Option<ListingConfig>,

    /// Mock skeleton for the external make command; accepted, unused here.
    #[serde(default)]
    pub template: Option<TemplateConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DataConfig {
    /// Root directory of mock files.
    pub rule_dir: PathBuf,

    /// Directory for transaction logs.
    pub log_dir: PathBuf,

    /// "united" (one file per service) or "split" (mirror tree).
    #[serde(default = "default_log_type")]
    pub log_type: String,

    /// Seconds between observer scans, [1, 3600].
    #[serde(default = "default_check_delay")]
    pub check_delay: u64,
}

fn default_log_type() -> String {
    "united".to_string()
}
fn default_check_delay() -> u64 {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct HttpConfig {
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Listener port, [1024, 65535].
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds, [1, 120].
    #[serde(default = "default_timeout")]
    pub read_timeout: u64,

    /// Seconds, [1, 120]. Also bounds the upstream proxy call.
    #[serde(default = "default_timeout")]
    pub write_timeout: u64,

    /// Bytes, [1024, 10485760].
    #[serde(default = "default_max_header_size")]
    pub max_header_size: u64,

    /// Maximum honored response delay, seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            ip: default_ip(),
            port: default_port(),
            read_timeout: default_timeout(),
            write_timeout: default_timeout(),
            max_header_size: default_max_header_size(),
            max_delay: default_max_delay(),
        }
    }
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_timeout() -> u64 {
    15
}
fn default_max_header_size() -> u64 {
    1_048_576
}
fn default_max_delay() -> f64 {
    60.0
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ProcessingConfig {
    /// When true, HEAD requests fall back to rules for GET, POST, PUT, DELETE.
    #[serde(default)]
    pub auto_head: bool,

    /// When false, upstream-sourced responses answer 599 ForbidenAction.
    #[serde(default)]
    pub allow_proxying: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct AccessConfig {
    /// Chown target for created files/dirs.
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub group: Option<String>,

    /// Octal mode strings applied on creation.
    #[serde(default = "default_file_perms")]
    pub mock_perms: String,

    #[serde(default = "default_dir_perms")]
    pub mock_dir_perms: String,

    #[serde(default = "default_file_perms")]
    pub log_perms: String,

    #[serde(default = "default_dir_perms")]
    pub log_dir_perms: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        AccessConfig {
            user: None,
            group: None,
            mock_perms: default_file_perms(),
            mock_dir_perms: default_dir_perms(),
            log_perms: default_file_perms(),
            log_dir_perms: default_dir_perms(),
        }
    }
}

fn default_file_perms() -> String {
    "0644".to_string()
}
fn default_dir_perms() -> String {
    "0775".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ListingConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default = "default_ip")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_scheme() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TemplateConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Log level (e.g. "info", "debug"). Env MOCKKA_LOG_LEVEL overrides.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "json" or "pretty". Env MOCKKA_LOG_FORMAT overrides.
    #[serde(default)]
    pub format: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_ip")]
    pub ip: String,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Config {
    /// Load, env-expand, parse, and validate a config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {:?}: {}", path, e))?;
        let expanded = expand_env_vars(&raw)?;
        let config: Config = serde_yaml_ng::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.data.rule_dir.is_dir() {
            anyhow::bail!(
                "data:rule-dir {:?} is not a readable directory",
                self.data.rule_dir
            );
        }
        if self.data.log_type != "united" && self.data.log_type != "split" {
            anyhow::bail!(
                "data:log-type must be \"united\" or \"split\", got {:?}",
                self.data.log_type
            );
        }
        if !(1..=3600).contains(&self.data.check_delay) {
            anyhow::bail!("data:check-delay must be in [1, 3600]");
        }
        if self.http.port < 1024 {
            anyhow::bail!("http:port must be in [1024, 65535]");
        }
        if !(1..=120).contains(&self.http.read_timeout) {
            anyhow::bail!("http:read-timeout must be in [1, 120]");
        }
        if !(1..=120).contains(&self.http.write_timeout) {
            anyhow::bail!("http:write-timeout must be in [1, 120]");
        }
        if !(1024..=10_485_760).contains(&self.http.max_header_size) {
            anyhow::bail!("http:max-header-size must be in [1024, 10485760]");
        }
        if !self.http.max_delay.is_finite() || self.http.max_delay < 0.0 {
            anyhow::bail!("http:max-delay must be a non-negative number");
        }
        for (key, value) in [
            ("access:mock-perms", &self.access.mock_perms),
            ("access:mock-dir-perms", &self.access.mock_dir_perms),
            ("access:log-perms", &self.access.log_perms),
            ("access:log-dir-perms", &self.access.log_dir_perms),
        ] {
            parse_mode(value).with_context(|| format!("{key} {value:?}"))?;
        }
        Ok(())
    }

    /// Parsed `access:log-perms`.
    pub fn log_perms(&self) -> u32 {
        parse_mode(&self.access.log_perms).unwrap_or(0o644)
    }

    /// Parsed `access:log-dir-perms`.
    pub fn log_dir_perms(&self) -> u32 {
        parse_mode(&self.access.log_dir_perms).unwrap_or(0o775)
    }

    pub fn log_type(&self) -> crate::txlog::LogType {
        if self.data.log_type == "split" {
            crate::txlog::LogType::Split
        } else {
            crate::txlog::LogType::United
        }
    }
}

/// Parse an octal mode string like "0644".
fn parse_mode(s: &str) -> anyhow::Result<u32> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8)
        .map_err(|_| anyhow::anyhow!("not an octal file mode"))
}

/// Expand env vars in config text. Unset vars expand to empty.
fn expand_env_vars(s: &str) -> anyhow::Result<String> {
    fn context(var: &str) -> Result<Option<std::borrow::Cow<'static, str>>, std::env::VarError> {
        match std::env::var(var) {
            Ok(v) => Ok(Some(v.into())),
            Err(std::env::VarError::NotPresent) => Ok(Some("".into())),
            Err(e) => Err(e),
        }
    }
    shellexpand::env_with_context(s, context)
        .map(|cow| cow.into_owned())
        .map_err(|e| anyhow::anyhow!("config env expansion: {} ({})", e.var_name, e.cause))
}
