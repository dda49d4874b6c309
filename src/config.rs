use crate::child::EnvPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name, used for defaults and the config directory.
pub const APP_NAME: &str = "termhost";

/// Top-level configuration loaded from termhost.toml.
///
/// Beyond the child settings the core reads, the resolved config is passed
/// through to the window untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    pub window: WindowConfig,
    pub child: ChildConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChildConfig {
    /// Shell to run when no `--exec` is given. Defaults to the login shell.
    pub shell: Option<PathBuf>,
    /// How often the watchdog polls for child exit.
    pub poll_interval_ms: u64,
    pub env: EnvConfig,
}

/// Environment handed to the child.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Names (or `PREFIX*` patterns) tied to the host's desktop session.
    pub remove: Vec<String>,
    pub set: BTreeMap<String, String>,
}

// --- Default implementations ---

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: APP_NAME.to_string(),
        }
    }
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            shell: None,
            poll_interval_ms: 250,
            env: EnvConfig::default(),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            remove: vec![
                "DESKTOP_STARTUP_ID".to_string(),
                "XDG_ACTIVATION_TOKEN".to_string(),
                "WINDOWID".to_string(),
                "GIO_LAUNCHED_DESKTOP_FILE".to_string(),
                "GIO_LAUNCHED_DESKTOP_FILE_PID".to_string(),
            ],
            set: BTreeMap::from([
                ("TERM".to_string(), "xterm-256color".to_string()),
                ("COLORTERM".to_string(), "truecolor".to_string()),
            ]),
        }
    }
}

impl ChildConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl EnvConfig {
    pub fn policy(&self) -> EnvPolicy {
        EnvPolicy {
            remove: self.remove.clone(),
            set: self.set.clone(),
        }
    }
}

/// Errors that can occur while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// `$XDG_CONFIG_HOME/termhost/termhost.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(APP_NAME).join(format!("{APP_NAME}.toml"))
}

/// Load and validate the config at `path`. A missing file means defaults.
pub fn load(path: &Path) -> Result<HostConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(HostConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let config = parse(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

fn parse(contents: &str) -> Result<HostConfig, toml::de::Error> {
    toml::from_str(contents)
}

fn check_var_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(ConfigError::Invalid(format!(
            "invalid environment variable name {name:?}"
        )));
    }
    Ok(())
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.title.trim().is_empty() {
            return Err(ConfigError::Invalid("window.title must not be empty".into()));
        }
        if self.child.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "child.poll_interval_ms must be greater than zero".into(),
            ));
        }
        for name in &self.child.env.remove {
            check_var_name(name.strip_suffix('*').unwrap_or(name))?;
        }
        for (name, value) in &self.child.env.set {
            check_var_name(name)?;
            if value.contains('\0') {
                return Err(ConfigError::Invalid(format!(
                    "value of {name} contains a NUL byte"
                )));
            }
        }
        Ok(())
    }
}
