//! Configuration management for vfs-sentinel.
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::{
    constants::{DEFAULT_CONFIG_FILE, DEFAULT_LISTEN_BACKLOG},
    error::ConfigError,
    listener::AcceptFailurePolicy,
    supervisor::SupervisorOptions,
};

/// Largest socket path that fits in `sockaddr_un.sun_path` with its NUL.
const MAX_SOCKET_PATH: usize = 107;

/// Settings read from the YAML config file. Every key is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SentinelConfig {
    /// Pidfile the launcher writes the worker pid to.
    pub pidfile: Option<PathBuf>,
    /// Handshake socket path. No socket is bound when unset.
    pub socket_path: Option<PathBuf>,
    pub listen_backlog: u32,
    /// Remove a leftover socket at `socket_path` before binding.
    pub remove_stale_socket: bool,
    /// Adopt the first handshake peer as the worker.
    pub peer_discovery: bool,
    pub accept_failure: AcceptFailurePolicy,
    /// Default log filter; `--log-level` and `RUST_LOG` take precedence.
    pub log_level: Option<String>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            pidfile: None,
            socket_path: None,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            remove_stale_socket: true,
            peer_discovery: false,
            accept_failure: AcceptFailurePolicy::default(),
            log_level: None,
        }
    }
}

impl SentinelConfig {
    /// Rejects values that would only fail later, mid-setup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_backlog == 0 {
            return Err(ConfigError::Invalid(
                "listen_backlog must be at least 1".into(),
            ));
        }
        if let Some(pidfile) = &self.pidfile
            && pidfile.file_name().is_none()
        {
            return Err(ConfigError::Invalid(format!(
                "pidfile {pidfile:?} does not name a file"
            )));
        }
        if let Some(socket) = &self.socket_path
            && socket.as_os_str().len() > MAX_SOCKET_PATH
        {
            return Err(ConfigError::Invalid(format!(
                "socket_path {socket:?} is longer than {MAX_SOCKET_PATH} bytes"
            )));
        }
        Ok(())
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            peer_discovery: self.peer_discovery,
            accept_failure: self.accept_failure,
        }
    }
}

/// Replaces `${VAR}` and `$VAR` references with values from the environment.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| ConfigError::Invalid(err.to_string()))?;

    if let Some(missing) = re
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .find(|name| env::var(name).is_err())
    {
        return Err(ConfigError::MissingEnvVar(missing));
    }

    let result = re.replace_all(input, |caps: &Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });
    Ok(result.into_owned())
}

/// Loads the configuration.
///
/// An explicit `config_path` must exist. Without one, `vfs-sentinel.yaml` in
/// the working directory is used when present, and defaults otherwise.
pub fn load_config(config_path: Option<&Path>) -> Result<SentinelConfig, ConfigError> {
    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !fallback.exists() {
                return Ok(SentinelConfig::default());
            }
            fallback
        }
    };

    let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    let expanded = expand_env_vars(&content)?;
    if expanded.trim().is_empty() {
        return Ok(SentinelConfig::default());
    }

    let config: SentinelConfig = serde_yaml::from_str(&expanded)?;
    config.validate()?;
    Ok(config)
}
