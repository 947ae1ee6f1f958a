//! Run configuration, captured once from the environment and then overridden by CLI flags.

use std::path::PathBuf;

use serde::Serialize;

pub const ENV_SHADER_CACHE: &str = "RETRACE_SHADER_CACHE";
pub const ENV_SHADER_CACHE_DIR: &str = "RETRACE_SHADER_CACHE_DIR";
pub const ENV_SHADER_CACHE_MAX_ENTRIES: &str = "RETRACE_SHADER_CACHE_MAX_ENTRIES";
pub const ENV_SHADER_CACHE_MAX_BYTES: &str = "RETRACE_SHADER_CACHE_MAX_BYTES";
pub const ENV_STRICT_RESULTS: &str = "RETRACE_STRICT_RESULTS";
pub const ENV_COMPILE_WORKERS: &str = "RETRACE_COMPILE_WORKERS";

const DEFAULT_MEMORY_ENTRIES: usize = 256;
const DEFAULT_MAX_ENTRIES: usize = 4096;
const DEFAULT_MAX_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for env var {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// What to do when a live result code differs from the recorded one (outside the cases that
/// are always fatal).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    #[default]
    Warn,
    Fatal,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayOptions {
    pub mismatch_policy: MismatchPolicy,
    /// Threads compiling shaders ahead of dispatch; 0 compiles inline on the queue worker.
    pub compile_workers: usize,
    /// Replay files whose capture was never finalized, up to their last complete chunk.
    pub allow_unfinalized: bool,
}

impl ReplayOptions {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        if let Some(raw) = lookup(ENV_STRICT_RESULTS) {
            if parse_bool(ENV_STRICT_RESULTS, &raw)? {
                options.mismatch_policy = MismatchPolicy::Fatal;
            }
        }
        if let Some(raw) = lookup(ENV_COMPILE_WORKERS) {
            options.compile_workers = parse_number(ENV_COMPILE_WORKERS, &raw)?;
        }
        Ok(options)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderCacheConfig {
    pub enabled: bool,
    /// Directory of the persistent layer. `None` keeps the cache in memory only.
    pub root: Option<PathBuf>,
    /// Capacity of the in-memory LRU layer, in entries. 0 disables the layer.
    pub memory_entries: usize,
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl Default for ShaderCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
            memory_entries: DEFAULT_MEMORY_ENTRIES,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl ShaderCacheConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_SHADER_CACHE) {
            config.enabled = parse_bool(ENV_SHADER_CACHE, &raw)?;
        }
        config.root = match lookup(ENV_SHADER_CACHE_DIR) {
            Some(dir) if !dir.trim().is_empty() => Some(PathBuf::from(dir)),
            _ => default_cache_dir(&lookup),
        };
        if let Some(raw) = lookup(ENV_SHADER_CACHE_MAX_ENTRIES) {
            config.max_entries = parse_number(ENV_SHADER_CACHE_MAX_ENTRIES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SHADER_CACHE_MAX_BYTES) {
            config.max_bytes = parse_number(ENV_SHADER_CACHE_MAX_BYTES, &raw)?;
        }
        Ok(config)
    }
}

fn default_cache_dir(lookup: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    let base = match lookup("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(lookup("HOME").filter(|v| !v.is_empty())?).join(".cache"),
    };
    Some(base.join("retrace").join("shaders"))
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: raw.to_owned(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: raw.to_owned(),
    })
}
