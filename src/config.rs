//! Runtime configuration loading.
//!
//! Configuration resolves in three layers: built-in defaults, an optional
//! TOML file named by `NVRT_CONFIG`, then `NVRT__section__key` environment
//! overrides. The legacy `USE_TABLE_FLUSH` switch selects helper-batched
//! data flushing and is honored last.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading the config file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Mount point of the PM-aware filesystem.
    pub mount: PathBuf,
    /// Per-user namespace directory under the mount.
    pub user: String,
    /// Program name; the log region is `logs_<progname>`.
    pub progname: String,
    /// When true, the helper thread batches data cache-line flushes and
    /// `nvm_barrier` becomes a no-op on the user thread.
    pub helper_batched: bool,
    /// When true (the default), the helper reclaims durable log prefixes
    /// as sections close. When false, the log only shrinks at shutdown —
    /// crash recovery then rolls back through the full retained history.
    pub helper_reclaim: bool,
    /// Size of a per-thread log chunk in bytes.
    pub chunk_bytes: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mount: PathBuf::from("/mnt/pmem0"),
            user: env::var("USER").unwrap_or_else(|_| "nobody".to_string()),
            progname: default_progname(),
            helper_batched: false,
            helper_reclaim: true,
            chunk_bytes: 4096,
        }
    }
}

fn default_progname() -> String {
    env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

impl RuntimeConfig {
    /// Directory holding all PM files for this user: `<mount>/<user>`.
    pub fn user_dir(&self) -> PathBuf {
        self.mount.join(&self.user)
    }

    /// Path of the region metadata file.
    pub fn table_path(&self) -> PathBuf {
        self.user_dir().join("__nvm_region_table")
    }

    /// Directory holding one file per region.
    pub fn regions_dir(&self) -> PathBuf {
        self.user_dir().join("regions")
    }

    /// Path of the file backing the named region.
    pub fn region_path(&self, name: &str) -> PathBuf {
        self.regions_dir().join(name)
    }

    /// Name of the log region for this program.
    pub fn log_region_name(&self) -> String {
        format!("logs_{}", self.progname)
    }

    /// Load configuration from defaults, `NVRT_CONFIG`, and env overrides.
    pub fn load_from_env() -> std::result::Result<Self, ConfigError> {
        let mut config = match env::var("NVRT_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, with defaults for absent keys.
    pub fn load_from_path(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let spec: ConfigSpec = toml::from_str(&contents)?;
        let mut config = Self::default();
        spec.apply_to(&mut config);
        Ok(config)
    }

    /// Apply `NVRT__section__key` and `USE_TABLE_FLUSH` overrides in-place.
    pub fn apply_env_overrides(&mut self) -> std::result::Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("NVRT__") {
                continue;
            }
            let path = key["NVRT__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["pm", "mount"] => self.mount = PathBuf::from(value),
                ["pm", "user"] => self.user = value,
                ["pm", "progname"] => self.progname = value,
                ["log", "helper_batched"] => {
                    self.helper_batched = parse_value(&key, &value)?;
                }
                ["log", "helper_reclaim"] => {
                    self.helper_reclaim = parse_value(&key, &value)?;
                }
                ["log", "chunk_bytes"] => {
                    self.chunk_bytes = parse_value(&key, &value)?;
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        if let Ok(value) = env::var("USE_TABLE_FLUSH") {
            self.helper_batched = value != "0" && !value.is_empty();
        }

        Ok(())
    }
}

/// On-disk configuration schema. Every field is optional; absent fields keep
/// their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigSpec {
    pm: Option<PmSpec>,
    log: Option<LogSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PmSpec {
    mount: Option<PathBuf>,
    user: Option<String>,
    progname: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LogSpec {
    helper_batched: Option<bool>,
    helper_reclaim: Option<bool>,
    chunk_bytes: Option<u64>,
}

impl ConfigSpec {
    fn apply_to(&self, config: &mut RuntimeConfig) {
        if let Some(pm) = &self.pm {
            if let Some(mount) = &pm.mount {
                config.mount = mount.clone();
            }
            if let Some(user) = &pm.user {
                config.user = user.clone();
            }
            if let Some(progname) = &pm.progname {
                config.progname = progname.clone();
            }
        }
        if let Some(log) = &self.log {
            if let Some(batched) = log.helper_batched {
                config.helper_batched = batched;
            }
            if let Some(reclaim) = log.helper_reclaim {
                config.helper_reclaim = reclaim;
            }
            if let Some(chunk) = log.chunk_bytes {
                config.chunk_bytes = chunk;
            }
        }
    }
}

fn parse_value<T: std::str::FromStr>(
    key: &str,
    value: &str,
) -> std::result::Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
