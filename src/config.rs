use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Hard ceilings and defaults applied to every execution request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum source length in characters
    pub max_code_chars: usize,

    /// Maximum wall-clock budget a request may ask for
    pub max_timeout_ms: u64,

    /// Maximum memory a request may ask for
    pub max_memory_mb: u64,

    /// Budget used when the request does not name one
    pub default_timeout_ms: u64,

    /// Memory limit used when the request does not name one
    pub default_memory_mb: u64,

    /// Requests below this are raised to it
    pub min_memory_mb: u64,

    /// Captured output beyond this many bytes is truncated
    pub max_output_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_code_chars: 10_000,
            max_timeout_ms: 30_000,
            max_memory_mb: 512,
            default_timeout_ms: 10_000,
            default_memory_mb: 128,
            min_memory_mb: 16,
            max_output_bytes: 1024 * 1024, // 1 MiB
        }
    }
}

/// Container hardening and scheduling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// CFS period in microseconds
    pub cpu_period_us: i64,

    /// CFS quota in microseconds per period
    pub cpu_quota_us: i64,

    /// Maximum number of processes inside the container
    pub pids_limit: i64,

    /// Size of the writable tmpfs mounted at /tmp
    pub tmpfs_size_mb: u64,

    /// Where the request directory is mounted inside the container
    pub mount_point: String,

    /// Unprivileged uid:gid the program runs as
    pub user: String,

    /// Pull images that are not present locally before creating a container
    pub pull_missing_images: bool,

    /// How often memory usage is sampled while the container runs
    pub stats_interval_ms: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            cpu_period_us: 100_000,
            cpu_quota_us: 50_000, // half a core
            pids_limit: 64,
            tmpfs_size_mb: 64,
            mount_point: "/sandbox".to_string(),
            user: "65534:65534".to_string(),
            pull_missing_images: true,
            stats_interval_ms: 100,
        }
    }
}

/// Per-language override applied on top of the built-in environment table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageOverride {
    pub image: Option<String>,
    pub run_command: Option<Vec<String>>,
    pub compile_command: Option<Vec<String>>,
    pub file_extension: Option<String>,
    pub default_timeout_ms: Option<u64>,
    pub default_memory_mb: Option<u64>,
}

/// The global configuration for the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Root under which one directory per in-flight request is created
    pub temp_root: PathBuf,

    pub limits: LimitsConfig,

    pub container: ContainerConfig,

    /// Language-specific overrides keyed by canonical language key
    pub languages: HashMap<String, LanguageOverride>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir().join("polyglot-sandbox"),
            limits: LimitsConfig::default(),
            container: ContainerConfig::default(),
            languages: HashMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from a file
    pub fn load(config_path: &Path) -> Result<Self> {
        // Check if file exists
        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            return Ok(Self::default());
        }

        let config_str = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config: SandboxConfig = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, config_path: &Path) -> Result<()> {
        // Create parent directories if they don't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let config_str = toml::to_string(self)
            .context("Failed to serialize config to TOML")?;

        fs::write(config_path, config_str)
            .with_context(|| format!("Failed to write config to file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the default config path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("polyglot-sandbox").join("config.toml")
        } else {
            PathBuf::from("./config.toml")
        }
    }

    /// Reject configurations whose defaults fall outside their own ceilings
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;

        if limits.default_timeout_ms == 0 || limits.default_timeout_ms > limits.max_timeout_ms {
            return Err(anyhow!(
                "default_timeout_ms ({}) must be between 1 and max_timeout_ms ({})",
                limits.default_timeout_ms,
                limits.max_timeout_ms
            ));
        }

        if limits.min_memory_mb > limits.max_memory_mb {
            return Err(anyhow!(
                "min_memory_mb ({}) exceeds max_memory_mb ({})",
                limits.min_memory_mb,
                limits.max_memory_mb
            ));
        }

        if limits.default_memory_mb < limits.min_memory_mb
            || limits.default_memory_mb > limits.max_memory_mb
        {
            return Err(anyhow!(
                "default_memory_mb ({}) must be between {} and {}",
                limits.default_memory_mb,
                limits.min_memory_mb,
                limits.max_memory_mb
            ));
        }

        for (language, overrides) in &self.languages {
            if let Some(timeout_ms) = overrides.default_timeout_ms {
                if timeout_ms == 0 || timeout_ms > limits.max_timeout_ms {
                    return Err(anyhow!(
                        "languages.{}.default_timeout_ms ({}) must be between 1 and {}",
                        language,
                        timeout_ms,
                        limits.max_timeout_ms
                    ));
                }
            }
            if let Some(memory_mb) = overrides.default_memory_mb {
                if memory_mb > limits.max_memory_mb {
                    return Err(anyhow!(
                        "languages.{}.default_memory_mb ({}) exceeds max_memory_mb ({})",
                        language,
                        memory_mb,
                        limits.max_memory_mb
                    ));
                }
            }
        }

        if self.container.cpu_period_us <= 0 || self.container.cpu_quota_us <= 0 {
            return Err(anyhow!("cpu_period_us and cpu_quota_us must be positive"));
        }

        if !self.container.mount_point.starts_with('/') {
            return Err(anyhow!(
                "mount_point must be an absolute path, got {:?}",
                self.container.mount_point
            ));
        }

        Ok(())
    }
}
