use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name looked up in the source root before the per-user config.
pub const PROJECT_CONFIG_FILE: &str = ".mutiny.toml";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Execution engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per mutant type switches, keyed by kebab-case type name
    #[serde(default)]
    pub mutants: BTreeMap<String, MutantToggle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrent verification runs
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Command whose exit status decides killed vs lived
    #[serde(default = "default_test_command")]
    pub test_command: String,

    /// Optional command run before the tests; failure means not viable
    #[serde(default)]
    pub build_command: Option<String>,

    /// Multiplier applied to the baseline duration
    #[serde(default = "default_timeout_coefficient")]
    pub timeout_coefficient: u32,

    /// Lower bound for the derived per-mutant timeout
    #[serde(default = "default_min_timeout")]
    pub min_timeout_seconds: u64,

    /// Fixed per-mutant timeout, overrides the derived one
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default = "default_baseline_timeout")]
    pub baseline_timeout_seconds: u64,

    /// Glob patterns for top-level entries left out of working copies
    #[serde(default = "default_skip")]
    pub skip: Vec<String>,

    #[serde(default = "default_workdir_prefix")]
    pub workdir_prefix: String,

    /// Captured command output is truncated to this many bytes
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutantToggle {
    pub enabled: bool,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_test_command() -> String {
    "cargo test".to_string()
}

fn default_timeout_coefficient() -> u32 {
    5
}

fn default_min_timeout() -> u64 {
    10
}

fn default_baseline_timeout() -> u64 {
    600 // 10 minutes
}

fn default_skip() -> Vec<String> {
    vec![".git".to_string(), "target".to_string()]
}

fn default_workdir_prefix() -> String {
    "mutiny-".to_string()
}

fn default_max_output_bytes() -> usize {
    10_000
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            test_command: default_test_command(),
            build_command: None,
            timeout_coefficient: default_timeout_coefficient(),
            min_timeout_seconds: default_min_timeout(),
            timeout_seconds: None,
            baseline_timeout_seconds: default_baseline_timeout(),
            skip: default_skip(),
            workdir_prefix: default_workdir_prefix(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Config {
    /// Load configuration from file, or fall back to defaults if not found
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(Self::default_config_path);

        let config = if let Some(ref path) = config_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {:?}", path))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config from {:?}", path))?
            } else {
                Config::default()
            }
        } else {
            Config::default()
        };

        Ok(config)
    }

    /// Resolve the config for a run: explicit path, then the project file
    /// in `source_root`, then the per-user file.
    pub fn resolve(explicit: Option<&Path>, source_root: &Path) -> Result<(Self, Option<PathBuf>)> {
        let path = explicit.map(PathBuf::from).or_else(|| {
            let project = source_root.join(PROJECT_CONFIG_FILE);
            if project.is_file() {
                Some(project)
            } else {
                Self::default_config_path()
            }
        });

        let config = Self::load(path.as_deref())?;
        Ok((config, path.filter(|p| p.exists())))
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = path
            .map(PathBuf::from)
            .or_else(Self::default_config_path)
            .context("No config path available")?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config to {:?}", config_path))?;

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "mutiny", "mutiny")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Flatten `[mutants.*]` into `mutants.<name>.enabled` keys.
    pub fn mutant_overrides(&self) -> BTreeMap<String, bool> {
        self.mutants
            .iter()
            .map(|(name, toggle)| (format!("mutants.{}.enabled", name), toggle.enabled))
            .collect()
    }
}
