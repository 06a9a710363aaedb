//! YAML configuration loading.
//!
//! Loads [`RankerConfig`] from a YAML file on disk, falling back to defaults
//! when no file is specified. Missing keys take their default values.

use pairrank_core::RankerConfig;
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "PAIRRANK_CONFIG";

/// Load and validate a [`RankerConfig`] from a YAML file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML is invalid, or the
/// resulting configuration fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<RankerConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    let config: RankerConfig = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {}", e))?;
    config.validate()?;
    Ok(config)
}

/// Where a run's configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// `--config` on the command line.
    Cli(PathBuf),
    /// The `PAIRRANK_CONFIG` environment variable.
    Env(PathBuf),
    Defaults,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::Cli(path) | ConfigSource::Env(path) => Some(path),
            ConfigSource::Defaults => None,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Cli(path) => write!(f, "{} (--config)", path.display()),
            ConfigSource::Env(path) => write!(f, "{} ({CONFIG_ENV})", path.display()),
            ConfigSource::Defaults => f.write_str("defaults"),
        }
    }
}

/// Resolve the configuration for a run.
///
/// Checks (in order):
/// 1. `cli_path`
/// 2. `PAIRRANK_CONFIG` environment variable
/// 3. Default configuration
///
/// Nothing is logged here, since this runs before the subscriber exists.
/// Callers report the returned [`ConfigSource`] once logging is up.
pub fn resolve_config(cli_path: Option<PathBuf>) -> anyhow::Result<(RankerConfig, ConfigSource)> {
    let source = match cli_path {
        Some(path) => ConfigSource::Cli(path),
        None => match std::env::var_os(CONFIG_ENV) {
            Some(path) => ConfigSource::Env(PathBuf::from(path)),
            None => ConfigSource::Defaults,
        },
    };
    let config = match source.path() {
        Some(path) => load_config(path)?,
        None => RankerConfig::default(),
    };
    Ok((config, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairrank_core::{Nonlinearity, OptimizerKind};
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper to write YAML to a temp file and return the path.
    fn write_yaml(yaml: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_config_full() {
        let yaml = r#"
train_batch_size: 8
test_batch_size: 64
extractor_learning_rate: 0.0
ranker_learning_rate: 0.001
weight_decay: 0.0005
optimizer: adamw
ranker_nonlinearity: tanh
random_seed: 7
model_root: "/tmp/pairrank-models"
debug: true
logging:
  level: debug
  format: json
  file: "/tmp/pairrank.log"
"#;
        let f = write_yaml(yaml);
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.train_batch_size, 8);
        assert_eq!(config.test_batch_size, 64);
        assert_eq!(config.extractor_learning_rate, 0.0);
        assert!((config.ranker_learning_rate - 1e-3).abs() < 1e-12);
        assert_eq!(config.optimizer, OptimizerKind::AdamW);
        assert_eq!(config.ranker_nonlinearity, Nonlinearity::Tanh);
        assert_eq!(config.random_seed, 7);
        assert!(config.debug);
        assert_eq!(config.logging.format, "json");
        assert_eq!(
            config.logging.file.as_deref(),
            Some(Path::new("/tmp/pairrank.log"))
        );
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let f = write_yaml("ranker_learning_rate: 0.01\n");
        let config = load_config(f.path()).unwrap();
        assert!((config.ranker_learning_rate - 0.01).abs() < 1e-12);
        assert_eq!(config.train_batch_size, 16);
        assert_eq!(config.optimizer, OptimizerKind::RmsProp);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("/nonexistent/config.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let f = write_yaml("train_batch_size: [not, a, number]\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_load_config_rejects_negative_rate() {
        let f = write_yaml("extractor_learning_rate: -0.1\n");
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("extractor_learning_rate"));
    }

    #[test]
    fn test_unknown_optimizer_rejected() {
        let f = write_yaml("optimizer: lbfgs\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_resolve_prefers_cli_path() {
        let f = write_yaml("random_seed: 99\n");
        let (config, source) = resolve_config(Some(f.path().to_path_buf())).unwrap();
        assert_eq!(config.random_seed, 99);
        assert_eq!(source, ConfigSource::Cli(f.path().to_path_buf()));
        assert_eq!(source.path(), Some(f.path()));
    }

    #[test]
    fn test_resolve_cli_path_error_is_not_swallowed() {
        let missing = PathBuf::from("/nonexistent/pairrank.yaml");
        assert!(resolve_config(Some(missing)).is_err());
    }

    #[test]
    fn test_config_source_display() {
        let cli = ConfigSource::Cli(PathBuf::from("run.yaml"));
        assert_eq!(cli.to_string(), "run.yaml (--config)");
        let env = ConfigSource::Env(PathBuf::from("env.yaml"));
        assert_eq!(env.to_string(), "env.yaml (PAIRRANK_CONFIG)");
        assert_eq!(ConfigSource::Defaults.to_string(), "defaults");
        assert_eq!(ConfigSource::Defaults.path(), None);
    }
}
