use crate::actuator::{AccentOutput, FadeConfig, MappingPreset, RuleTable};
use crate::capture::WindowGeometry;
use crate::classifier::SampleEncoding;
use clap::ValueEnum;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the classifier model
pub const MODEL_PATH_VAR: &str = "EDGE_MODEL_PATH";
/// Environment variable naming the label file
pub const LABELS_PATH_VAR: &str = "EDGE_LABELS_PATH";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing {flag} (or environment variable {env_var})")]
    MissingSetting { flag: String, env_var: String },
    #[error("Invalid capture geometry: {0}")]
    InvalidGeometry(String),
    #[error("Invalid threshold {0} (must be 0.0-1.0)")]
    InvalidThreshold(f32),
    #[error("Invalid fade step {0}% (must be 1-100)")]
    InvalidFadeStep(u8),
    #[error("{name} period must be greater than zero")]
    ZeroPeriod { name: String },
    #[error("Rule #{rule} refers to class {class_index} but the classifier has {label_count} labels")]
    RuleIndexOutOfRange {
        rule: usize,
        class_index: usize,
        label_count: usize,
    },
    #[error("Failed to read rule file {path}: {source}")]
    RuleFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid rule file: {0}")]
    RuleFormat(#[from] serde_json::Error),
}

/// When a new capture cycle starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CapturePolicy {
    /// On every capture tick; ticks arriving mid-cycle are dropped
    #[default]
    Timer,
    /// Right after the previous cycle finishes
    Continuous,
}

/// Runtime configuration of the capture/classify/actuate loop
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub sample_rate: u32,
    pub window: WindowGeometry,
    pub capture_policy: CapturePolicy,
    pub capture_period: Duration,
    pub blink_period: Duration,
    pub fade: FadeConfig,
    pub accent_output: AccentOutput,
    pub input_encoding: SampleEncoding,
    /// Results slower than this are discarded
    pub classify_budget: Option<Duration>,
    pub rules: RuleTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            window: WindowGeometry::default(),
            capture_policy: CapturePolicy::default(),
            capture_period: Duration::from_secs(3),
            blink_period: Duration::from_millis(500),
            fade: FadeConfig::default(),
            accent_output: AccentOutput::default(),
            input_encoding: SampleEncoding::default(),
            classify_budget: Some(Duration::from_secs(2)),
            rules: RuleTable::preset(MappingPreset::default()),
        }
    }
}

impl Config {
    /// Check everything that can be checked without the classifier.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let geometry = self.window;
        if geometry.total_samples == 0 || geometry.segment_samples == 0 {
            return Err(ConfigError::InvalidGeometry(format!(
                "window ({}) and segment ({}) sizes must be non-zero",
                geometry.total_samples, geometry.segment_samples
            )));
        }
        if geometry.segment_samples > geometry.total_samples {
            return Err(ConfigError::InvalidGeometry(format!(
                "segment ({}) is larger than the window ({})",
                geometry.segment_samples, geometry.total_samples
            )));
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidGeometry("sample rate must be non-zero".into()));
        }

        if !(0.0..=1.0).contains(&self.rules.threshold) {
            return Err(ConfigError::InvalidThreshold(self.rules.threshold));
        }
        if self.fade.step_percent == 0 || self.fade.step_percent > 100 {
            return Err(ConfigError::InvalidFadeStep(self.fade.step_percent));
        }

        for (name, period) in [
            ("Capture", self.capture_period),
            ("Blink", self.blink_period),
            ("Fade step", self.fade.step_interval),
        ] {
            if period.is_zero() {
                return Err(ConfigError::ZeroPeriod { name: name.into() });
            }
        }
        Ok(())
    }

    /// Check that every rule refers to a class the classifier produces.
    pub fn validate_rules(&self, label_count: usize) -> Result<(), ConfigError> {
        for (rule, entry) in self.rules.rules.iter().enumerate() {
            if entry.class_index >= label_count {
                return Err(ConfigError::RuleIndexOutOfRange {
                    rule,
                    class_index: entry.class_index,
                    label_count,
                });
            }
        }
        Ok(())
    }
}

/// Load a rule table from a JSON file.
pub fn load_rule_table(path: &Path) -> Result<RuleTable, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::RuleFile {
        path: path.to_path_buf(),
        source,
    })?;
    let table: RuleTable = serde_json::from_str(&text)?;
    log::info!(
        "Loaded {} rules from {} (threshold {})",
        table.rules.len(),
        path.display(),
        table.threshold
    );
    Ok(table)
}

/// Use `arg` if given, otherwise the environment variable `env_var`.
pub fn resolve_path(
    arg: Option<PathBuf>,
    flag: &str,
    env_var: &str,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = arg {
        return Ok(path);
    }
    match env::var(env_var) {
        Ok(value) if !value.trim().is_empty() => Ok(PathBuf::from(value.trim())),
        _ => Err(ConfigError::MissingSetting {
            flag: flag.to_string(),
            env_var: env_var.to_string(),
        }),
    }
}

/// Model and label paths from the command line or the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub model: PathBuf,
    pub labels: PathBuf,
}

/// Resolve model paths with helpful error messages for development
pub fn load_model_paths(
    model: Option<PathBuf>,
    labels: Option<PathBuf>,
) -> Result<ModelPaths, ConfigError> {
    let resolved = resolve_path(model, "--model", MODEL_PATH_VAR).and_then(|model| {
        Ok(ModelPaths {
            model,
            labels: resolve_path(labels, "--labels", LABELS_PATH_VAR)?,
        })
    });

    match resolved {
        Ok(paths) => {
            log::info!(
                "Using model {} with labels {}",
                paths.model.display(),
                paths.labels.display()
            );
            Ok(paths)
        }
        Err(ConfigError::MissingSetting { flag, env_var }) => {
            log::error!("No {} given and {} is not set", flag, env_var);
            log::error!("Pass {} or add to the .env file in the project root:", flag);
            log::error!("{}=/path/to/file", env_var);
            Err(ConfigError::MissingSetting { flag, env_var })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::Rule;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window.segment_count(), 16);
        assert_eq!(config.fade.steps_per_ramp(), 101);
    }

    #[test]
    fn test_geometry_validation() {
        let mut config = Config::default();
        config.window = WindowGeometry::new(1000, 0);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidGeometry(_))));

        config.window = WindowGeometry::new(1000, 2000);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidGeometry(_))));

        // A truncated final segment is fine.
        config.window = WindowGeometry::new(16_000, 1_024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_and_fade_validation() {
        let mut config = Config::default();
        config.rules.threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidThreshold(_))));

        let mut config = Config::default();
        config.fade.step_percent = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidFadeStep(0))));

        let mut config = Config::default();
        config.blink_period = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroPeriod { .. })));
    }

    #[test]
    fn test_rules_checked_against_labels() {
        let config = Config::default();
        // The default table refers to class 6.
        assert!(config.validate_rules(7).is_ok());
        match config.validate_rules(4) {
            Err(ConfigError::RuleIndexOutOfRange {
                class_index,
                label_count,
                ..
            }) => {
                assert_eq!(class_index, 5);
                assert_eq!(label_count, 4);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_load_rule_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "threshold": 0.7, "rules": [ {{ "class_index": 1, "green": "on" }} ] }}"#
        )
        .unwrap();

        let table = load_rule_table(file.path()).unwrap();
        assert_eq!(table.threshold, 0.7);
        assert_eq!(
            table.rules,
            vec![Rule {
                class_index: 1,
                label: None,
                red: None,
                green: Some(crate::actuator::ChannelCommand::On),
                blue: None,
                accent: None,
            }]
        );
    }

    #[test]
    fn test_rule_file_errors() {
        let missing = load_rule_table(Path::new("no/such/rules.json"));
        assert!(matches!(missing, Err(ConfigError::RuleFile { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            load_rule_table(file.path()),
            Err(ConfigError::RuleFormat(_))
        ));
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = resolve_path(
            Some(PathBuf::from("model.tflite")),
            "--model",
            "EDGE_TEST_UNSET_VARIABLE",
        )
        .unwrap();
        assert_eq!(path, PathBuf::from("model.tflite"));

        assert!(matches!(
            resolve_path(None, "--model", "EDGE_TEST_UNSET_VARIABLE"),
            Err(ConfigError::MissingSetting { .. })
        ));
    }
}
