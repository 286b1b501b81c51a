// Experiment configuration, read from TOML.
//
// Every section and field has a default, so an empty file is a valid
// configuration. See `config/experiment.toml` for a commented example.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bottleneck::BottleneckConfig;
use crate::cv::CvConfig;
use crate::error::ConfigError;
use crate::linear::LinearConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub cv: CvConfig,
    pub bottleneck: BottleneckConfig,
    pub linear: LinearConfig,
}

impl ExperimentConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ExperimentConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        let cv = &self.cv;
        if cv.repetitions == 0 {
            return invalid("cv.repetitions", "must be >= 1");
        }
        if !(cv.test_fraction > 0.0 && cv.test_fraction < 1.0) {
            return invalid("cv.test_fraction", "must be in (0, 1)");
        }

        let b = &self.bottleneck;
        if b.widths.is_empty() || b.widths.contains(&0) {
            return invalid("bottleneck.widths", "needs at least one width, all >= 1");
        }
        if b.encoder.contains(&0) || b.decoder.contains(&0) {
            return invalid("bottleneck.encoder/decoder", "hidden widths must be >= 1");
        }
        if b.l1_grid.is_empty() || b.l2_grid.is_empty() {
            return invalid("bottleneck.l1_grid/l2_grid", "must not be empty");
        }
        if b.l1_grid.iter().chain(&b.l2_grid).any(|v| !(*v >= 0.0 && v.is_finite())) {
            return invalid("bottleneck.l1_grid/l2_grid", "penalties must be finite and >= 0");
        }
        let t = &b.train;
        if t.epochs == 0 || t.batch_size == 0 {
            return invalid("bottleneck.train", "epochs and batch_size must be >= 1");
        }
        if !(t.learning_rate > 0.0 && t.learning_rate.is_finite()) {
            return invalid("bottleneck.train.learning_rate", "must be finite and > 0");
        }
        if !(0.0..1.0).contains(&t.validation_fraction) {
            return invalid("bottleneck.train.validation_fraction", "must be in [0, 1)");
        }
        if b.schedule.prune_top_n == Some(0) {
            return invalid("bottleneck.schedule.prune_top_n", "must keep at least one gene");
        }

        let l = &self.linear;
        if l.alphas.is_empty() || l.alphas.iter().any(|a| !(*a >= 0.0 && a.is_finite())) {
            return invalid("linear.alphas", "needs at least one finite alpha >= 0");
        }
        if l.l1_ratios.is_empty() || l.l1_ratios.iter().any(|r| !(0.0..=1.0).contains(r)) {
            return invalid("linear.l1_ratios", "needs at least one ratio in [0, 1]");
        }
        if l.inner_folds < 2 {
            return invalid("linear.inner_folds", "must be >= 2");
        }
        Ok(())
    }

    /// Identity of everything that influences the records of a fold.
    /// Parallelism and progress output are left out, and so is the number of
    /// repetitions: fold `r` is the same in a run of any length.
    pub fn fingerprint(&self) -> String {
        let mut canonical = self.clone();
        canonical.cv.repetitions = 0;
        canonical.cv.parallel = false;
        canonical.bottleneck.train.verbose = false;
        serde_json::to_string(&canonical).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metric;

    #[test]
    fn empty_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        fs::write(&path, "").unwrap();
        assert_eq!(ExperimentConfig::load(&path).unwrap(), ExperimentConfig::default());
    }

    #[test]
    fn partial_sections_override_defaults() {
        let text = r#"
            [cv]
            repetitions = 3
            metric = "rmse"

            [bottleneck]
            widths = [1, 2, 3]

            [bottleneck.train]
            epochs = 50

            [linear]
            l1_ratios = [0.0]
        "#;
        let config: ExperimentConfig = toml::from_str(text).unwrap();
        assert_eq!(config.cv.repetitions, 3);
        assert_eq!(config.cv.metric, Metric::Rmse);
        assert_eq!(config.bottleneck.widths, vec![1, 2, 3]);
        assert_eq!(config.bottleneck.train.epochs, 50);
        assert_eq!(config.bottleneck.train.batch_size, 64);
        assert_eq!(config.linear.l1_ratios, vec![0.0]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = ExperimentConfig::default();
        config.cv.test_fraction = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "cv.test_fraction", .. })
        ));

        let mut config = ExperimentConfig::default();
        config.linear.inner_folds = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unparsable_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[cv\nrepetitions = ").unwrap();
        assert!(matches!(ExperimentConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn fingerprint_ignores_execution_settings() {
        let a = ExperimentConfig::default();
        let mut b = a.clone();
        b.cv.parallel = true;
        b.bottleneck.train.verbose = true;
        b.cv.repetitions = 50;
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.cv.seed += 1;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
