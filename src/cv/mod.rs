// Repeated cross-validation of the bottleneck model against the linear
// baselines.
//
// Each repetition draws its own random train/test split from a seed derived
// from the base seed and the repetition index, fits both model families on
// the training rows and scores every target on the test rows. A failure in
// one fold becomes `Failed` records; it never aborts the run.

pub mod records;
pub mod split;

use std::path::Path;
use std::sync::Mutex;

use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bottleneck::{BottleneckFitter, TrainingRows};
use crate::cache;
use crate::config::ExperimentConfig;
use crate::data::Dataset;
use crate::error::Result;
use crate::linear::{LinearFitter, LinearOutcome};
use crate::metrics::{observed_count, Metric};

pub use records::{EvaluationRecord, Hyperparameters, ModelKind, RecordStatus, ResultsTable, SummaryRow};
pub use split::{fold_seed, random_split, FoldSplit, KFold};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CvConfig {
    /// Number of random train/test splits.
    pub repetitions: usize,
    pub test_fraction: f32,
    pub seed: u64,
    pub metric: Metric,
    /// Targets with fewer observed training rows are skipped.
    pub min_observations: usize,
    /// Run folds on the rayon thread pool.
    pub parallel: bool,
}

impl Default for CvConfig {
    fn default() -> Self {
        CvConfig {
            repetitions: 5,
            test_fraction: 0.2,
            seed: 42,
            metric: Metric::R2,
            min_observations: 10,
            parallel: false,
        }
    }
}

pub struct CrossValidation<'a> {
    dataset: &'a Dataset,
    config: &'a ExperimentConfig,
}

impl<'a> CrossValidation<'a> {
    pub fn new(dataset: &'a Dataset, config: &'a ExperimentConfig) -> Self {
        CrossValidation { dataset, config }
    }

    /// One split per repetition; depends only on the dataset size and config.
    pub fn splits(&self) -> Vec<FoldSplit> {
        let cv = &self.config.cv;
        (0..cv.repetitions)
            .map(|r| random_split(self.dataset.n_samples(), cv.test_fraction, r, fold_seed(cv.seed, r)))
            .collect()
    }

    /// Configuration fingerprint plus the dataset shape.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}x{}x{}:{}",
            self.dataset.n_samples(),
            self.dataset.n_features(),
            self.dataset.n_targets(),
            self.config.fingerprint()
        )
    }

    /// Records a completed fold holds: both model kinds times every target.
    pub fn records_per_fold(&self) -> usize {
        2 * self.dataset.n_targets()
    }

    pub fn run(&self) -> Result<ResultsTable> {
        self.run_folds(ResultsTable::new(self.fingerprint()), None)
    }

    /// Resume from `cache_path` when it holds records of the same
    /// configuration; the cache is rewritten after every completed fold.
    pub fn run_cached(&self, cache_path: &Path) -> Result<ResultsTable> {
        let table = cache::load_matching(cache_path, &self.fingerprint());
        self.run_folds(table, Some(cache_path))
    }

    fn run_folds(&self, mut table: ResultsTable, checkpoint: Option<&Path>) -> Result<ResultsTable> {
        let repetitions = self.config.cv.repetitions;
        table.records.retain(|r| r.fold < repetitions);
        let expected = self.records_per_fold();
        let pending: Vec<FoldSplit> = self
            .splits()
            .into_iter()
            .filter(|s| table.fold_len(s.fold) != expected)
            .collect();
        info!(
            pending = pending.len(),
            cached = self.config.cv.repetitions - pending.len(),
            parallel = self.config.cv.parallel,
            "running cross-validation"
        );

        let table = Mutex::new(table);
        // checkpointing stops after the first failed write
        let checkpoint = Mutex::new(checkpoint);
        let finish = |split: &FoldSplit| {
            let records = self.evaluate_fold(split);
            let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
            table.replace_fold(split.fold, records);
            let mut checkpoint = checkpoint.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(path) = *checkpoint {
                if let Err(e) = cache::save(path, &table) {
                    warn!(path = %path.display(), error = %e, "cache write failed, continuing without it");
                    *checkpoint = None;
                }
            }
        };
        if self.config.cv.parallel {
            pending.par_iter().for_each(finish);
        } else {
            pending.iter().for_each(finish);
        }

        let mut table = table.into_inner().unwrap_or_else(|e| e.into_inner());
        table.sort();
        Ok(table)
    }

    /// Fit both model families on the training rows of `split` and score
    /// them on its test rows. Always returns `records_per_fold()` records.
    pub fn evaluate_fold(&self, split: &FoldSplit) -> Vec<EvaluationRecord> {
        let ds = self.dataset;
        let x_train = ds.features_of(&split.train);
        let y_train = ds.targets_of(&split.train);
        let obs_train = ds.observed_of(&split.train);
        let labels_train = ds.labels_of(&split.train);
        let x_test = ds.features_of(&split.test);
        let y_test = ds.targets_of(&split.test);
        let obs_test = ds.observed_of(&split.test);

        let fold = FoldData {
            fold: split.fold,
            y_train: &y_train,
            obs_train: &obs_train,
            y_test: &y_test,
            obs_test: &obs_test,
        };

        let rows = TrainingRows {
            features: &x_train,
            targets: &y_train,
            observed: &obs_train,
            labels: &labels_train,
        };
        let mut records = self.evaluate_bottleneck(&fold, &rows, &x_test, split.seed);
        records.extend(self.evaluate_linear(&fold, &x_train, &x_test, split.seed));
        info!(fold = split.fold, ok = records.iter().filter(|r| r.status.is_ok()).count(), "fold finished");
        records
    }

    fn evaluate_bottleneck(
        &self,
        fold: &FoldData<'_>,
        rows: &TrainingRows<'_>,
        x_test: &Array2<f32>,
        seed: u64,
    ) -> Vec<EvaluationRecord> {
        let metric = self.config.cv.metric;
        let names = self.dataset.target_names();
        let model = match BottleneckFitter::new(&self.config.bottleneck).fit_grid(rows, seed) {
            Ok(model) => model,
            Err(e) => {
                warn!(fold = fold.fold, error = %e, "bottleneck fit failed");
                return (0..names.len())
                    .map(|t| EvaluationRecord::failed(ModelKind::Bottleneck, fold.fold, t, &names[t], metric, e.to_string()))
                    .collect();
            }
        };

        let pred = model.predict(x_test);
        let params = model.params();
        let hyperparameters = Hyperparameters::Bottleneck {
            width: params.width,
            l1: params.l1,
            l2: params.l2,
            epochs_run: model.report().epochs_run,
            converged: model.report().converged,
        };
        (0..names.len())
            .map(|t| {
                let n_train = observed_count(fold.obs_train.column(t));
                if n_train < self.config.cv.min_observations {
                    return EvaluationRecord::skipped(ModelKind::Bottleneck, fold.fold, t, &names[t], metric, n_train);
                }
                fold.score(ModelKind::Bottleneck, t, &names[t], metric, pred.column(t), hyperparameters.clone())
            })
            .collect()
    }

    fn evaluate_linear(&self, fold: &FoldData<'_>, x_train: &Array2<f32>, x_test: &Array2<f32>, seed: u64) -> Vec<EvaluationRecord> {
        let metric = self.config.cv.metric;
        let names = self.dataset.target_names();
        let fitter = LinearFitter::new(&self.config.linear, self.config.cv.min_observations);
        (0..names.len())
            .map(|t| {
                let outcome = fitter.fit_target(x_train, fold.y_train.column(t), fold.obs_train.column(t), seed);
                match outcome {
                    Ok(LinearOutcome::Fitted(fit)) => {
                        let pred = fit.predict(x_test);
                        let hyperparameters = Hyperparameters::Linear {
                            alpha: fit.alpha(),
                            l1_ratio: fit.l1_ratio(),
                        };
                        fold.score(ModelKind::Linear, t, &names[t], metric, pred.view(), hyperparameters)
                    }
                    Ok(LinearOutcome::InsufficientData { observed }) => {
                        EvaluationRecord::skipped(ModelKind::Linear, fold.fold, t, &names[t], metric, observed)
                    }
                    Err(e) => {
                        warn!(fold = fold.fold, target = %names[t], error = %e, "linear fit failed");
                        EvaluationRecord::failed(ModelKind::Linear, fold.fold, t, &names[t], metric, e.to_string())
                    }
                }
            })
            .collect()
    }
}

/// Target matrices of one fold.
struct FoldData<'a> {
    fold: usize,
    y_train: &'a Array2<f32>,
    obs_train: &'a Array2<bool>,
    y_test: &'a Array2<f32>,
    obs_test: &'a Array2<bool>,
}

impl FoldData<'_> {
    fn score(
        &self,
        model: ModelKind,
        target: usize,
        name: &str,
        metric: Metric,
        pred: ArrayView1<f32>,
        hyperparameters: Hyperparameters,
    ) -> EvaluationRecord {
        let observed = self.obs_test.column(target);
        match metric.score(self.y_test.column(target), pred, observed) {
            None => EvaluationRecord::skipped(model, self.fold, target, name, metric, 0),
            Some(v) if !v.is_finite() => {
                EvaluationRecord::failed(model, self.fold, target, name, metric, format!("non-finite {}", metric.name()))
            }
            Some(v) => EvaluationRecord {
                model,
                fold: self.fold,
                target,
                target_name: name.to_string(),
                metric,
                value: Some(v),
                status: RecordStatus::Ok,
                hyperparameters,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticSpec;

    fn quick_config() -> ExperimentConfig {
        let mut config = ExperimentConfig::default();
        config.cv.repetitions = 2;
        config.bottleneck.encoder = vec![8];
        config.bottleneck.decoder = vec![8];
        config.bottleneck.train.epochs = 5;
        config.linear.alphas = vec![0.1];
        config.linear.l1_ratios = vec![0.5];
        config
    }

    fn dataset() -> Dataset {
        Dataset::synthetic(&SyntheticSpec {
            n_samples: 40,
            n_features: 6,
            n_targets: 2,
            missing: vec![(1, 35)],
            seed: 1,
            ..SyntheticSpec::default()
        })
    }

    #[test]
    fn splits_are_reproducible_and_distinct() {
        let ds = dataset();
        let config = quick_config();
        let cv = CrossValidation::new(&ds, &config);
        let a = cv.splits();
        assert_eq!(a, cv.splits());
        assert_eq!(a.len(), 2);
        assert_ne!(a[0].test, a[1].test);
    }

    #[test]
    fn sparse_target_is_skipped_not_failed() {
        let ds = dataset();
        let config = quick_config();
        let cv = CrossValidation::new(&ds, &config);
        let records = cv.evaluate_fold(&cv.splits()[0]);
        assert_eq!(records.len(), cv.records_per_fold());
        for r in records.iter().filter(|r| r.target == 1) {
            assert!(matches!(r.status, RecordStatus::InsufficientData { .. }), "{r:?}");
        }
        for r in records.iter().filter(|r| r.target == 0) {
            assert!(r.status.is_ok(), "{r:?}");
            assert!(r.value.unwrap().is_finite());
        }
    }

    #[test]
    fn bottleneck_failure_becomes_failed_records() {
        let ds = dataset();
        let mut config = quick_config();
        config.bottleneck.l1_grid = vec![-1.0];
        let cv = CrossValidation::new(&ds, &config);
        let records = cv.evaluate_fold(&cv.splits()[0]);
        let failed = records
            .iter()
            .filter(|r| r.model == ModelKind::Bottleneck && matches!(r.status, RecordStatus::Failed { .. }))
            .count();
        assert_eq!(failed, 2);
        assert!(records.iter().any(|r| r.model == ModelKind::Linear && r.status.is_ok()));
    }

    #[test]
    fn parallel_run_matches_sequential() {
        let ds = dataset();
        let config = quick_config();
        let sequential = CrossValidation::new(&ds, &config).run().unwrap();
        let mut parallel_config = config.clone();
        parallel_config.cv.parallel = true;
        let parallel = CrossValidation::new(&ds, &parallel_config).run().unwrap();
        assert_eq!(sequential.records, parallel.records);
        assert_eq!(sequential.fingerprint, parallel.fingerprint);
    }
}
