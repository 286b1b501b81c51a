// Fitting schedule for the bottleneck regressor: scaling, optional
// pre-training, freeze/unfreeze, pruning, and the hyperparameter sweep.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::activation::Activation;
use super::architecture::{Architecture, ArchitectureBuilder, Head};
use super::network::{Network, Regularization};
use super::trainer::{self, FitReport, TrainConfig, TrainingHistory, Targets, Validation};
use crate::error::{self, FitError};
use crate::preprocessing::StandardScaler;

/// One point of the hyperparameter grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BottleneckParams {
    pub width: usize,
    pub l1: f32,
    pub l2: f32,
}

impl BottleneckParams {
    pub fn regularization(&self) -> Regularization {
        Regularization { l1: self.l1, l2: self.l2 }
    }
}

/// Optional stages run around the main regression phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    /// Pre-train on cell-type labels and transfer the hidden weights.
    pub pretrain: bool,
    /// Per-layer trainable flags for a first phase; all layers are then
    /// unfrozen and trained again at half the learning rate.
    pub freeze: Option<Vec<bool>>,
    /// Keep only this many genes after training and retrain.
    pub prune_top_n: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BottleneckConfig {
    pub encoder: Vec<usize>,
    pub decoder: Vec<usize>,
    pub activation: Activation,
    pub widths: Vec<usize>,
    pub l1_grid: Vec<f32>,
    pub l2_grid: Vec<f32>,
    pub train: TrainConfig,
    pub schedule: Schedule,
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        BottleneckConfig {
            encoder: vec![512, 128],
            decoder: vec![128, 512],
            activation: Activation::Relu,
            widths: vec![2],
            l1_grid: vec![1e-3],
            l2_grid: vec![1e-4],
            train: TrainConfig::default(),
            schedule: Schedule::default(),
        }
    }
}

impl BottleneckConfig {
    /// Width-major cartesian product of the grids.
    pub fn grid(&self) -> Vec<BottleneckParams> {
        let mut grid = Vec::with_capacity(self.widths.len() * self.l1_grid.len() * self.l2_grid.len());
        for &width in &self.widths {
            for &l1 in &self.l1_grid {
                for &l2 in &self.l2_grid {
                    grid.push(BottleneckParams { width, l1, l2 });
                }
            }
        }
        grid
    }

    pub fn architecture(&self, n_inputs: usize, n_outputs: usize, width: usize, head: Head) -> Result<Architecture, FitError> {
        ArchitectureBuilder::new(n_inputs, n_outputs)
            .encoder(&self.encoder)
            .bottleneck(width)
            .decoder(&self.decoder)
            .activation(self.activation)
            .head(head)
            .build()
    }

    fn validate(&self, params: &BottleneckParams) -> Result<(), FitError> {
        let invalid = |name, value: String, constraint| FitError::InvalidHyperparameter { name, value, constraint };
        if !(params.l1 >= 0.0 && params.l1.is_finite()) {
            return Err(invalid("l1", params.l1.to_string(), "must be finite and >= 0"));
        }
        if !(params.l2 >= 0.0 && params.l2.is_finite()) {
            return Err(invalid("l2", params.l2.to_string(), "must be finite and >= 0"));
        }
        let vf = self.train.validation_fraction;
        if !(0.0..1.0).contains(&vf) {
            return Err(invalid("validation_fraction", vf.to_string(), "must be in [0, 1)"));
        }
        if self.train.learning_rate <= 0.0 || !self.train.learning_rate.is_finite() {
            return Err(invalid(
                "learning_rate",
                self.train.learning_rate.to_string(),
                "must be finite and > 0",
            ));
        }
        if self.train.epochs == 0 {
            return Err(invalid("epochs", "0".into(), "must be >= 1"));
        }
        if self.schedule.prune_top_n == Some(0) {
            return Err(invalid("prune_top_n", "0".into(), "must keep at least one gene"));
        }
        Ok(())
    }
}

/// A trained bottleneck regressor. Only prediction and latent extraction are
/// exposed; everything needed to map raw features to original target units
/// travels with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedBottleneck {
    network: Network,
    feature_scaler: StandardScaler,
    target_scaler: StandardScaler,
    selected_genes: Option<Vec<usize>>,
    params: BottleneckParams,
    /// Penalty of the last training phase; pruning drops the group lasso.
    regularization: Regularization,
    report: FitReport,
    history: TrainingHistory,
}

impl FittedBottleneck {
    /// Predictions in original target units, one row per input row.
    pub fn predict(&self, features: &Array2<f32>) -> Array2<f32> {
        let z = self.network.predict(&self.prepare(features));
        self.target_scaler.inverse_transform(&z)
    }

    /// Bottleneck activations, shape (n, width).
    pub fn latent(&self, features: &Array2<f32>) -> Array2<f32> {
        self.network.latent(&self.prepare(features))
    }

    fn prepare(&self, features: &Array2<f32>) -> Array2<f32> {
        match &self.selected_genes {
            Some(genes) => self.feature_scaler.transform(&features.select(Axis(1), genes)),
            None => self.feature_scaler.transform(features),
        }
    }

    pub fn width(&self) -> usize {
        self.params.width
    }

    pub fn params(&self) -> BottleneckParams {
        self.params
    }

    pub fn regularization(&self) -> Regularization {
        self.regularization
    }

    pub fn report(&self) -> &FitReport {
        &self.report
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Gene columns the model reads after pruning; `None` means all of them.
    pub fn selected_genes(&self) -> Option<&[usize]> {
        self.selected_genes.as_deref()
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> error::Result<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> error::Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// Raw (unscaled) training rows of one fold.
pub struct TrainingRows<'a> {
    pub features: &'a Array2<f32>,
    /// `NaN` at missing entries.
    pub targets: &'a Array2<f32>,
    pub observed: &'a Array2<bool>,
    /// Cell-type labels, needed only for pre-training.
    pub labels: &'a [Option<String>],
}

impl TrainingRows<'_> {
    fn len(&self) -> usize {
        self.features.nrows()
    }

    fn check(&self) -> Result<(), FitError> {
        let n = self.len();
        if n == 0 {
            return Err(FitError::EmptyTrainingSet);
        }
        let mismatch = |what: &str, found: usize| FitError::DimensionMismatch {
            expected: format!("{n} rows"),
            actual: format!("{found} {what} rows"),
        };
        if self.targets.nrows() != n {
            return Err(mismatch("target", self.targets.nrows()));
        }
        if self.observed.dim() != self.targets.dim() {
            return Err(mismatch("mask", self.observed.nrows()));
        }
        Ok(())
    }
}

pub struct BottleneckFitter<'a> {
    config: &'a BottleneckConfig,
}

impl<'a> BottleneckFitter<'a> {
    pub fn new(config: &'a BottleneckConfig) -> Self {
        BottleneckFitter { config }
    }

    /// Train every grid candidate on the same fit/validation split and keep
    /// the one with the lowest validation loss. Candidates that fail are
    /// logged and skipped; the error of the last failure is returned when
    /// none succeeds.
    pub fn fit_grid(&self, rows: &TrainingRows<'_>, seed: u64) -> Result<FittedBottleneck, FitError> {
        let mut best: Option<FittedBottleneck> = None;
        let mut last_err = None;
        for params in self.config.grid() {
            match self.fit(rows, params, seed) {
                Ok(model) => {
                    debug!(?params, val_loss = model.report.best_val_loss, "grid candidate trained");
                    let better = best
                        .as_ref()
                        .map_or(true, |b| model.report.best_val_loss < b.report.best_val_loss);
                    if better {
                        best = Some(model);
                    }
                }
                Err(e) => {
                    warn!(?params, error = %e, "grid candidate failed");
                    last_err = Some(e);
                }
            }
        }
        match (best, last_err) {
            (Some(model), _) => Ok(model),
            (None, Some(e)) => Err(e),
            (None, None) => Err(FitError::InvalidHyperparameter {
                name: "grid",
                value: "[]".into(),
                constraint: "needs at least one width, l1 and l2 value",
            }),
        }
    }

    /// Train one hyperparameter set. All randomness (validation split,
    /// initialization, shuffling) comes from `seed`.
    pub fn fit(&self, rows: &TrainingRows<'_>, params: BottleneckParams, seed: u64) -> Result<FittedBottleneck, FitError> {
        rows.check()?;
        self.config.validate(&params)?;
        let train_cfg = &self.config.train;
        let mut rng = StdRng::seed_from_u64(seed);

        let feature_scaler = StandardScaler::fit(rows.features);
        let target_scaler = StandardScaler::fit_masked(rows.targets, rows.observed);
        let x = feature_scaler.transform(rows.features);
        let y = target_scaler.transform(rows.targets);

        let (fit_idx, val_idx) = carve_validation(rows.len(), train_cfg.validation_fraction, &mut rng)?;
        let x_fit = x.select(Axis(0), &fit_idx);
        let x_val = x.select(Axis(0), &val_idx);
        let all_targets = Targets::Regression {
            values: y,
            mask: rows.observed.clone(),
        };
        let y_fit = all_targets.rows(&fit_idx);
        let y_val = all_targets.rows(&val_idx);

        let n_in = rows.features.ncols();
        let arch = self
            .config
            .architecture(n_in, rows.targets.ncols(), params.width, Head::Regression)?;
        let mut net = Network::new(&arch, &mut rng);
        let mut reg = params.regularization();
        let phase = train_cfg.phase();
        let mut history = TrainingHistory::default();

        if self.config.schedule.pretrain {
            let labels: Vec<Option<String>> = fit_idx.iter().map(|&i| rows.labels.get(i).cloned().flatten()).collect();
            let (pre, pre_report) = self.pretrain(&x_fit, &labels, params, &mut rng)?;
            let copied = net.transfer_from(&pre);
            debug!(copied, converged = pre_report.converged, "transferred pre-trained layers");
        }

        let validation = || Validation {
            inputs: &x_val,
            targets: &y_val,
        };
        let mut report = match &self.config.schedule.freeze {
            Some(flags) => {
                net.set_trainable(flags);
                let frozen = trainer::train(&mut net, &x_fit, &y_fit, Some(validation()), phase, train_cfg, reg, &mut rng, &mut history)?;
                net.unfreeze_all();
                let tuned = trainer::train(
                    &mut net,
                    &x_fit,
                    &y_fit,
                    Some(validation()),
                    phase.halved(),
                    train_cfg,
                    reg,
                    &mut rng,
                    &mut history,
                )?;
                frozen.then(tuned)
            }
            None => trainer::train(&mut net, &x_fit, &y_fit, Some(validation()), phase, train_cfg, reg, &mut rng, &mut history)?,
        };

        let mut feature_scaler = feature_scaler;
        let mut selected_genes = None;
        if let Some(top_n) = self.config.schedule.prune_top_n.filter(|&n| n < n_in) {
            let genes = top_genes(&net, top_n);
            info!(kept = genes.len(), of = n_in, "pruning input genes");
            net = net.prune_inputs(&genes);
            reg.l1 = 0.0;
            let x_fit = x_fit.select(Axis(1), &genes);
            let x_val = x_val.select(Axis(1), &genes);
            let retrained = trainer::train(
                &mut net,
                &x_fit,
                &y_fit,
                Some(Validation {
                    inputs: &x_val,
                    targets: &y_val,
                }),
                phase.halved().extended(),
                train_cfg,
                reg,
                &mut rng,
                &mut history,
            )?;
            report = report.then(retrained);
            feature_scaler = feature_scaler.select(&genes);
            selected_genes = Some(genes);
        }

        if !report.converged {
            warn!(?params, best_epoch = report.best_epoch, "bottleneck fit did not converge");
        }
        Ok(FittedBottleneck {
            network: net,
            feature_scaler,
            target_scaler,
            selected_genes,
            params,
            regularization: reg,
            report,
            history,
        })
    }

    /// Same encoder, bottleneck and decoder with a softmax head over
    /// cell-type labels, trained with cross-entropy.
    fn pretrain(
        &self,
        x: &Array2<f32>,
        labels: &[Option<String>],
        params: BottleneckParams,
        rng: &mut StdRng,
    ) -> Result<(Network, FitReport), FitError> {
        let labels: Vec<&str> = labels
            .iter()
            .map(|l| l.as_deref().ok_or(FitError::MissingLabels))
            .collect::<Result<_, _>>()?;
        let mut classes: Vec<&str> = labels.clone();
        classes.sort_unstable();
        classes.dedup();

        let mut one_hot = Array2::zeros((labels.len(), classes.len()));
        for (i, label) in labels.iter().enumerate() {
            if let Ok(c) = classes.binary_search(label) {
                one_hot[[i, c]] = 1.0;
            }
        }
        let arch = self
            .config
            .architecture(x.ncols(), classes.len(), params.width, Head::Classification)?;
        let mut net = Network::new(&arch, rng);
        let mut history = TrainingHistory::default();

        // early stopping on validation cross-entropy, same fraction as the regression phase
        let (fit_idx, val_idx) = carve_validation(x.nrows(), self.config.train.validation_fraction, rng)?;
        let targets = Targets::Classes { one_hot };
        let x_val = x.select(Axis(0), &val_idx);
        let y_val = targets.rows(&val_idx);
        let report = trainer::train(
            &mut net,
            &x.select(Axis(0), &fit_idx),
            &targets.rows(&fit_idx),
            Some(Validation {
                inputs: &x_val,
                targets: &y_val,
            }),
            self.config.train.phase(),
            &self.config.train,
            params.regularization(),
            rng,
            &mut history,
        )?;
        debug!(classes = classes.len(), epochs = report.epochs_run, best_epoch = report.best_epoch, "pre-training finished");
        Ok((net, report))
    }
}

/// Shuffle `0..n` and split off the validation rows. A positive fraction
/// always yields at least one validation row and one fit row.
fn carve_validation(n: usize, fraction: f32, rng: &mut StdRng) -> Result<(Vec<usize>, Vec<usize>), FitError> {
    let mut idx: Vec<usize> = (0..n).collect();
    if fraction <= 0.0 {
        return Ok((idx, Vec::new()));
    }
    if n < 2 {
        return Err(FitError::EmptyTrainingSet);
    }
    idx.shuffle(rng);
    let n_val = ((n as f32 * fraction).round() as usize).clamp(1, n - 1);
    let val = idx.split_off(n - n_val);
    Ok((idx, val))
}

/// Indices of the `top_n` genes with the largest first-kernel row norm, in
/// column order. Ties go to the lower index.
fn top_genes(net: &Network, top_n: usize) -> Vec<usize> {
    let importance = net.gene_importance();
    let mut order: Vec<usize> = (0..importance.len()).collect();
    order.sort_by(|&a, &b| importance[b].total_cmp(&importance[a]).then(a.cmp(&b)));
    let mut keep: Vec<usize> = order.into_iter().take(top_n).collect();
    keep.sort_unstable();
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, SyntheticSpec};

    fn small_config() -> BottleneckConfig {
        BottleneckConfig {
            encoder: vec![16],
            decoder: vec![16],
            activation: Activation::Elu,
            widths: vec![2],
            l1_grid: vec![1e-3],
            l2_grid: vec![1e-4],
            train: TrainConfig {
                epochs: 60,
                batch_size: 16,
                learning_rate: 5e-3,
                patience: 15,
                ..TrainConfig::default()
            },
            schedule: Schedule::default(),
        }
    }

    fn dataset() -> Dataset {
        Dataset::synthetic(&SyntheticSpec {
            n_samples: 80,
            n_features: 12,
            n_targets: 2,
            missing: vec![(1, 8)],
            seed: 3,
            ..SyntheticSpec::default()
        })
    }

    fn rows(ds: &Dataset) -> TrainingRows<'_> {
        TrainingRows {
            features: ds.features(),
            targets: ds.targets(),
            observed: ds.observed(),
            labels: ds.labels(),
        }
    }

    #[test]
    fn predictions_are_finite_in_original_units() {
        let ds = dataset();
        let config = small_config();
        let model = BottleneckFitter::new(&config)
            .fit(&rows(&ds), config.grid()[0], 1)
            .unwrap();
        let pred = model.predict(ds.features());
        assert_eq!(pred.dim(), (80, 2));
        assert!(pred.iter().all(|v| v.is_finite()));
        assert_eq!(model.latent(ds.features()).ncols(), 2);
        assert_eq!(model.latent(&ds.features_of(&[0])).dim(), (1, 2));
        assert_eq!(model.regularization(), config.grid()[0].regularization());
    }

    #[test]
    fn same_seed_same_model() {
        let ds = dataset();
        let config = small_config();
        let fitter = BottleneckFitter::new(&config);
        let a = fitter.fit(&rows(&ds), config.grid()[0], 9).unwrap();
        let b = fitter.fit(&rows(&ds), config.grid()[0], 9).unwrap();
        assert_eq!(a.predict(ds.features()), b.predict(ds.features()));
    }

    #[test]
    fn pruning_restricts_the_genes_read() {
        let ds = dataset();
        let mut config = small_config();
        config.train.epochs = 20;
        config.schedule.prune_top_n = Some(5);
        let model = BottleneckFitter::new(&config)
            .fit(&rows(&ds), config.grid()[0], 2)
            .unwrap();
        let genes = model.selected_genes().unwrap();
        assert_eq!(genes.len(), 5);
        assert!(genes.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(model.network().architecture().n_inputs(), 5);
        assert_eq!(model.predict(ds.features()).dim(), (80, 2));
        // the narrowed first kernel is retrained under ridge only
        let reg = model.regularization();
        assert_eq!(reg.l1, 0.0);
        assert_eq!(reg.l2, config.grid()[0].l2);
    }

    #[test]
    fn pretrain_and_freeze_run_end_to_end() {
        let ds = dataset();
        let mut config = small_config();
        config.train.epochs = 10;
        config.schedule.pretrain = true;
        config.schedule.freeze = Some(vec![false, true, true, true]);
        let model = BottleneckFitter::new(&config)
            .fit(&rows(&ds), config.grid()[0], 4)
            .unwrap();
        assert!(model.report().epochs_run >= 2);
        assert!(model.history().len() >= 2);
    }

    #[test]
    fn pretrain_without_labels_is_an_error() {
        let ds = dataset();
        let mut config = small_config();
        config.schedule.pretrain = true;
        let no_labels = vec![None; ds.n_samples()];
        let rows = TrainingRows {
            labels: &no_labels,
            ..rows(&ds)
        };
        let err = BottleneckFitter::new(&config).fit(&rows, config.grid()[0], 0).unwrap_err();
        assert!(matches!(err, FitError::MissingLabels));
    }

    #[test]
    fn pretraining_stops_on_validation_cross_entropy() {
        let ds = dataset();
        let mut config = small_config();
        // a zero learning rate never improves on the first epoch
        config.train.learning_rate = 0.0;
        config.train.epochs = 100;
        config.train.patience = 3;
        let fitter = BottleneckFitter::new(&config);
        let mut rng = StdRng::seed_from_u64(6);
        let (_, report) = fitter
            .pretrain(ds.features(), ds.labels(), config.grid()[0], &mut rng)
            .unwrap();
        assert!(report.stopped_early);
        assert_eq!(report.epochs_run, 4);

        // without a validation slice every epoch runs
        config.train.validation_fraction = 0.0;
        let fitter = BottleneckFitter::new(&config);
        let (_, report) = fitter
            .pretrain(ds.features(), ds.labels(), config.grid()[0], &mut rng)
            .unwrap();
        assert!(!report.stopped_early);
        assert_eq!(report.epochs_run, 100);
    }

    #[test]
    fn negative_penalty_is_rejected() {
        let ds = dataset();
        let config = small_config();
        let params = BottleneckParams {
            width: 2,
            l1: -1.0,
            l2: 0.0,
        };
        let err = BottleneckFitter::new(&config).fit(&rows(&ds), params, 0).unwrap_err();
        assert!(matches!(err, FitError::InvalidHyperparameter { name: "l1", .. }));
    }

    #[test]
    fn grid_keeps_lowest_validation_loss() {
        let ds = dataset();
        let mut config = small_config();
        config.train.epochs = 15;
        config.widths = vec![1, 3];
        let fitter = BottleneckFitter::new(&config);
        let best = fitter.fit_grid(&rows(&ds), 5).unwrap();
        for params in config.grid() {
            let m = fitter.fit(&rows(&ds), params, 5).unwrap();
            assert!(best.report().best_val_loss <= m.report().best_val_loss);
        }
    }

    #[test]
    fn json_export_round_trips_predictions() {
        let ds = dataset();
        let mut config = small_config();
        config.train.epochs = 5;
        let model = BottleneckFitter::new(&config)
            .fit(&rows(&ds), config.grid()[0], 6)
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        model.save_json(&path).unwrap();
        let loaded = FittedBottleneck::load_json(&path).unwrap();
        let a = model.predict(ds.features());
        let b = loaded.predict(ds.features());
        assert!(a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-5));
    }

    #[test]
    fn validation_slice_is_never_empty() {
        let mut rng = StdRng::seed_from_u64(0);
        let (fit, val) = carve_validation(5, 0.01, &mut rng).unwrap();
        assert_eq!((fit.len(), val.len()), (4, 1));
        let (fit, val) = carve_validation(5, 0.0, &mut rng).unwrap();
        assert_eq!((fit.len(), val.len()), (5, 0));
    }
}
