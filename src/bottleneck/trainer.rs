// Mini-batch training loop with early stopping on a validation slice and
// best-checkpoint restore.

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::loss;
use super::network::{Network, Regularization};
use super::optim::Adam;
use crate::error::FitError;

/// Optimizer and stopping settings, passed explicitly to every fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub learning_rate: f32,
    pub epochs: usize,
    pub batch_size: usize,
    /// Epochs without validation improvement before stopping.
    pub patience: usize,
    /// Share of the training rows held out for early stopping.
    pub validation_fraction: f32,
    /// Element-wise gradient clip; 0 disables clipping.
    pub gradient_clip: f32,
    /// Show an epoch progress bar.
    pub verbose: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            learning_rate: 1e-3,
            epochs: 500,
            batch_size: 64,
            patience: 20,
            validation_fraction: 0.1,
            gradient_clip: 1.0,
            verbose: false,
        }
    }
}

impl TrainConfig {
    pub fn phase(&self) -> Phase {
        Phase {
            learning_rate: self.learning_rate,
            epochs: self.epochs,
            patience: self.patience,
        }
    }
}

/// One uninterrupted stretch of training with its own optimizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Phase {
    pub learning_rate: f32,
    pub epochs: usize,
    pub patience: usize,
}

impl Phase {
    /// Fine-tuning phase: half the learning rate.
    pub fn halved(self) -> Phase {
        Phase {
            learning_rate: self.learning_rate / 2.0,
            ..self
        }
    }

    /// Twice the epochs and twice the patience.
    pub fn extended(self) -> Phase {
        Phase {
            epochs: self.epochs * 2,
            patience: self.patience * 2,
            ..self
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub loss: Vec<f32>,
    pub val_loss: Vec<f32>,
    pub epochs: Vec<usize>,
}

impl TrainingHistory {
    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    fn push(&mut self, loss: f32, val_loss: f32) {
        let epoch = self.epochs.len();
        self.loss.push(loss);
        self.val_loss.push(val_loss);
        self.epochs.push(epoch);
    }
}

/// Outcome of a training run. Non-convergence is reported here, not raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub epochs_run: usize,
    /// Epoch (within the last phase) whose weights were kept.
    pub best_epoch: usize,
    pub best_val_loss: f32,
    pub stopped_early: bool,
    pub converged: bool,
}

impl FitReport {
    /// Fold a later phase into this one; convergence must hold in every phase.
    pub fn then(self, next: FitReport) -> FitReport {
        FitReport {
            epochs_run: self.epochs_run + next.epochs_run,
            converged: self.converged && next.converged,
            ..next
        }
    }
}

/// Supervision signal for one set of rows.
#[derive(Debug, Clone)]
pub enum Targets {
    /// Standardized targets; `mask` marks observed entries.
    Regression { values: Array2<f32>, mask: Array2<bool> },
    /// One-hot class indicators.
    Classes { one_hot: Array2<f32> },
}

impl Targets {
    pub fn len(&self) -> usize {
        match self {
            Targets::Regression { values, .. } => values.nrows(),
            Targets::Classes { one_hot } => one_hot.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rows(&self, idx: &[usize]) -> Targets {
        match self {
            Targets::Regression { values, mask } => Targets::Regression {
                values: values.select(Axis(0), idx),
                mask: mask.select(Axis(0), idx),
            },
            Targets::Classes { one_hot } => Targets::Classes {
                one_hot: one_hot.select(Axis(0), idx),
            },
        }
    }

    /// Loss and its gradient w.r.t. the output pre-activation.
    pub fn loss(&self, output: &Array2<f32>) -> (f32, Array2<f32>) {
        match self {
            Targets::Regression { values, mask } => loss::masked_mse(values, output, mask),
            Targets::Classes { one_hot } => loss::softmax_cross_entropy(one_hot, output),
        }
    }
}

/// Rows used for early stopping.
pub struct Validation<'a> {
    pub inputs: &'a Array2<f32>,
    pub targets: &'a Targets,
}

/// Train `net` in place. With a validation set, the weights of the best
/// validation epoch are restored at the end; without one, all epochs run and
/// the final weights are kept.
#[allow(clippy::too_many_arguments)]
pub fn train(
    net: &mut Network,
    inputs: &Array2<f32>,
    targets: &Targets,
    validation: Option<Validation<'_>>,
    phase: Phase,
    config: &TrainConfig,
    reg: Regularization,
    rng: &mut StdRng,
    history: &mut TrainingHistory,
) -> Result<FitReport, FitError> {
    let n = inputs.nrows();
    if n == 0 || targets.len() != n {
        return Err(FitError::EmptyTrainingSet);
    }
    let validation = validation.filter(|v| v.inputs.nrows() > 0);
    let batch_size = config.batch_size.max(1);
    let mut adam = Adam::new(net, phase.learning_rate);

    let pb = progress_bar(phase.epochs, config.verbose);
    let mut indices: Vec<usize> = (0..n).collect();
    let mut best: Option<(f32, usize, Network)> = None;
    let mut since_best = 0usize;
    let mut stopped_early = false;
    let mut diverged = false;
    let mut epochs_run = 0usize;

    for epoch in 0..phase.epochs {
        indices.shuffle(rng);
        let mut epoch_loss = 0.0f32;
        let mut finite = true;

        for chunk in indices.chunks(batch_size) {
            let batch_x = inputs.select(Axis(0), chunk);
            let batch_y = targets.rows(chunk);
            let cache = net.forward(&batch_x);
            let (data_loss, d_out) = batch_y.loss(cache.output());
            let batch_loss = data_loss + net.penalty(reg);
            if !batch_loss.is_finite() {
                finite = false;
                epoch_loss = batch_loss;
                break;
            }

            let mut grads = net.backward(&batch_x, &cache, d_out);
            net.add_penalty_gradients(reg, &mut grads);
            if config.gradient_clip > 0.0 {
                let c = config.gradient_clip;
                for g in &mut grads {
                    g.weights.mapv_inplace(|x| x.clamp(-c, c));
                    g.bias.mapv_inplace(|x| x.clamp(-c, c));
                }
            }
            adam.step(net, &grads);
            epoch_loss += batch_loss * chunk.len() as f32;
        }
        epochs_run = epoch + 1;

        let train_loss = epoch_loss / n as f32;
        let monitored = match &validation {
            Some(v) => v.targets.loss(&net.predict(v.inputs)).0,
            None => train_loss,
        };
        if !finite || !monitored.is_finite() || !net.is_finite() {
            diverged = true;
            if best.is_none() {
                pb.abandon_with_message(format!("diverged at epoch {epoch}"));
                return Err(FitError::Diverged {
                    epoch,
                    loss: if finite { monitored } else { epoch_loss },
                });
            }
            warn!(epoch, "non-finite loss, falling back to best checkpoint");
            break;
        }
        history.push(train_loss, monitored);

        let improved = best.as_ref().map_or(true, |(b, _, _)| monitored < *b);
        if improved {
            best = Some((monitored, epoch, net.clone()));
            since_best = 0;
        } else {
            since_best += 1;
        }
        pb.set_message(format!(
            "train={:.4}, val={:.4}{}",
            train_loss,
            monitored,
            if improved { " *" } else { "" }
        ));
        pb.inc(1);

        if validation.is_some() && since_best >= phase.patience {
            stopped_early = true;
            break;
        }
    }

    let (best_val_loss, best_epoch) = match best {
        Some((loss, epoch, weights)) => {
            if validation.is_some() || diverged {
                *net = weights;
            }
            (loss, epoch)
        }
        None => (f32::INFINITY, 0),
    };
    let converged = !diverged && !(stopped_early && best_epoch == 0);
    pb.finish_with_message(format!("best val={best_val_loss:.4} at epoch {best_epoch}"));
    debug!(epochs_run, best_epoch, best_val_loss, stopped_early, converged, "training phase finished");

    Ok(FitReport {
        epochs_run,
        best_epoch,
        best_val_loss,
        stopped_early,
        converged,
    })
}

fn progress_bar(epochs: usize, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(epochs as u64);
    if let Ok(style) = ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} Epoch {msg}") {
        pb.set_style(style.progress_chars("█▇▆▅▃▂▁  "));
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bottleneck::activation::Activation;
    use crate::bottleneck::architecture::ArchitectureBuilder;
    use ndarray::Array1;
    use ndarray_rand::rand_distr::StandardNormal;
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;

    fn linear_problem(n: usize, seed: u64) -> (Array2<f32>, Targets) {
        let mut rng = StdRng::seed_from_u64(seed);
        let x: Array2<f32> = Array2::random_using((n, 4), StandardNormal, &mut rng);
        let w = Array1::from(vec![1.0f32, -2.0, 0.5, 0.0]);
        let y = x.dot(&w).insert_axis(Axis(1));
        let mask = Array2::from_elem(y.raw_dim(), true);
        (x, Targets::Regression { values: y, mask })
    }

    fn net(seed: u64) -> Network {
        let arch = ArchitectureBuilder::new(4, 1)
            .encoder(&[8])
            .bottleneck(2)
            .decoder(&[8])
            .activation(Activation::Tanh)
            .build()
            .unwrap();
        Network::new(&arch, &mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn loss_decreases_on_a_linear_problem() {
        let (x, y) = linear_problem(128, 1);
        let (vx, vy) = linear_problem(32, 2);
        let mut net = net(3);
        let config = TrainConfig {
            epochs: 150,
            batch_size: 32,
            learning_rate: 0.01,
            patience: 30,
            ..TrainConfig::default()
        };
        let mut history = TrainingHistory::default();
        let report = train(
            &mut net,
            &x,
            &y,
            Some(Validation { inputs: &vx, targets: &vy }),
            config.phase(),
            &config,
            Regularization::default(),
            &mut StdRng::seed_from_u64(4),
            &mut history,
        )
        .unwrap();
        assert!(report.converged);
        assert!(history.val_loss[report.best_epoch] < history.val_loss[0]);
        assert!(report.best_val_loss < 0.5 * history.val_loss[0]);
    }

    #[test]
    fn best_checkpoint_is_restored() {
        let (x, y) = linear_problem(64, 5);
        let (vx, vy) = linear_problem(16, 6);
        let mut net = net(7);
        let config = TrainConfig {
            epochs: 40,
            batch_size: 16,
            learning_rate: 0.05,
            patience: 5,
            ..TrainConfig::default()
        };
        let mut history = TrainingHistory::default();
        let report = train(
            &mut net,
            &x,
            &y,
            Some(Validation { inputs: &vx, targets: &vy }),
            config.phase(),
            &config,
            Regularization::default(),
            &mut StdRng::seed_from_u64(8),
            &mut history,
        )
        .unwrap();
        let restored = vy.loss(&net.predict(&vx)).0;
        assert!((restored - report.best_val_loss).abs() < 1e-5);
    }

    #[test]
    fn no_improvement_is_reported_not_raised() {
        let (x, y) = linear_problem(32, 9);
        let mut net = net(10);
        // a learning rate of zero can never improve on epoch 0
        let config = TrainConfig {
            epochs: 50,
            learning_rate: 0.0,
            patience: 3,
            ..TrainConfig::default()
        };
        let mut history = TrainingHistory::default();
        let report = train(
            &mut net,
            &x,
            &y,
            Some(Validation { inputs: &x, targets: &y }),
            config.phase(),
            &config,
            Regularization::default(),
            &mut StdRng::seed_from_u64(0),
            &mut history,
        )
        .unwrap();
        assert!(report.stopped_early);
        assert!(!report.converged);
        assert_eq!(report.epochs_run, 4);
    }

    #[test]
    fn same_seed_gives_identical_weights() {
        let (x, y) = linear_problem(40, 12);
        let config = TrainConfig {
            epochs: 10,
            batch_size: 8,
            validation_fraction: 0.0,
            ..TrainConfig::default()
        };
        let run = || {
            let mut net = net(13);
            let mut history = TrainingHistory::default();
            train(
                &mut net,
                &x,
                &y,
                None,
                config.phase(),
                &config,
                Regularization { l1: 0.01, l2: 0.001 },
                &mut StdRng::seed_from_u64(14),
                &mut history,
            )
            .unwrap();
            net.predict(&x)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn non_finite_first_epoch_is_an_error() {
        let (mut x, y) = linear_problem(32, 15);
        x[[5, 1]] = f32::NAN;
        let mut net = net(16);
        let config = TrainConfig {
            epochs: 5,
            ..TrainConfig::default()
        };
        let mut history = TrainingHistory::default();
        let err = train(
            &mut net,
            &x,
            &y,
            None,
            config.phase(),
            &config,
            Regularization::default(),
            &mut StdRng::seed_from_u64(17),
            &mut history,
        )
        .unwrap_err();
        assert!(matches!(err, FitError::Diverged { epoch: 0, .. }));
        assert!(history.is_empty());
    }

    #[test]
    fn later_divergence_falls_back_to_the_checkpoint() {
        let (x, y) = linear_problem(32, 18);
        let mut net = net(19);
        // one step per epoch; the step throws the first kernel out to ~1e10 and
        // the group-lasso term overflows on the next forward pass
        let config = TrainConfig {
            epochs: 10,
            batch_size: 64,
            learning_rate: 1e10,
            ..TrainConfig::default()
        };
        let mut history = TrainingHistory::default();
        let report = train(
            &mut net,
            &x,
            &y,
            None,
            config.phase(),
            &config,
            Regularization { l1: 1e30, l2: 0.0 },
            &mut StdRng::seed_from_u64(20),
            &mut history,
        )
        .unwrap();
        assert!(!report.converged);
        assert_eq!(report.epochs_run, 2);
        assert_eq!(report.best_epoch, 0);
        assert!(report.best_val_loss.is_finite());
        assert_eq!(history.len(), 1);
        assert!(net.is_finite());
        assert!(net.predict(&x).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn phases_halve_and_extend() {
        let p = TrainConfig::default().phase();
        assert_eq!(p.halved().learning_rate, p.learning_rate / 2.0);
        assert_eq!(p.extended().patience, p.patience * 2);
        assert_eq!(p.extended().epochs, p.epochs * 2);
    }
}
