// Penalized linear baselines, one independent model per target.
//
// Each target is fitted on the training rows where it is observed. The
// penalty is chosen by inner K-fold cross-validation on those rows only.

pub mod elastic_net;
pub mod ridge;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cv::split::KFold;
use crate::error::FitError;
use crate::preprocessing::StandardScaler;

pub use elastic_net::ElasticNet;
pub use ridge::fit_ridge;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearConfig {
    pub alphas: Vec<f32>,
    /// 0 is ridge, 1 is lasso.
    pub l1_ratios: Vec<f32>,
    pub inner_folds: usize,
    pub max_iter: usize,
    pub tol: f32,
}

impl Default for LinearConfig {
    fn default() -> Self {
        LinearConfig {
            alphas: vec![1e-3, 1e-2, 1e-1, 1.0, 10.0],
            l1_ratios: vec![0.0, 0.5, 1.0],
            inner_folds: 5,
            max_iter: 1000,
            tol: 1e-4,
        }
    }
}

impl LinearConfig {
    /// Alpha-major product of the grids, in selection order.
    pub fn grid(&self) -> Vec<(f32, f32)> {
        self.alphas
            .iter()
            .flat_map(|&a| self.l1_ratios.iter().map(move |&r| (a, r)))
            .collect()
    }

    fn validate(&self) -> Result<(), FitError> {
        let invalid = |name, value: String, constraint| FitError::InvalidHyperparameter { name, value, constraint };
        if self.alphas.is_empty() || self.l1_ratios.is_empty() {
            return Err(invalid("grid", "[]".into(), "needs at least one alpha and one l1_ratio"));
        }
        if let Some(a) = self.alphas.iter().find(|a| !(**a >= 0.0 && a.is_finite())) {
            return Err(invalid("alpha", a.to_string(), "must be finite and >= 0"));
        }
        if let Some(r) = self.l1_ratios.iter().find(|r| !(0.0..=1.0).contains(*r)) {
            return Err(invalid("l1_ratio", r.to_string(), "must be in [0, 1]"));
        }
        if self.inner_folds < 2 {
            return Err(invalid("inner_folds", self.inner_folds.to_string(), "must be >= 2"));
        }
        Ok(())
    }
}

/// Raw output of a solver on standardized features.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearCoefficients {
    pub coefficients: Array1<f32>,
    pub intercept: f32,
}

impl LinearCoefficients {
    pub fn predict(&self, x: &Array2<f32>) -> Array1<f32> {
        x.dot(&self.coefficients) + self.intercept
    }
}

/// Ridge in closed form when there is no L1 part, coordinate descent otherwise.
fn solve(x: &Array2<f32>, y: ArrayView1<f32>, alpha: f32, l1_ratio: f32, config: &LinearConfig) -> Result<LinearCoefficients, FitError> {
    if l1_ratio == 0.0 {
        match fit_ridge(x, y, alpha) {
            Err(FitError::Singular) => {}
            other => return other,
        }
    }
    ElasticNet::new(alpha, l1_ratio)
        .with_max_iter(config.max_iter)
        .with_tol(config.tol)
        .fit(x, y)
}

/// A fitted baseline for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearFit {
    coefficients: Array1<f32>,
    intercept: f32,
    feature_scaler: StandardScaler,
    alpha: f32,
    l1_ratio: f32,
    /// Mean inner-fold MSE of the chosen penalty.
    inner_mse: f32,
}

impl LinearFit {
    /// Predictions in original target units.
    pub fn predict(&self, features: &Array2<f32>) -> Array1<f32> {
        self.feature_scaler.transform(features).dot(&self.coefficients) + self.intercept
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn l1_ratio(&self) -> f32 {
        self.l1_ratio
    }

    pub fn inner_mse(&self) -> f32 {
        self.inner_mse
    }

    /// Coefficients on the standardized features.
    pub fn coefficients(&self) -> &Array1<f32> {
        &self.coefficients
    }

    pub fn intercept(&self) -> f32 {
        self.intercept
    }
}

#[derive(Debug, Clone)]
pub enum LinearOutcome {
    Fitted(LinearFit),
    /// Too few observed training rows for this target.
    InsufficientData { observed: usize },
}

pub struct LinearFitter<'a> {
    config: &'a LinearConfig,
    min_observations: usize,
}

impl<'a> LinearFitter<'a> {
    pub fn new(config: &'a LinearConfig, min_observations: usize) -> Self {
        LinearFitter { config, min_observations }
    }

    /// Fit one target on the rows where it is observed.
    pub fn fit_target(
        &self,
        features: &Array2<f32>,
        target: ArrayView1<f32>,
        observed: ArrayView1<bool>,
        seed: u64,
    ) -> Result<LinearOutcome, FitError> {
        self.config.validate()?;
        if target.len() != features.nrows() || observed.len() != features.nrows() {
            return Err(FitError::DimensionMismatch {
                expected: format!("{} rows", features.nrows()),
                actual: format!("{} targets, {} mask entries", target.len(), observed.len()),
            });
        }
        let rows: Vec<usize> = observed.iter().enumerate().filter_map(|(i, &m)| m.then_some(i)).collect();
        let needed = self.min_observations.max(self.config.inner_folds);
        if rows.len() < needed {
            return Ok(LinearOutcome::InsufficientData { observed: rows.len() });
        }

        let x = features.select(Axis(0), &rows);
        let y = target.select(Axis(0), &rows);
        let (alpha, l1_ratio, inner_mse) = self.select_penalty(&x, &y, seed)?;
        debug!(alpha, l1_ratio, inner_mse, observed = rows.len(), "selected linear penalty");

        let feature_scaler = StandardScaler::fit(&x);
        let fit = solve(&feature_scaler.transform(&x), y.view(), alpha, l1_ratio, self.config)?;
        Ok(LinearOutcome::Fitted(LinearFit {
            coefficients: fit.coefficients,
            intercept: fit.intercept,
            feature_scaler,
            alpha,
            l1_ratio,
            inner_mse,
        }))
    }

    /// Lowest mean inner-fold MSE over the grid; ties keep the earlier entry.
    /// The scaler is refitted on every inner training part.
    fn select_penalty(&self, x: &Array2<f32>, y: &Array1<f32>, seed: u64) -> Result<(f32, f32, f32), FitError> {
        let folds: Vec<_> = KFold::new(self.config.inner_folds, seed)
            .split(x.nrows())
            .into_iter()
            .map(|(train, test)| {
                let x_train = x.select(Axis(0), &train);
                let scaler = StandardScaler::fit(&x_train);
                (
                    scaler.transform(&x_train),
                    y.select(Axis(0), &train),
                    scaler.transform(&x.select(Axis(0), &test)),
                    y.select(Axis(0), &test),
                )
            })
            .collect();

        let mut best: Option<(f32, f32, f32)> = None;
        for (alpha, l1_ratio) in self.config.grid() {
            let mut total = 0.0f64;
            for (x_train, y_train, x_test, y_test) in &folds {
                let fit = solve(x_train, y_train.view(), alpha, l1_ratio, self.config)?;
                let err = &fit.predict(x_test) - y_test;
                total += err.mapv(|e| (e as f64) * (e as f64)).mean().unwrap_or(0.0);
            }
            let mse = (total / folds.len() as f64) as f32;
            if best.map_or(true, |(_, _, b)| mse < b) {
                best = Some((alpha, l1_ratio, mse));
            }
        }
        best.ok_or(FitError::InvalidHyperparameter {
            name: "grid",
            value: "[]".into(),
            constraint: "needs at least one alpha and one l1_ratio",
        })
    }
}
