// Elastic net by cyclic coordinate descent.
//
// Objective: 1/(2n) ||y - Xb - c||^2 + alpha * rho * ||b||_1
//            + alpha * (1 - rho) / 2 * ||b||^2

use ndarray::{Array1, Array2, ArrayView1, Axis};

use super::LinearCoefficients;
use crate::error::FitError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElasticNet {
    alpha: f32,
    l1_ratio: f32,
    max_iter: usize,
    tol: f32,
}

impl ElasticNet {
    pub fn new(alpha: f32, l1_ratio: f32) -> Self {
        ElasticNet {
            alpha,
            l1_ratio,
            max_iter: 1000,
            tol: 1e-4,
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tol(mut self, tol: f32) -> Self {
        self.tol = tol;
        self
    }

    /// Fit with an unpenalized intercept. The largest coefficient change of a
    /// full sweep below `tol` ends the descent; hitting `max_iter` is not an
    /// error.
    pub fn fit(&self, x: &Array2<f32>, y: ArrayView1<f32>) -> Result<LinearCoefficients, FitError> {
        let (n, p) = x.dim();
        if n == 0 {
            return Err(FitError::EmptyTrainingSet);
        }
        if y.len() != n {
            return Err(FitError::DimensionMismatch {
                expected: format!("{n} targets"),
                actual: format!("{}", y.len()),
            });
        }

        let x = x.mapv(f64::from);
        let x_mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p));
        let xc = &x - &x_mean;
        let y_mean = y.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
        // residual of the current coefficients, starts at the centered target
        let mut residual: Array1<f64> = y.mapv(|v| v as f64 - y_mean);

        let nf = n as f64;
        let l1 = (self.alpha * self.l1_ratio) as f64;
        let l2 = (self.alpha * (1.0 - self.l1_ratio)) as f64;
        let col_sq: Vec<f64> = xc.columns().into_iter().map(|c| c.dot(&c) / nf).collect();
        let mut beta = Array1::<f64>::zeros(p);

        let mut iterations = 0;
        for _ in 0..self.max_iter {
            iterations += 1;
            let mut max_change = 0.0f64;
            for j in 0..p {
                if col_sq[j] < 1e-12 {
                    continue;
                }
                let col = xc.column(j);
                let old = beta[j];
                let rho = col.dot(&residual) / nf + col_sq[j] * old;
                let new = soft_threshold(rho, l1) / (col_sq[j] + l2);
                if new != old {
                    residual.scaled_add(old - new, &col);
                    beta[j] = new;
                    max_change = max_change.max((new - old).abs());
                }
            }
            if max_change < self.tol as f64 {
                break;
            }
        }
        tracing::trace!(iterations, alpha = self.alpha, l1_ratio = self.l1_ratio, "coordinate descent finished");

        let intercept = y_mean - x_mean.dot(&beta);
        Ok(LinearCoefficients {
            coefficients: beta.mapv(|b| b as f32),
            intercept: intercept as f32,
        })
    }
}

/// sign(x) * max(|x| - lambda, 0)
pub fn soft_threshold(x: f64, lambda: f64) -> f64 {
    if x > lambda {
        x - lambda
    } else if x < -lambda {
        x + lambda
    } else {
        0.0
    }
}
