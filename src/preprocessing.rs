// Per-column standardization.
//
// Scalers are always fitted on the training rows of a fold and then applied
// unchanged to validation and test rows.

use ndarray::{Array1, Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Zero mean, unit variance per column. Constant columns get scale 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Array1<f32>,
    scale: Array1<f32>,
}

impl StandardScaler {
    pub fn fit(x: &Array2<f32>) -> Self {
        let mask = Array2::from_elem(x.raw_dim(), true);
        Self::fit_masked(x, &mask)
    }

    /// Fit using only the entries where `mask` is true. Columns without any
    /// observed entry get mean 0 and scale 1.
    pub fn fit_masked(x: &Array2<f32>, mask: &Array2<bool>) -> Self {
        let n_cols = x.ncols();
        let mut mean = Array1::zeros(n_cols);
        let mut scale = Array1::ones(n_cols);
        for j in 0..n_cols {
            let mut sum = 0.0f64;
            let mut sum_sq = 0.0f64;
            let mut count = 0usize;
            Zip::from(x.column(j)).and(mask.column(j)).for_each(|&v, &m| {
                if m {
                    sum += v as f64;
                    sum_sq += (v as f64) * (v as f64);
                    count += 1;
                }
            });
            if count == 0 {
                continue;
            }
            let mu = sum / count as f64;
            let var = (sum_sq / count as f64 - mu * mu).max(0.0);
            mean[j] = mu as f32;
            let sd = var.sqrt() as f32;
            scale[j] = if sd > 1e-8 { sd } else { 1.0 };
        }
        StandardScaler { mean, scale }
    }

    pub fn mean(&self) -> &Array1<f32> {
        &self.mean
    }

    pub fn scale(&self) -> &Array1<f32> {
        &self.scale
    }

    /// Missing entries (NaN) stay NaN.
    pub fn transform(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.to_owned();
        for mut row in out.axis_iter_mut(Axis(0)) {
            Zip::from(&mut row)
                .and(&self.mean)
                .and(&self.scale)
                .for_each(|v, &m, &s| *v = (*v - m) / s);
        }
        out
    }

    pub fn inverse_transform(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.to_owned();
        for mut row in out.axis_iter_mut(Axis(0)) {
            Zip::from(&mut row)
                .and(&self.mean)
                .and(&self.scale)
                .for_each(|v, &m, &s| *v = *v * s + m);
        }
        out
    }

    /// Scaler restricted to the given columns, in that order.
    pub fn select(&self, columns: &[usize]) -> Self {
        StandardScaler {
            mean: self.mean.select(Axis(0), columns),
            scale: self.scale.select(Axis(0), columns),
        }
    }
}
