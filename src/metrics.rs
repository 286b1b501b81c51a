// Held-out error metrics, computed on observed entries only.

use ndarray::{ArrayView1, Zip};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Fraction of variance explained, 1 - SS_res / SS_tot.
    #[default]
    R2,
    /// Root mean squared error, in target units.
    Rmse,
}

impl Metric {
    /// Score the observed entries; `None` when nothing is observed.
    pub fn score(self, y_true: ArrayView1<f32>, y_pred: ArrayView1<f32>, observed: ArrayView1<bool>) -> Option<f32> {
        match self {
            Metric::R2 => r_squared(y_true, y_pred, observed),
            Metric::Rmse => masked_rmse(y_true, y_pred, observed),
        }
    }

    pub fn higher_is_better(self) -> bool {
        matches!(self, Metric::R2)
    }

    pub fn name(self) -> &'static str {
        match self {
            Metric::R2 => "r2",
            Metric::Rmse => "rmse",
        }
    }
}

/// Observed (truth, prediction) pairs.
fn observed_pairs(y_true: ArrayView1<f32>, y_pred: ArrayView1<f32>, observed: ArrayView1<bool>) -> Vec<(f64, f64)> {
    let mut pairs = Vec::with_capacity(observed.len());
    Zip::from(y_true).and(y_pred).and(observed).for_each(|&t, &p, &m| {
        if m {
            pairs.push((t as f64, p as f64));
        }
    });
    pairs
}

pub fn r_squared(y_true: ArrayView1<f32>, y_pred: ArrayView1<f32>, observed: ArrayView1<bool>) -> Option<f32> {
    let pairs = observed_pairs(y_true, y_pred, observed);
    if pairs.is_empty() {
        return None;
    }
    let mean = pairs.iter().map(|(t, _)| t).sum::<f64>() / pairs.len() as f64;
    let ss_res: f64 = pairs.iter().map(|(t, p)| (t - p).powi(2)).sum();
    let ss_tot: f64 = pairs.iter().map(|(t, _)| (t - mean).powi(2)).sum();
    let r2 = if ss_tot == 0.0 {
        if ss_res == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    };
    Some(r2 as f32)
}

pub fn masked_rmse(y_true: ArrayView1<f32>, y_pred: ArrayView1<f32>, observed: ArrayView1<bool>) -> Option<f32> {
    let pairs = observed_pairs(y_true, y_pred, observed);
    if pairs.is_empty() {
        return None;
    }
    let mse = pairs.iter().map(|(t, p)| (t - p).powi(2)).sum::<f64>() / pairs.len() as f64;
    Some(mse.sqrt() as f32)
}

/// Number of entries a masked metric actually uses.
pub fn observed_count(observed: ArrayView1<bool>) -> usize {
    observed.iter().filter(|&&m| m).count()
}
