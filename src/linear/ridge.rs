// Closed-form ridge: (Xc'Xc / n + alpha I) b = Xc'yc / n, solved by Cholesky.
// Same objective as ElasticNet with l1_ratio = 0.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, Axis};

use super::LinearCoefficients;
use crate::error::FitError;

pub fn fit_ridge(x: &Array2<f32>, y: ArrayView1<f32>, alpha: f32) -> Result<LinearCoefficients, FitError> {
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
    let yc = y.mapv(|v| v as f64 - y_mean);

    let nf = n as f64;
    let gram = xc.t().dot(&xc) / nf;
    let rhs = xc.t().dot(&yc) / nf;

    let a = DMatrix::from_fn(p, p, |i, j| gram[[i, j]] + if i == j { alpha as f64 } else { 0.0 });
    let b = DVector::from_iterator(p, rhs.iter().copied());
    let chol = a.cholesky().ok_or(FitError::Singular)?;
    let beta = chol.solve(&b);

    let beta = Array1::from_iter(beta.iter().copied());
    let intercept = y_mean - x_mean.dot(&beta);
    Ok(LinearCoefficients {
        coefficients: beta.mapv(|b| b as f32),
        intercept: intercept as f32,
    })
}
