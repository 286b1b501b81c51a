// This file contains the activation functions used by the dense layers.
// Each one works in place on a batch of pre-activations and knows its own derivative.

use ndarray::{Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    #[default]
    Relu,
    LeakyRelu,
    Elu,
    Tanh,
    Sigmoid,
    /// Row-wise softmax. Only valid on the classification head, where the
    /// cross-entropy loss supplies the gradient w.r.t. the pre-activation.
    Softmax,
}

const LEAKY_ALPHA: f32 = 0.01;

impl Activation {
    pub fn apply(self, z: &mut Array2<f32>) {
        match self {
            Activation::Linear => {}
            Activation::Relu => z.mapv_inplace(|v| v.max(0.0)),
            Activation::LeakyRelu => z.mapv_inplace(|v| if v > 0.0 { v } else { LEAKY_ALPHA * v }),
            Activation::Elu => z.mapv_inplace(|v| if v > 0.0 { v } else { v.exp() - 1.0 }),
            Activation::Tanh => z.mapv_inplace(f32::tanh),
            Activation::Sigmoid => z.mapv_inplace(|v| 1.0 / ((-v).exp() + 1.0)),
            Activation::Softmax => softmax_rows(z),
        }
    }

    /// Element-wise derivative, given the pre-activation `z` and the output `a`.
    ///
    /// Softmax returns ones: its Jacobian is folded into the loss gradient.
    pub fn derivative(self, z: &Array2<f32>, a: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Linear | Activation::Softmax => Array2::ones(z.raw_dim()),
            Activation::Relu => z.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
            Activation::LeakyRelu => z.mapv(|v| if v > 0.0 { 1.0 } else { LEAKY_ALPHA }),
            Activation::Elu => {
                let mut d = Array2::zeros(z.raw_dim());
                Zip::from(&mut d).and(z).and(a).for_each(|d, &z, &a| {
                    *d = if z > 0.0 { 1.0 } else { a + 1.0 };
                });
                d
            }
            Activation::Tanh => a.mapv(|v| 1.0 - v * v),
            Activation::Sigmoid => a.mapv(|v| v * (1.0 - v)),
        }
    }
}

fn softmax_rows(z: &mut Array2<f32>) {
    for mut row in z.axis_iter_mut(Axis(0)) {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn relu_clamps_negatives() {
        let mut z = array![[-1.0f32, 0.5], [2.0, -0.1]];
        Activation::Relu.apply(&mut z);
        assert_eq!(z, array![[0.0, 0.5], [2.0, 0.0]]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut z = array![[1.0f32, 2.0, 3.0], [1000.0, 1000.0, 1000.0]];
        Activation::Softmax.apply(&mut z);
        for row in z.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((z[[1, 0]] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn sigmoid_derivative_peaks_at_zero() {
        let z = array![[0.0f32, 4.0]];
        let mut a = z.clone();
        Activation::Sigmoid.apply(&mut a);
        let d = Activation::Sigmoid.derivative(&z, &a);
        assert!((d[[0, 0]] - 0.25).abs() < 1e-6);
        assert!(d[[0, 1]] < 0.25);
    }

    #[test]
    fn elu_derivative_is_continuous_at_zero() {
        let z = array![[-1e-4f32, 1e-4]];
        let mut a = z.clone();
        Activation::Elu.apply(&mut a);
        let d = Activation::Elu.derivative(&z, &a);
        assert!((d[[0, 0]] - d[[0, 1]]).abs() < 1e-3);
    }
}
