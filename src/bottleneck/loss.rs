// Training losses. Each returns the scalar loss and the gradient w.r.t. the
// pre-activation of the output layer.

use ndarray::{Array2, Zip};

/// Mean squared error over observed entries only.
///
/// Every target column is averaged over its own observed rows, then columns
/// with at least one observation are averaged. Unobserved entries contribute
/// neither to the loss nor to the gradient, whatever value they hold.
pub fn masked_mse(y_true: &Array2<f32>, y_pred: &Array2<f32>, mask: &Array2<bool>) -> (f32, Array2<f32>) {
    let counts: Vec<usize> = mask
        .columns()
        .into_iter()
        .map(|c| c.iter().filter(|&&m| m).count())
        .collect();
    let active = counts.iter().filter(|&&c| c > 0).count();
    let mut grad = Array2::zeros(y_pred.raw_dim());
    if active == 0 {
        return (0.0, grad);
    }

    let mut loss = 0.0;
    for (j, &count) in counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let weight = 1.0 / (count * active) as f32;
        Zip::from(grad.column_mut(j))
            .and(y_true.column(j))
            .and(y_pred.column(j))
            .and(mask.column(j))
            .for_each(|g, &t, &p, &m| {
                if m {
                    let d = p - t;
                    loss += weight * d * d;
                    *g = 2.0 * weight * d;
                }
            });
    }
    (loss, grad)
}

/// Categorical cross-entropy for a softmax head. `probs` are softmax outputs,
/// `one_hot` the class indicators; the gradient is w.r.t. the logits.
pub fn softmax_cross_entropy(one_hot: &Array2<f32>, probs: &Array2<f32>) -> (f32, Array2<f32>) {
    let epsilon: f32 = 1e-7;
    let n = probs.nrows().max(1) as f32;
    let loss = -(one_hot * &probs.mapv(|p| p.clamp(epsilon, 1.0).ln())).sum() / n;
    let grad = (probs - one_hot) / n;
    (loss, grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn missing_entries_do_not_contribute() {
        let y = array![[1.0f32, f32::NAN], [2.0, 5.0], [3.0, f32::NAN]];
        let mask = y.mapv(|v| !v.is_nan());
        let pred = array![[1.5f32, 100.0], [2.0, 4.0], [3.0, -100.0]];
        let (loss, grad) = masked_mse(&y, &pred, &mask);
        // column 0: (0.25 + 0 + 0) / 3, column 1: 1 / 1, averaged over 2 columns
        let expected = (0.25 / 3.0 + 1.0) / 2.0;
        assert!((loss - expected).abs() < 1e-6);
        assert_eq!(grad[[0, 1]], 0.0);
        assert_eq!(grad[[2, 1]], 0.0);
        assert!(loss.is_finite());
    }

    #[test]
    fn fully_missing_column_is_ignored() {
        let y = array![[1.0f32, f32::NAN], [3.0, f32::NAN]];
        let mask = y.mapv(|v| !v.is_nan());
        let pred = array![[0.0f32, 0.0], [3.0, 0.0]];
        let (loss, _) = masked_mse(&y, &pred, &mask);
        assert!((loss - 0.5).abs() < 1e-6);
    }

    #[test]
    fn cross_entropy_gradient_is_prob_minus_target() {
        let one_hot = array![[1.0f32, 0.0], [0.0, 1.0]];
        let probs = array![[0.8f32, 0.2], [0.4, 0.6]];
        let (loss, grad) = softmax_cross_entropy(&one_hot, &probs);
        let expected = -(0.8f32.ln() + 0.6f32.ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-6);
        assert!((grad[[0, 0]] + 0.1).abs() < 1e-6);
        assert!((grad[[1, 0]] - 0.2).abs() < 1e-6);
    }
}
