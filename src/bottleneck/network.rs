// Dense feed-forward network on ndarray: forward pass with cached activations,
// backpropagation, the sparse-group regularizer, and the weight surgery used by
// pre-training transfer and input pruning.

use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::activation::Activation;
use super::architecture::Architecture;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    pub name: String,
    /// (n_in, n_out); row `i` holds the fan-out of input unit `i`.
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
    pub activation: Activation,
    pub trainable: bool,
}

impl Dense {
    /// Glorot-uniform weights, zero bias.
    pub fn new(name: &str, n_in: usize, n_out: usize, activation: Activation, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (n_in + n_out) as f32).sqrt();
        Dense {
            name: name.to_string(),
            weights: Array2::random_using((n_in, n_out), Uniform::new(-limit, limit), rng),
            bias: Array1::zeros(n_out),
            activation,
            trainable: true,
        }
    }
}

/// Penalty weights. The first kernel gets ridge plus a group lasso over its
/// rows (one group per input gene); deeper kernels and all hidden biases get
/// ridge only; the output bias is not penalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Regularization {
    pub l1: f32,
    pub l2: f32,
}

#[derive(Debug, Clone)]
pub struct Gradient {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

/// Pre- and post-activation of every layer for one batch.
pub struct ForwardCache {
    pub pre: Vec<Array2<f32>>,
    pub post: Vec<Array2<f32>>,
}

impl ForwardCache {
    pub fn output(&self) -> &Array2<f32> {
        &self.post[self.post.len() - 1]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    architecture: Architecture,
    layers: Vec<Dense>,
}

impl Network {
    pub fn new(architecture: &Architecture, rng: &mut StdRng) -> Self {
        let mut in_dim = architecture.n_inputs();
        let mut layers = Vec::with_capacity(architecture.layers().len());
        for spec in architecture.layers() {
            layers.push(Dense::new(&spec.name, in_dim, spec.width, spec.activation, rng));
            in_dim = spec.width;
        }
        Network {
            architecture: architecture.clone(),
            layers,
        }
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [Dense] {
        &mut self.layers
    }

    pub fn forward(&self, inputs: &Array2<f32>) -> ForwardCache {
        let mut pre = Vec::with_capacity(self.layers.len());
        let mut post: Vec<Array2<f32>> = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let z = {
                let input = post.last().unwrap_or(inputs);
                let mut z = input.dot(&layer.weights);
                z += &layer.bias;
                z
            };
            let mut a = z.clone();
            layer.activation.apply(&mut a);
            pre.push(z);
            post.push(a);
        }
        ForwardCache { pre, post }
    }

    /// Output of layer `depth - 1`, without keeping intermediate activations.
    fn forward_to(&self, inputs: &Array2<f32>, depth: usize) -> Array2<f32> {
        let mut current = inputs.to_owned();
        for layer in self.layers.iter().take(depth) {
            let mut z = current.dot(&layer.weights);
            z += &layer.bias;
            layer.activation.apply(&mut z);
            current = z;
        }
        current
    }

    pub fn predict(&self, inputs: &Array2<f32>) -> Array2<f32> {
        self.forward_to(inputs, self.layers.len())
    }

    /// Bottleneck activations, shape (n_samples, k).
    pub fn latent(&self, inputs: &Array2<f32>) -> Array2<f32> {
        self.forward_to(inputs, self.architecture.bottleneck_index() + 1)
    }

    /// Backpropagate `d_out`, the loss gradient w.r.t. the pre-activation of
    /// the output layer, through every layer.
    pub fn backward(&self, inputs: &Array2<f32>, cache: &ForwardCache, d_out: Array2<f32>) -> Vec<Gradient> {
        let n = self.layers.len();
        let mut grads = Vec::with_capacity(n);
        let mut delta = d_out;
        for i in (0..n).rev() {
            let input = if i == 0 { inputs } else { &cache.post[i - 1] };
            grads.push(Gradient {
                weights: input.t().dot(&delta),
                bias: delta.sum_axis(Axis(0)),
            });
            if i > 0 {
                let upstream = delta.dot(&self.layers[i].weights.t());
                let deriv = self.layers[i - 1]
                    .activation
                    .derivative(&cache.pre[i - 1], &cache.post[i - 1]);
                delta = upstream * deriv;
            }
        }
        grads.reverse();
        grads
    }

    pub fn penalty(&self, reg: Regularization) -> f32 {
        let last = self.layers.len() - 1;
        let mut total = 0.0;
        for (i, layer) in self.layers.iter().enumerate() {
            total += reg.l2 * layer.weights.mapv(|w| w * w).sum();
            if i == 0 && reg.l1 > 0.0 {
                total += reg.l1 * row_norms(&layer.weights).sum();
            }
            if i != last {
                total += reg.l2 * layer.bias.mapv(|b| b * b).sum();
            }
        }
        total
    }

    pub fn add_penalty_gradients(&self, reg: Regularization, grads: &mut [Gradient]) {
        let last = self.layers.len() - 1;
        for (i, (layer, grad)) in self.layers.iter().zip(grads.iter_mut()).enumerate() {
            if reg.l2 > 0.0 {
                grad.weights.scaled_add(2.0 * reg.l2, &layer.weights);
                if i != last {
                    grad.bias.scaled_add(2.0 * reg.l2, &layer.bias);
                }
            }
            if i == 0 && reg.l1 > 0.0 {
                let norms = row_norms(&layer.weights);
                for ((mut g_row, w_row), &norm) in grad
                    .weights
                    .rows_mut()
                    .into_iter()
                    .zip(layer.weights.rows())
                    .zip(norms.iter())
                {
                    // subgradient 0 at the origin
                    if norm > 0.0 {
                        g_row.scaled_add(reg.l1 / norm, &w_row);
                    }
                }
            }
        }
    }

    /// L2 norm of each first-kernel row: how strongly each input gene feeds the network.
    pub fn gene_importance(&self) -> Array1<f32> {
        row_norms(&self.layers[0].weights)
    }

    /// Copy weights from every layer of `other` with the same name and shape.
    /// Returns the number of layers copied.
    pub fn transfer_from(&mut self, other: &Network) -> usize {
        let mut copied = 0;
        for layer in &mut self.layers {
            if let Some(src) = other
                .layers
                .iter()
                .find(|l| l.name == layer.name && l.weights.dim() == layer.weights.dim())
            {
                layer.weights.assign(&src.weights);
                layer.bias.assign(&src.bias);
                copied += 1;
            }
        }
        copied
    }

    /// A copy reading only the input genes in `keep`; the first kernel keeps
    /// the matching rows, every other layer is unchanged.
    pub fn prune_inputs(&self, keep: &[usize]) -> Network {
        let mut layers = self.layers.clone();
        layers[0].weights = self.layers[0].weights.select(Axis(0), keep);
        Network {
            architecture: self.architecture.with_inputs(keep.len()),
            layers,
        }
    }

    /// Layers whose flag is `false` are excluded from optimizer updates.
    /// Missing flags default to trainable.
    pub fn set_trainable(&mut self, flags: &[bool]) {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.trainable = flags.get(i).copied().unwrap_or(true);
        }
    }

    pub fn unfreeze_all(&mut self) {
        for layer in &mut self.layers {
            layer.trainable = true;
        }
    }

    pub fn is_finite(&self) -> bool {
        self.layers
            .iter()
            .all(|l| l.weights.iter().all(|w| w.is_finite()) && l.bias.iter().all(|b| b.is_finite()))
    }
}

fn row_norms(w: &Array2<f32>) -> Array1<f32> {
    w.map_axis(Axis(1), |row| row.dot(&row).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bottleneck::architecture::ArchitectureBuilder;
    use ndarray::array;
    use rand::SeedableRng;

    fn small_net(seed: u64) -> Network {
        let arch = ArchitectureBuilder::new(4, 2)
            .encoder(&[5])
            .bottleneck(2)
            .decoder(&[3])
            .activation(Activation::Tanh)
            .build()
            .unwrap();
        Network::new(&arch, &mut StdRng::seed_from_u64(seed))
    }

    fn loss(net: &Network, x: &Array2<f32>, y: &Array2<f32>, reg: Regularization) -> f32 {
        let diff = net.predict(x) - y;
        0.5 * diff.mapv(|d| d * d).sum() + net.penalty(reg)
    }

    #[test]
    fn latent_width_matches_bottleneck_for_any_batch() {
        let net = small_net(1);
        for n in [1usize, 7, 32] {
            let x = Array2::from_elem((n, 4), 0.3f32);
            assert_eq!(net.latent(&x).dim(), (n, 2));
            assert_eq!(net.predict(&x).dim(), (n, 2));
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let net = small_net(7);
        let reg = Regularization { l1: 0.05, l2: 0.01 };
        let x = array![[0.5f32, -1.0, 0.2, 0.0], [1.5, 0.3, -0.7, 0.9]];
        let y = array![[0.1f32, -0.2], [0.4, 0.8]];

        let cache = net.forward(&x);
        let d_out = cache.output() - &y;
        let mut grads = net.backward(&x, &cache, d_out);
        net.add_penalty_gradients(reg, &mut grads);

        let eps = 1e-3f32;
        for (layer_idx, (i, j)) in [(0usize, (1usize, 2usize)), (1, (3, 0)), (3, (2, 1))] {
            let mut plus = net.clone();
            plus.layers[layer_idx].weights[[i, j]] += eps;
            let mut minus = net.clone();
            minus.layers[layer_idx].weights[[i, j]] -= eps;
            let numeric = (loss(&plus, &x, &y, reg) - loss(&minus, &x, &y, reg)) / (2.0 * eps);
            let analytic = grads[layer_idx].weights[[i, j]];
            assert!(
                (numeric - analytic).abs() < 2e-2 * (1.0 + analytic.abs()),
                "layer {layer_idx} ({i},{j}): numeric {numeric} vs analytic {analytic}"
            );
        }
    }

    #[test]
    fn output_bias_is_not_penalized() {
        let mut net = small_net(3);
        let before = net.penalty(Regularization { l1: 0.0, l2: 1.0 });
        let last = net.layers.len() - 1;
        net.layers[last].bias.fill(10.0);
        let after = net.penalty(Regularization { l1: 0.0, l2: 1.0 });
        assert_eq!(before, after);
    }

    #[test]
    fn prune_keeps_selected_rows() {
        let net = small_net(5);
        let pruned = net.prune_inputs(&[3, 1]);
        assert_eq!(pruned.architecture().n_inputs(), 2);
        assert_eq!(pruned.layers()[0].weights.row(0), net.layers()[0].weights.row(3));
        assert_eq!(pruned.layers()[0].weights.row(1), net.layers()[0].weights.row(1));
        assert_eq!(pruned.layers()[1].weights, net.layers()[1].weights);
    }

    #[test]
    fn transfer_copies_matching_layers_only() {
        let src = small_net(11);
        let arch = ArchitectureBuilder::new(4, 6)
            .encoder(&[5])
            .bottleneck(2)
            .decoder(&[3])
            .activation(Activation::Tanh)
            .build()
            .unwrap();
        let mut dst = Network::new(&arch, &mut StdRng::seed_from_u64(99));
        let copied = dst.transfer_from(&src);
        // enc1, bottleneck, dec1 match; the output layer has a different width
        assert_eq!(copied, 3);
        assert_eq!(dst.layers()[0].weights, src.layers()[0].weights);
        assert_ne!(dst.layers()[3].weights.dim(), src.layers()[3].weights.dim());
    }
}
