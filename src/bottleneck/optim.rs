// Adam optimizer state for a Network. A fresh instance is created for every
// training phase, so a learning-rate change also resets the moment estimates.

use ndarray::{Array1, Array2, Zip};

use super::network::{Gradient, Network};

pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: i32,
    m_w: Vec<Array2<f32>>,
    v_w: Vec<Array2<f32>>,
    m_b: Vec<Array1<f32>>,
    v_b: Vec<Array1<f32>>,
}

impl Adam {
    pub fn new(net: &Network, lr: f32) -> Self {
        let m_w: Vec<_> = net.layers().iter().map(|l| Array2::zeros(l.weights.raw_dim())).collect();
        let m_b: Vec<_> = net.layers().iter().map(|l| Array1::zeros(l.bias.raw_dim())).collect();
        Adam {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            t: 0,
            v_w: m_w.clone(),
            v_b: m_b.clone(),
            m_w,
            m_b,
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.lr
    }

    /// One update of every trainable layer.
    pub fn step(&mut self, net: &mut Network, grads: &[Gradient]) {
        self.t += 1;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        let lr_t = self.lr * (1.0 - b2.powi(self.t)).sqrt() / (1.0 - b1.powi(self.t));

        for (i, (layer, grad)) in net.layers_mut().iter_mut().zip(grads).enumerate() {
            if !layer.trainable {
                continue;
            }
            Zip::from(&mut layer.weights)
                .and(&mut self.m_w[i])
                .and(&mut self.v_w[i])
                .and(&grad.weights)
                .for_each(|w, m, v, &g| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *w -= lr_t * *m / (v.sqrt() + eps);
                });
            Zip::from(&mut layer.bias)
                .and(&mut self.m_b[i])
                .and(&mut self.v_b[i])
                .and(&grad.bias)
                .for_each(|b, m, v, &g| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *b -= lr_t * *m / (v.sqrt() + eps);
                });
        }
    }
}
