// Layer layout of a bottleneck network.
//
// An [`Architecture`] is a plain description: input width plus an ordered list
// of [`LayerSpec`]s. It is produced once by [`ArchitectureBuilder::build`] and
// never mutated; training consumes it to allocate weights.

use serde::{Deserialize, Serialize};

use super::activation::Activation;
use crate::error::FitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerRole {
    Encoder,
    Bottleneck,
    Decoder,
    Output,
}

/// What the last layer predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Head {
    /// Linear output, one unit per target variable.
    Regression,
    /// Softmax output, one unit per cell-type class.
    Classification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub width: usize,
    pub activation: Activation,
    pub role: LayerRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    n_inputs: usize,
    layers: Vec<LayerSpec>,
    head: Head,
}

impl Architecture {
    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.layers.last().map_or(0, |l| l.width)
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    pub fn head(&self) -> Head {
        self.head
    }

    /// Index of the bottleneck layer in [`Architecture::layers`].
    pub fn bottleneck_index(&self) -> usize {
        self.layers
            .iter()
            .position(|l| l.role == LayerRole::Bottleneck)
            .unwrap_or(0)
    }

    pub fn bottleneck_width(&self) -> usize {
        self.layers[self.bottleneck_index()].width
    }

    /// Same layout reading a different number of input genes.
    pub fn with_inputs(&self, n_inputs: usize) -> Architecture {
        Architecture {
            n_inputs,
            layers: self.layers.clone(),
            head: self.head,
        }
    }
}

/// Builds an [`Architecture`] from explicit width lists.
///
/// ```
/// use ephys_bottleneck::bottleneck::{Activation, ArchitectureBuilder};
///
/// let arch = ArchitectureBuilder::new(1000, 5)
///     .encoder(&[512, 128])
///     .bottleneck(2)
///     .decoder(&[128, 512])
///     .activation(Activation::Relu)
///     .build()
///     .unwrap();
/// assert_eq!(arch.layers().len(), 6);
/// assert_eq!(arch.bottleneck_width(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct ArchitectureBuilder {
    n_inputs: usize,
    n_outputs: usize,
    encoder: Vec<usize>,
    bottleneck: usize,
    decoder: Vec<usize>,
    activation: Activation,
    head: Head,
}

impl ArchitectureBuilder {
    pub fn new(n_inputs: usize, n_outputs: usize) -> Self {
        Self {
            n_inputs,
            n_outputs,
            encoder: vec![512, 128],
            bottleneck: 2,
            decoder: vec![128, 512],
            activation: Activation::Relu,
            head: Head::Regression,
        }
    }

    pub fn encoder(mut self, widths: &[usize]) -> Self {
        self.encoder = widths.to_vec();
        self
    }

    pub fn bottleneck(mut self, width: usize) -> Self {
        self.bottleneck = width;
        self
    }

    pub fn decoder(mut self, widths: &[usize]) -> Self {
        self.decoder = widths.to_vec();
        self
    }

    /// Activation of the encoder and decoder layers. The bottleneck stays linear.
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn head(mut self, head: Head) -> Self {
        self.head = head;
        self
    }

    pub fn build(self) -> Result<Architecture, FitError> {
        if self.n_inputs == 0 {
            return Err(invalid("n_inputs", 0, "must be positive"));
        }
        if self.n_outputs == 0 {
            return Err(invalid("n_outputs", 0, "must be positive"));
        }
        if self.bottleneck == 0 {
            return Err(invalid("bottleneck", 0, "must be positive"));
        }
        if self.activation == Activation::Softmax {
            return Err(FitError::InvalidHyperparameter {
                name: "activation",
                value: "softmax".to_string(),
                constraint: "softmax is reserved for the classification head",
            });
        }
        if let Some(&w) = self.encoder.iter().chain(self.decoder.iter()).find(|&&w| w == 0) {
            return Err(invalid("hidden width", w, "must be positive"));
        }

        let mut layers = Vec::with_capacity(self.encoder.len() + self.decoder.len() + 2);
        for (i, &width) in self.encoder.iter().enumerate() {
            layers.push(LayerSpec {
                name: format!("enc{}", i + 1),
                width,
                activation: self.activation,
                role: LayerRole::Encoder,
            });
        }
        layers.push(LayerSpec {
            name: "bottleneck".to_string(),
            width: self.bottleneck,
            activation: Activation::Linear,
            role: LayerRole::Bottleneck,
        });
        for (i, &width) in self.decoder.iter().enumerate() {
            layers.push(LayerSpec {
                name: format!("dec{}", i + 1),
                width,
                activation: self.activation,
                role: LayerRole::Decoder,
            });
        }
        let (name, activation) = match self.head {
            Head::Regression => ("regression", Activation::Linear),
            Head::Classification => ("classification", Activation::Softmax),
        };
        layers.push(LayerSpec {
            name: name.to_string(),
            width: self.n_outputs,
            activation,
            role: LayerRole::Output,
        });

        Ok(Architecture {
            n_inputs: self.n_inputs,
            layers,
            head: self.head,
        })
    }
}

fn invalid(name: &'static str, value: usize, constraint: &'static str) -> FitError {
    FitError::InvalidHyperparameter {
        name,
        value: value.to_string(),
        constraint,
    }
}
