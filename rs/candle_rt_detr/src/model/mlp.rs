//! Multi-Layer Perceptron used by the box and class heads.

use candle_core::{Result, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::config::MlpConfig;

/// Multi-Layer Perceptron (MLP / FFN)
///
/// A simple feed-forward network with ReLU activations between layers.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    /// Build the MLP; sub-layers are read from `layers.{i}`
    pub fn new(config: &MlpConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;
        let num_layers = config.num_layers;
        let mut layers = Vec::with_capacity(num_layers);

        for i in 0..num_layers {
            let in_dim = if i == 0 {
                config.input_dim
            } else {
                config.hidden_dim
            };
            let out_dim = if i == num_layers - 1 {
                config.output_dim
            } else {
                config.hidden_dim
            };
            let layer = linear(in_dim, out_dim, vb.pp(format!("layers.{}", i)))?;
            layers.push(layer);
        }

        tracing::debug!(
            input_dim = config.input_dim,
            hidden_dim = config.hidden_dim,
            output_dim = config.output_dim,
            num_layers,
            "built mlp"
        );
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut output = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            output = layer.forward(&output)?;
            if i < self.layers.len() - 1 {
                output = output.relu()?;
            }
        }
        Ok(output)
    }
}
