//! RT-DETR Layer Configuration
//!
//! Configuration structures for the transformer building blocks. Every config
//! deserializes from JSON with missing fields falling back to the RT-DETR
//! defaults, and every config validates itself before a layer is built.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bilinear sampling backend used by the deformable attention core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    /// Gather kernel, so training works on every device
    #[default]
    Auto,
    /// Pure tensor-op kernel, differentiable, runs on any device
    Gather,
    /// Direct CPU kernel over f32 slices for inference. Records no gradient.
    Scalar,
}

/// Configuration for [`crate::model::mlp::Mlp`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub output_dim: usize,
    /// Number of linear layers, at least 1
    pub num_layers: usize,
}

impl Default for MlpConfig {
    /// Box regression head: 3 layers, 256 -> 4
    fn default() -> Self {
        Self {
            input_dim: 256,
            hidden_dim: 256,
            output_dim: 4,
            num_layers: 3,
        }
    }
}

impl MlpConfig {
    pub fn new(input_dim: usize, hidden_dim: usize, output_dim: usize, num_layers: usize) -> Self {
        Self {
            input_dim,
            hidden_dim,
            output_dim,
            num_layers,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            return Err(Error::InvalidConfig(
                "mlp num_layers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for [`crate::model::attention::MultiHeadAttention`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiHeadAttentionConfig {
    pub d_model: usize,
    pub nhead: usize,
    /// Dropout probability applied to the attention weights in training mode
    pub dropout: f32,
}

impl Default for MultiHeadAttentionConfig {
    fn default() -> Self {
        Self {
            d_model: 256,
            nhead: 8,
            dropout: 0.0,
        }
    }
}

impl MultiHeadAttentionConfig {
    pub fn new(d_model: usize, nhead: usize) -> Self {
        Self {
            d_model,
            nhead,
            ..Default::default()
        }
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.nhead
    }

    pub fn validate(&self) -> Result<()> {
        if self.nhead == 0 || self.d_model % self.nhead != 0 {
            return Err(Error::HeadsNotDivisible {
                d_model: self.d_model,
                heads: self.nhead,
            });
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Configuration for [`crate::model::deformable::MsDeformableAttention`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsDeformableAttentionConfig {
    /// Hidden dimension
    pub d_model: usize,
    /// Number of attention heads
    pub n_heads: usize,
    /// Number of feature levels
    pub n_levels: usize,
    /// Number of sampling points per head per level
    pub n_points: usize,
    /// Width of the value projection relative to `d_model`
    pub ratio: f64,
    /// Bilinear sampling backend
    pub sampler: SamplerKind,
}

impl Default for MsDeformableAttentionConfig {
    fn default() -> Self {
        Self {
            d_model: 256,
            n_heads: 8,
            n_levels: 4,
            n_points: 4,
            ratio: 1.0,
            sampler: SamplerKind::Auto,
        }
    }
}

impl MsDeformableAttentionConfig {
    pub fn new(d_model: usize, n_heads: usize, n_levels: usize, n_points: usize) -> Self {
        Self {
            d_model,
            n_heads,
            n_levels,
            n_points,
            ..Default::default()
        }
    }

    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.ratio = ratio;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerKind) -> Self {
        self.sampler = sampler;
        self
    }

    /// Width of the projected value sequence, `floor(d_model * ratio)`
    pub fn value_dim(&self) -> usize {
        (self.d_model as f64 * self.ratio) as usize
    }

    /// Number of `(level, point)` samples per head
    pub fn samples_per_head(&self) -> usize {
        self.n_levels * self.n_points
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(Error::HeadsNotDivisible {
                d_model: self.d_model,
                heads: self.n_heads,
            });
        }
        let value_dim = self.value_dim();
        if value_dim == 0 || value_dim % self.n_heads != 0 {
            return Err(Error::ValueDimNotDivisible {
                value_dim,
                ratio: self.ratio,
                heads: self.n_heads,
            });
        }
        if self.n_levels == 0 || self.n_points == 0 {
            return Err(Error::InvalidConfig(format!(
                "n_levels and n_points must be at least 1, got {} and {}",
                self.n_levels, self.n_points
            )));
        }
        Ok(())
    }
}

/// Configuration for [`crate::model::pos_enc::PositionEmbedding`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionEmbeddingConfig {
    pub d_model: usize,
    /// Number of precomputed positions
    pub max_len: usize,
}

impl Default for PositionEmbeddingConfig {
    fn default() -> Self {
        Self {
            d_model: 256,
            max_len: 5000,
        }
    }
}

impl PositionEmbeddingConfig {
    pub fn new(d_model: usize, max_len: usize) -> Self {
        Self { d_model, max_len }
    }

    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 || self.d_model % 2 != 0 {
            return Err(Error::OddEmbeddingDim(self.d_model));
        }
        Ok(())
    }
}

/// Configuration for the full set of layers, as used by the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayersConfig {
    /// Decoder self-attention
    pub self_attn: MultiHeadAttentionConfig,
    /// Decoder cross-attention over the multi-scale memory
    pub cross_attn: MsDeformableAttentionConfig,
    /// Box regression head
    pub bbox_head: MlpConfig,
    /// Query position embedding
    pub position: PositionEmbeddingConfig,
}

impl Default for LayersConfig {
    fn default() -> Self {
        Self::rt_detr()
    }
}

impl LayersConfig {
    /// RT-DETR decoder: 256 hidden, 8 heads, 3 feature levels, 4 points
    pub fn rt_detr() -> Self {
        Self {
            self_attn: MultiHeadAttentionConfig::new(256, 8),
            cross_attn: MsDeformableAttentionConfig::new(256, 8, 3, 4),
            bbox_head: MlpConfig::new(256, 256, 4, 3),
            position: PositionEmbeddingConfig::new(256, 5000),
        }
    }

    /// Small configuration for smoke tests
    pub fn tiny() -> Self {
        Self {
            self_attn: MultiHeadAttentionConfig::new(32, 4),
            cross_attn: MsDeformableAttentionConfig::new(32, 4, 2, 2),
            bbox_head: MlpConfig::new(32, 32, 4, 3),
            position: PositionEmbeddingConfig::new(32, 512),
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Hidden dimension shared by all layers
    pub fn hidden_dim(&self) -> usize {
        self.cross_attn.d_model
    }

    pub fn validate(&self) -> Result<()> {
        self.self_attn.validate()?;
        self.cross_attn.validate()?;
        self.bbox_head.validate()?;
        self.position.validate()?;
        let d_model = self.hidden_dim();
        if self.self_attn.d_model != d_model
            || self.bbox_head.input_dim != d_model
            || self.position.d_model != d_model
        {
            return Err(Error::InvalidConfig(format!(
                "all layers must share d_model {}",
                d_model
            )));
        }
        Ok(())
    }
}
