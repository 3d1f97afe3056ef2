//! RT-DETR transformer building blocks with Candle
//!
//! Multi-head attention, multi-scale deformable attention, the box-head MLP and
//! a sinusoidal position embedding, built on `candle_nn::VarBuilder` so the same
//! code runs on freshly initialized `VarMap`s and on exported checkpoints.

pub mod config;
pub mod debug;
pub mod error;
pub mod model;

pub use config::{
    LayersConfig, MlpConfig, MsDeformableAttentionConfig, MultiHeadAttentionConfig,
    PositionEmbeddingConfig, SamplerKind,
};
pub use error::{Error, Result};
pub use model::{Mlp, MsDeformableAttention, MultiHeadAttention, PositionEmbedding};
