//! Error types for the RT-DETR layers.

use thiserror::Error;

/// Errors produced while building or running the transformer layers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("d_model ({d_model}) must be divisible by the number of heads ({heads})")]
    HeadsNotDivisible { d_model: usize, heads: usize },

    #[error("projected value width {value_dim} (ratio {ratio}) must be a non-zero multiple of n_heads ({heads})")]
    ValueDimNotDivisible {
        value_dim: usize,
        ratio: f64,
        heads: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("position embedding dimension must be even, got {0}")]
    OddEmbeddingDim(usize),

    #[error("reference_points last dim must be 2 or 4, got {0}")]
    ReferencePointsDim(usize),

    #[error("expected {expected} feature levels, got {actual}")]
    LevelCount { expected: usize, actual: usize },

    #[error("level_start_index {actual:?} is inconsistent with spatial shapes (expected {expected:?})")]
    LevelStartIndex {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("spatial shapes cover {expected} value tokens, value has {actual}")]
    ValueLength { expected: usize, actual: usize },

    #[error("sequence length {seq_len} exceeds position table length {max_len}")]
    SequenceTooLong { seq_len: usize, max_len: usize },

    #[error("parameter is not backed by the given VarMap")]
    UnknownParameter,

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
