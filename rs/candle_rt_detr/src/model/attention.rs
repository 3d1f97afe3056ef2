//! Multi-head scaled dot-product attention.

use candle_core::{Result, Tensor, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use crate::config::MultiHeadAttentionConfig;
use crate::model::init::{reset_xavier_linear, xavier_linear};

/// Multi-head Attention
///
/// Separate query/key/value/output projections, each Xavier-uniform with zero
/// bias when freshly initialized. Key and value may be longer or shorter than
/// the query.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    d_model: usize,
    num_heads: usize,
    head_dim: usize,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(config: &MultiHeadAttentionConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;
        let d_model = config.d_model;

        let q_proj = xavier_linear(d_model, d_model, vb.pp("q_proj"))?;
        let k_proj = xavier_linear(d_model, d_model, vb.pp("k_proj"))?;
        let v_proj = xavier_linear(d_model, d_model, vb.pp("v_proj"))?;
        let out_proj = xavier_linear(d_model, d_model, vb.pp("out_proj"))?;

        tracing::debug!(
            d_model,
            nhead = config.nhead,
            dropout = config.dropout,
            "built multi-head attention"
        );
        Ok(Self {
            d_model,
            num_heads: config.nhead,
            head_dim: config.head_dim(),
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            dropout: Dropout::new(config.dropout),
        })
    }

    /// Re-apply the init policy (Xavier-uniform weights, zero biases).
    ///
    /// The module must have been built from a builder over `varmap`.
    pub fn reset_parameters(&self, varmap: &candle_nn::VarMap) -> crate::Result<()> {
        for proj in [&self.q_proj, &self.k_proj, &self.v_proj, &self.out_proj] {
            reset_xavier_linear(varmap, proj)?;
        }
        Ok(())
    }

    /// Inference-mode forward pass
    ///
    /// # Arguments
    /// * `query` - Query tensor [batch_size, len_q, d_model]
    /// * `key` - Key tensor [batch_size, len_k, d_model]
    /// * `value` - Value tensor [batch_size, len_k, d_model]
    /// * `attn_mask` - Optional additive mask broadcastable to [batch_size, heads, len_q, len_k]
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.forward_t(query, key, value, attn_mask, false)
    }

    /// Forward pass with dropout on the attention weights when `train` is set
    pub fn forward_t(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (output, _) = self.attend(query, key, value, attn_mask, train)?;
        Ok(output)
    }

    /// Inference-mode forward pass that also returns the attention weights
    /// [batch_size, heads, len_q, len_k]
    pub fn forward_with_weights(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        self.attend(query, key, value, attn_mask, false)
    }

    /// [batch, seq, d_model] -> [batch, heads, seq, head_dim]
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        x.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn attend(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (batch_size, len_q, _) = query.dims3()?;

        let q = self.split_heads(&self.q_proj.forward(query)?)?;
        let k = self.split_heads(&self.k_proj.forward(key)?)?;
        let v = self.split_heads(&self.v_proj.forward(value)?)?;

        // Scaled dot-product attention
        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let scores = (q.matmul(&k_t)? / scale)?;
        let scores = match attn_mask {
            Some(mask) => scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?,
            None => scores,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&scores.contiguous()?)?;
        let dropped = self.dropout.forward(&attn_weights, train)?;
        let attn_output = dropped.matmul(&v)?;

        // Reshape back: [batch, heads, len_q, head_dim] -> [batch, len_q, d_model]
        let attn_output = attn_output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, len_q, self.d_model))?;

        let output = self.out_proj.forward(&attn_output)?;
        Ok((output, attn_weights))
    }
}
