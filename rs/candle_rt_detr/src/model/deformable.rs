//! Multi-Scale Deformable Attention
//!
//! Pure candle implementation of the deformable attention used by Deformable DETR
//! and RT-DETR. Instead of attending over every value token, each query attends
//! to `n_levels * n_points` learned sampling locations per head:
//!
//! 1. `value_proj` the flattened multi-level value sequence
//! 2. predict 2-D sampling offsets and attention logits from the query
//! 3. softmax the logits jointly over `(level, point)` per head
//! 4. place the offsets around the reference points (per-level normalization for
//!    `[.., 2]` points, half-box scaling for `[.., 4]` boxes)
//! 5. bilinearly sample every level at those locations (zero padding)
//! 6. weight, sum, concatenate heads, `output_proj`
//!
//! The bilinear kernel is a [`GridSampler`] chosen when the layer is built.

use std::sync::Arc;

use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::{Init, Linear, Module, VarBuilder, VarMap};

use crate::config::MsDeformableAttentionConfig;
use crate::error::{Error, Result};
use crate::model::grid_sample::{select_sampler, GridSampler};
use crate::model::init::{assign, reinit, reset_xavier_linear, xavier_linear, zero_linear};

/// Sampling locations and attention weights for one forward pass
#[derive(Debug, Clone)]
pub struct SamplingPlan {
    /// Normalized `(x, y)` locations: [N, Len_q, n_heads, n_levels, n_points, 2]
    pub locations: Tensor,
    /// Softmax weights, summing to 1 over `(level, point)`: [N, Len_q, n_heads, n_levels, n_points]
    pub attention_weights: Tensor,
}

/// Multi-Scale Deformable Attention Module
#[derive(Debug, Clone)]
pub struct MsDeformableAttention {
    /// Number of attention heads
    n_heads: usize,
    /// Number of feature levels
    n_levels: usize,
    /// Number of sampling points per head per level
    n_points: usize,
    /// Channels per head of the projected value
    head_dim: usize,

    /// Linear layer for sampling offsets
    sampling_offsets: Linear,
    /// Linear layer for attention weights
    attention_weights: Linear,
    /// Linear layer for value projection
    value_proj: Linear,
    /// Linear layer for output projection
    output_proj: Linear,

    sampler: Arc<dyn GridSampler>,
}

impl MsDeformableAttention {
    /// Load the layer from a checkpoint-backed `vb`; every parameter is read as
    /// stored. Use [`Self::new`] for a freshly initialized layer.
    pub fn load(config: &MsDeformableAttentionConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let d_model = config.d_model;
        let samples = config.n_heads * config.samples_per_head();
        let value_dim = config.value_dim();

        let sampling_offsets = zero_linear(d_model, samples * 2, vb.pp("sampling_offsets"))?;
        let attention_weights = zero_linear(d_model, samples, vb.pp("attention_weights"))?;
        let value_proj = xavier_linear(d_model, value_dim, vb.pp("value_proj"))?;
        let output_proj = xavier_linear(value_dim, d_model, vb.pp("output_proj"))?;

        let sampler = select_sampler(config.sampler, vb.device());

        tracing::debug!(
            d_model,
            n_heads = config.n_heads,
            n_levels = config.n_levels,
            n_points = config.n_points,
            value_dim,
            sampler = sampler.name(),
            "built multi-scale deformable attention"
        );
        Ok(Self {
            n_heads: config.n_heads,
            n_levels: config.n_levels,
            n_points: config.n_points,
            head_dim: value_dim / config.n_heads,
            sampling_offsets,
            attention_weights,
            value_proj,
            output_proj,
            sampler,
        })
    }

    /// Build a freshly initialized layer whose parameters live in `varmap`:
    /// Xavier-uniform projections, zero attention-weight layer, zero offset
    /// weight and the geometric offset bias pattern.
    ///
    /// `vb` must be a builder over `varmap` (any prefix).
    pub fn new(
        config: &MsDeformableAttentionConfig,
        varmap: &VarMap,
        vb: VarBuilder,
    ) -> Result<Self> {
        let attn = Self::load(config, vb)?;
        attn.seed_sampling_offsets(varmap)?;
        Ok(attn)
    }

    /// Re-apply the full init policy to parameters stored in `varmap`
    pub fn reset_parameters(&self, varmap: &VarMap) -> Result<()> {
        reinit(varmap, self.sampling_offsets.weight(), Init::Const(0.0))?;
        self.seed_sampling_offsets(varmap)?;

        reinit(varmap, self.attention_weights.weight(), Init::Const(0.0))?;
        if let Some(bias) = self.attention_weights.bias() {
            reinit(varmap, bias, Init::Const(0.0))?;
        }

        reset_xavier_linear(varmap, &self.value_proj)?;
        reset_xavier_linear(varmap, &self.output_proj)?;
        Ok(())
    }

    fn seed_sampling_offsets(&self, varmap: &VarMap) -> Result<()> {
        let bias = self
            .sampling_offsets
            .bias()
            .ok_or(Error::UnknownParameter)?;
        let pattern =
            sampling_offsets_bias(self.n_heads, self.n_levels, self.n_points, bias.device())?;
        assign(varmap, bias, &pattern)
    }

    /// Name of the bilinear sampling backend
    pub fn sampler_name(&self) -> &'static str {
        self.sampler.name()
    }

    /// Compute sampling locations and attention weights for `query`
    ///
    /// # Arguments
    /// * `query` - Query tensor [N, Len_q, d_model]
    /// * `reference_points` - [N, Len_q, n_levels, 2] or [N, Len_q, n_levels, 4]
    /// * `spatial_shapes` - Spatial shapes [(H, W), ...] per level
    pub fn sampling_plan(
        &self,
        query: &Tensor,
        reference_points: &Tensor,
        spatial_shapes: &[(usize, usize)],
    ) -> Result<SamplingPlan> {
        let (n, len_q, _) = query.dims3()?;
        let (n_heads, n_levels, n_points) = (self.n_heads, self.n_levels, self.n_points);

        // [N, Len_q, n_heads, n_levels, n_points, 2]
        let sampling_offsets = self
            .sampling_offsets
            .forward(query)?
            .reshape((n, len_q, n_heads, n_levels, n_points, 2))?;

        // Softmax over the joint (level, point) axis of each head
        let attention_weights = self
            .attention_weights
            .forward(query)?
            .reshape((n, len_q, n_heads, n_levels * n_points))?;
        let attention_weights = candle_nn::ops::softmax_last_dim(&attention_weights)?
            .reshape((n, len_q, n_heads, n_levels, n_points))?;

        let locations = sampling_locations(reference_points, &sampling_offsets, spatial_shapes)?;

        Ok(SamplingPlan {
            locations,
            attention_weights,
        })
    }

    /// Forward pass for multi-scale deformable attention
    ///
    /// # Arguments
    /// * `query` - Query tensor [N, Len_q, d_model]
    /// * `reference_points` - [N, Len_q, n_levels, 2] or [N, Len_q, n_levels, 4], normalized to [0, 1]
    /// * `value` - Flattened multi-level features [N, sum(H*W), d_model]
    /// * `value_spatial_shapes` - Spatial shapes [(H, W), ...] per level
    /// * `value_level_start_index` - Start of each level in `value`, [0, H0*W0, ...]
    /// * `value_mask` - Optional [N, sum(H*W)] mask (bool/u8 or float) multiplied into the projected value
    ///
    /// # Returns
    /// Output tensor [N, Len_q, d_model]
    pub fn forward(
        &self,
        query: &Tensor,
        reference_points: &Tensor,
        value: &Tensor,
        value_spatial_shapes: &[(usize, usize)],
        value_level_start_index: &[usize],
        value_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (n, len_q, _) = query.dims3()?;
        let (_, len_v, _) = value.dims3()?;
        self.check_levels(value_spatial_shapes, value_level_start_index, len_v)?;

        let value = self.value_proj.forward(value)?;
        let value = match value_mask {
            Some(mask) => {
                let mask = mask.to_dtype(value.dtype())?.unsqueeze(D::Minus1)?;
                value.broadcast_mul(&mask)?
            }
            None => value,
        };
        // [N, Len_v, n_heads, head_dim]
        let value = value.reshape((n, len_v, self.n_heads, self.head_dim))?;

        let plan = self.sampling_plan(query, reference_points, value_spatial_shapes)?;

        tracing::trace!(
            n,
            len_q,
            len_v,
            sampler = self.sampler.name(),
            "deformable attention core"
        );
        let output = ms_deform_attn_core(
            self.sampler.as_ref(),
            &value,
            value_spatial_shapes,
            value_level_start_index,
            &plan.locations,
            &plan.attention_weights,
        )?;

        Ok(self.output_proj.forward(&output)?)
    }

    fn check_levels(
        &self,
        spatial_shapes: &[(usize, usize)],
        level_start: &[usize],
        len_v: usize,
    ) -> Result<()> {
        if spatial_shapes.len() != self.n_levels {
            return Err(Error::LevelCount {
                expected: self.n_levels,
                actual: spatial_shapes.len(),
            });
        }
        if let Some((h, w)) = spatial_shapes.iter().find(|(h, w)| *h == 0 || *w == 0) {
            return Err(Error::InvalidConfig(format!(
                "empty feature level {}x{}",
                h, w
            )));
        }
        check_level_start_index(spatial_shapes, level_start)?;

        let total_hw: usize = spatial_shapes.iter().map(|(h, w)| h * w).sum();
        if total_hw != len_v {
            return Err(Error::ValueLength {
                expected: total_hw,
                actual: len_v,
            });
        }
        Ok(())
    }
}

/// Initial bias of the sampling-offset layer, flattened as
/// `[n_heads, n_levels, n_points, 2]`.
///
/// Head `h` points along angle `2 * pi * h / n_heads`, scaled so the larger
/// component is 1; point `i` of every level sits at radius `i + 1`.
pub fn sampling_offsets_bias(
    n_heads: usize,
    n_levels: usize,
    n_points: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let step = 2.0 * std::f32::consts::PI / n_heads as f32;
    let mut grid = Vec::with_capacity(n_heads * n_levels * n_points * 2);
    for head in 0..n_heads {
        let theta = head as f32 * step;
        let (x, y) = (theta.cos(), theta.sin());
        let norm = x.abs().max(y.abs());
        let (x, y) = (x / norm, y / norm);
        for _level in 0..n_levels {
            for point in 0..n_points {
                let radius = (point + 1) as f32;
                grid.push(x * radius);
                grid.push(y * radius);
            }
        }
    }
    Tensor::from_vec(grid, n_heads * n_levels * n_points * 2, device)
}

/// Start offset of every level in the flattened value sequence
pub fn level_start_index(spatial_shapes: &[(usize, usize)]) -> Vec<usize> {
    spatial_shapes
        .iter()
        .scan(0usize, |start, &(h, w)| {
            let current = *start;
            *start += h * w;
            Some(current)
        })
        .collect()
}

/// Reject a level start index that disagrees with the spatial shapes
pub fn check_level_start_index(
    spatial_shapes: &[(usize, usize)],
    level_start: &[usize],
) -> Result<()> {
    let expected = level_start_index(spatial_shapes);
    if expected != level_start {
        return Err(Error::LevelStartIndex {
            expected,
            actual: level_start.to_vec(),
        });
    }
    Ok(())
}

/// Place sampling offsets around reference points
///
/// # Arguments
/// * `reference_points` - [N, Len_q, n_levels, 2] points or [N, Len_q, n_levels, 4] boxes (cx, cy, w, h)
/// * `sampling_offsets` - [N, Len_q, n_heads, n_levels, n_points, 2]
/// * `spatial_shapes` - [(H, W), ...], used to normalize offsets for point references
///
/// # Returns
/// Sampling locations [N, Len_q, n_heads, n_levels, n_points, 2]
pub fn sampling_locations(
    reference_points: &Tensor,
    sampling_offsets: &Tensor,
    spatial_shapes: &[(usize, usize)],
) -> Result<Tensor> {
    let offset_dims = sampling_offsets.dims();
    if offset_dims.len() != 6 || offset_dims[5] != 2 {
        return Err(candle_core::Error::Msg(format!(
            "sampling offsets must be [N, Len_q, n_heads, n_levels, n_points, 2], got {:?}",
            offset_dims
        ))
        .into());
    }
    let (n_levels, n_points) = (offset_dims[3], offset_dims[4]);

    let ref_last_dim = reference_points.dim(D::Minus1)?;
    if ref_last_dim != 2 && ref_last_dim != 4 {
        return Err(Error::ReferencePointsDim(ref_last_dim));
    }
    if reference_points.rank() != 4 {
        return Err(candle_core::Error::Msg(format!(
            "reference_points must be [N, Len_q, n_levels, {}], got {:?}",
            ref_last_dim,
            reference_points.dims()
        ))
        .into());
    }

    if ref_last_dim == 2 {
        if spatial_shapes.len() != n_levels {
            return Err(Error::LevelCount {
                expected: n_levels,
                actual: spatial_shapes.len(),
            });
        }
        // Offsets are (x, y), so normalize by (W, H)
        let offset_normalizer: Vec<f32> = spatial_shapes
            .iter()
            .flat_map(|&(h, w)| [w as f32, h as f32])
            .collect();
        let offset_normalizer = Tensor::from_vec(
            offset_normalizer,
            (1, 1, 1, n_levels, 1, 2),
            sampling_offsets.device(),
        )?
        .to_dtype(sampling_offsets.dtype())?;

        // [N, Len_q, 1, n_levels, 1, 2]
        let ref_pts = reference_points.unsqueeze(2)?.unsqueeze(4)?;
        let normalized_offsets = sampling_offsets.broadcast_div(&offset_normalizer)?;
        Ok(ref_pts.broadcast_add(&normalized_offsets)?)
    } else {
        // location = ref_xy + offset / n_points * ref_wh * 0.5
        let ref_xy = reference_points
            .narrow(D::Minus1, 0, 2)?
            .unsqueeze(2)?
            .unsqueeze(4)?;
        let ref_wh = reference_points
            .narrow(D::Minus1, 2, 2)?
            .unsqueeze(2)?
            .unsqueeze(4)?;
        let scaled = ((sampling_offsets / n_points as f64)?.broadcast_mul(&ref_wh)? * 0.5)?;
        Ok(ref_xy.broadcast_add(&scaled)?)
    }
}

/// Core computation for multi-scale deformable attention
///
/// # Arguments
/// * `value` - Value tensor [N, Len_v, n_heads, head_dim]
/// * `spatial_shapes` - [(H, W), ...] for each level
/// * `level_start_index` - [0, H0*W0, H0*W0+H1*W1, ...]
/// * `sampling_locations` - [N, Len_q, n_heads, n_levels, n_points, 2]
/// * `attention_weights` - [N, Len_q, n_heads, n_levels, n_points]
///
/// # Returns
/// [N, Len_q, n_heads * head_dim]
fn ms_deform_attn_core(
    sampler: &dyn GridSampler,
    value: &Tensor,
    spatial_shapes: &[(usize, usize)],
    level_start_index: &[usize],
    sampling_locations: &Tensor,
    attention_weights: &Tensor,
) -> candle_core::Result<Tensor> {
    let (n, _, n_heads, head_dim) = value.dims4()?;
    let dims = sampling_locations.dims();
    let (len_q, n_levels, n_points) = (dims[1], dims[3], dims[4]);

    // [N, n_heads, head_dim, Len_v]
    let value = value.permute((0, 2, 3, 1))?;

    // Locations are in [0, 1], the samplers expect [-1, 1]
    let sampling_grids = ((sampling_locations * 2.0)? - 1.0)?;

    let mut sampling_value_list = Vec::with_capacity(n_levels);
    for (lid, (&(h, w), &start)) in spatial_shapes.iter().zip(level_start_index).enumerate() {
        // [N, n_heads, head_dim, H*W] -> [N*n_heads, head_dim, H, W]
        let value_l = value
            .narrow(3, start, h * w)?
            .reshape((n * n_heads, head_dim, h, w))?;

        // [N, Len_q, n_heads, n_points, 2] -> [N*n_heads, Len_q, n_points, 2]
        let sampling_grid_l = sampling_grids
            .i((.., .., .., lid, .., ..))?
            .transpose(1, 2)?
            .reshape((n * n_heads, len_q, n_points, 2))?;

        // [N*n_heads, head_dim, Len_q, n_points]
        sampling_value_list.push(sampler.sample(&value_l, &sampling_grid_l)?);
    }

    // [N*n_heads, head_dim, Len_q, n_levels, n_points] -> [.., n_levels * n_points]
    let sampling_values = Tensor::stack(&sampling_value_list, 3)?.reshape((
        n * n_heads,
        head_dim,
        len_q,
        n_levels * n_points,
    ))?;

    // [N, Len_q, n_heads, n_levels, n_points] -> [N*n_heads, 1, Len_q, n_levels * n_points]
    let attention_weights = attention_weights.transpose(1, 2)?.reshape((
        n * n_heads,
        1,
        len_q,
        n_levels * n_points,
    ))?;

    // Weighted sum: [N*n_heads, head_dim, Len_q]
    let output = sampling_values
        .broadcast_mul(&attention_weights)?
        .sum(D::Minus1)?;

    // [N, n_heads * head_dim, Len_q] -> [N, Len_q, n_heads * head_dim]
    output.reshape((n, n_heads * head_dim, len_q))?.transpose(1, 2)
}
