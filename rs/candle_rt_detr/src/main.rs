//! RT-DETR decoder layers with Candle
//!
//! This binary builds the decoder building blocks on freshly initialized
//! weights and runs them on deterministic inputs, reporting shapes, timings
//! and output statistics.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder, VarMap};
use clap::{Parser, ValueEnum};

use candle_rt_detr::debug::TensorStats;
use candle_rt_detr::model::level_start_index;
use candle_rt_detr::{
    LayersConfig, Mlp, MsDeformableAttention, MultiHeadAttention, PositionEmbedding, SamplerKind,
};

/// Select the compute device
pub fn device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!(
                "Running on CPU, to run on GPU(metal), build this binary with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("Running on CPU, to run on GPU, build this binary with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Layer configuration presets
#[derive(Clone, Copy, ValueEnum, Debug)]
enum Preset {
    RtDetr,
    Tiny,
}

impl Preset {
    fn config(&self) -> LayersConfig {
        match self {
            Preset::RtDetr => LayersConfig::rt_detr(),
            Preset::Tiny => LayersConfig::tiny(),
        }
    }
}

/// Bilinear sampling backend for the deformable attention
#[derive(Clone, Copy, ValueEnum, Debug)]
enum SamplerArg {
    Auto,
    Gather,
    Scalar,
}

impl From<SamplerArg> for SamplerKind {
    fn from(arg: SamplerArg) -> Self {
        match arg {
            SamplerArg::Auto => SamplerKind::Auto,
            SamplerArg::Gather => SamplerKind::Gather,
            SamplerArg::Scalar => SamplerKind::Scalar,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Which layer preset to use.
    #[arg(long, value_enum, default_value_t = Preset::RtDetr)]
    preset: Preset,

    /// JSON layer configuration, overrides the preset.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    /// Number of decoder queries.
    #[arg(long, default_value_t = 300)]
    num_queries: usize,

    /// Sampling backend, overrides the configured one.
    #[arg(long, value_enum)]
    sampler: Option<SamplerArg>,

    /// Use (cx, cy, w, h) reference boxes instead of reference points.
    #[arg(long)]
    box_references: bool,

    /// Number of timed forward passes.
    #[arg(long, default_value_t = 3)]
    runs: usize,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn layers_config(&self) -> anyhow::Result<LayersConfig> {
        let mut config = match &self.config {
            Some(path) => LayersConfig::from_json_file(path)?,
            None => self.preset.config(),
        };
        if let Some(sampler) = self.sampler {
            config.cross_attn.sampler = sampler.into();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Square feature levels, finest first: 4 * 2^(n_levels - 1), ..., 8, 4
fn feature_levels(n_levels: usize) -> Vec<(usize, usize)> {
    (0..n_levels)
        .map(|l| {
            let side = 4usize << (n_levels - 1 - l);
            (side, side)
        })
        .collect()
}

/// Deterministic [batch, seq, dim] tensor with a structured pattern
fn test_tensor(dims: (usize, usize, usize), device: &Device) -> anyhow::Result<Tensor> {
    let (batch_size, seq_len, dim) = dims;
    let mut data = vec![0.0f32; batch_size * seq_len * dim];

    for (idx, value) in data.iter_mut().enumerate() {
        let b = idx / (seq_len * dim);
        let s = (idx / dim) % seq_len;
        let c = idx % dim;
        *value = (b + 1) as f32 * 0.1 + ((s * 7 + c) % 97) as f32 * 0.01 - 0.5;
    }

    Ok(Tensor::from_vec(data, (batch_size, seq_len, dim), device)?)
}

/// Deterministic reference points in [0, 1], with box sizes when `boxes` is set
fn reference_points(
    batch_size: usize,
    num_queries: usize,
    n_levels: usize,
    boxes: bool,
    device: &Device,
) -> anyhow::Result<Tensor> {
    let last = if boxes { 4 } else { 2 };
    let mut data = Vec::with_capacity(batch_size * num_queries * n_levels * last);
    for b in 0..batch_size {
        for q in 0..num_queries {
            for l in 0..n_levels {
                let x = ((q * 7 + b * 3 + l) % 11) as f32 / 10.0;
                let y = ((q * 5 + b + l * 2) % 13) as f32 / 12.0;
                data.push(x);
                data.push(y);
                if boxes {
                    data.push(0.05 + (q % 4) as f32 * 0.1);
                    data.push(0.05 + (q % 3) as f32 * 0.1);
                }
            }
        }
    }
    Ok(Tensor::from_vec(
        data,
        (batch_size, num_queries, n_levels, last),
        device,
    )?)
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let device = device(args.cpu)?;
    tracing::info!(?device, "using device");

    let config = args.layers_config()?;
    let d_model = config.hidden_dim();
    tracing::info!(
        d_model,
        heads = config.self_attn.nhead,
        levels = config.cross_attn.n_levels,
        points = config.cross_attn.n_points,
        sampler = ?config.cross_attn.sampler,
        "layer config"
    );

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let self_attn = MultiHeadAttention::new(&config.self_attn, vb.pp("self_attn"))?;
    let cross_attn =
        MsDeformableAttention::new(&config.cross_attn, &varmap, vb.pp("cross_attn"))?;
    let bbox_head = Mlp::new(&config.bbox_head, vb.pp("bbox_head"))?;
    let position = PositionEmbedding::new(&config.position, &device)?;
    tracing::info!(
        parameters = varmap.all_vars().len(),
        sampler = cross_attn.sampler_name(),
        "layers initialized"
    );

    let spatial_shapes = feature_levels(config.cross_attn.n_levels);
    let level_start = level_start_index(&spatial_shapes);
    let len_v: usize = spatial_shapes.iter().map(|(h, w)| h * w).sum();
    tracing::info!(?spatial_shapes, ?level_start, len_v, "feature levels");

    let queries = test_tensor((args.batch_size, args.num_queries, d_model), &device)?;
    let memory = test_tensor((args.batch_size, len_v, d_model), &device)?;
    let refs = reference_points(
        args.batch_size,
        args.num_queries,
        spatial_shapes.len(),
        args.box_references,
        &device,
    )?;

    let mut outputs = None;
    for run in 0..args.runs.max(1) {
        let start = Instant::now();

        let q = position.forward(&queries)?;
        let q = (&q + self_attn.forward(&q, &q, &q, None)?)?;
        let t_self = start.elapsed();

        let q = (&q
            + cross_attn.forward(&q, &refs, &memory, &spatial_shapes, &level_start, None)?)?;
        let t_cross = start.elapsed();

        let boxes = candle_nn::ops::sigmoid(&bbox_head.forward(&q)?)?;
        device.synchronize()?;
        let t_total = start.elapsed();

        tracing::info!(
            run,
            self_attn_ms = t_self.as_secs_f64() * 1e3,
            cross_attn_ms = (t_cross - t_self).as_secs_f64() * 1e3,
            total_ms = t_total.as_secs_f64() * 1e3,
            "forward pass"
        );
        outputs = Some((q, boxes));
    }

    if let Some((hidden, boxes)) = outputs {
        let hidden_stats = TensorStats::from_tensor(&hidden)?;
        tracing::info!(max_abs = hidden_stats.max_abs(), "hidden states: {}", hidden_stats);
        let box_stats = TensorStats::from_tensor(&boxes)?;
        tracing::info!(max_abs = box_stats.max_abs(), "boxes: {}", box_stats);
    }

    Ok(())
}
