//! Property-based tests for the transformer layers.
//!
//! Key invariants:
//! - Attention weights are a probability distribution (MHA over keys, MSDA over
//!   the joint level/point axis)
//! - Output shapes follow the query shape
//! - Zero offsets place every sample exactly on its reference point
//! - Gather and scalar samplers agree, including outside the image
//! - The position table starts with (0, 1, 0, 1, ...) and is added unchanged

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use candle_rt_detr::model::{
    level_start_index, sampling_locations, GatherSampler, GridSampler, ScalarSampler,
};
use candle_rt_detr::{
    MsDeformableAttention, MsDeformableAttentionConfig, MultiHeadAttention,
    MultiHeadAttentionConfig, PositionEmbedding, PositionEmbeddingConfig,
};
use proptest::prelude::*;

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar()
        .unwrap()
}

fn assert_rows_sum_to_one(weights: &Tensor) -> Result<(), TestCaseError> {
    let sums = weights
        .sum(D::Minus1)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    for s in sums {
        prop_assert!((s - 1.0).abs() < 1e-5, "sum {}", s);
    }
    Ok(())
}

fn spatial_shapes(n_levels: usize) -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((1usize..6, 1usize..6), n_levels)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// MHA keeps the query shape and normalizes over keys.
    #[test]
    fn mha_weights_are_distributions(
        batch in 1usize..3,
        len_q in 1usize..6,
        len_k in 1usize..6,
        heads in prop::sample::select(vec![1usize, 2, 4]),
    ) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mha = MultiHeadAttention::new(&MultiHeadAttentionConfig::new(8, heads), vb).unwrap();

        let q = Tensor::randn(0f32, 1., (batch, len_q, 8), &device).unwrap();
        let kv = Tensor::randn(0f32, 1., (batch, len_k, 8), &device).unwrap();
        let (out, weights) = mha.forward_with_weights(&q, &kv, &kv, None).unwrap();

        prop_assert_eq!(out.dims(), &[batch, len_q, 8]);
        prop_assert_eq!(weights.dims(), &[batch, heads, len_q, len_k]);
        assert_rows_sum_to_one(&weights)?;
    }

    /// MSDA keeps the query shape and normalizes over (level, point) per head.
    #[test]
    fn msda_weights_are_distributions(
        (n_levels, shapes) in (1usize..4).prop_flat_map(|l| (Just(l), spatial_shapes(l))),
        heads in prop::sample::select(vec![1usize, 2, 4]),
        n_points in 1usize..4,
        len_q in 1usize..5,
        boxes in any::<bool>(),
    ) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = MsDeformableAttentionConfig::new(8, heads, n_levels, n_points);
        let attn = MsDeformableAttention::new(&config, &varmap, vb).unwrap();

        let len_v: usize = shapes.iter().map(|(h, w)| h * w).sum();
        let query = Tensor::randn(0f32, 1., (2, len_q, 8), &device).unwrap();
        let value = Tensor::randn(0f32, 1., (2, len_v, 8), &device).unwrap();
        let last = if boxes { 4 } else { 2 };
        let refs = Tensor::rand(0f32, 1., (2, len_q, n_levels, last), &device).unwrap();

        let plan = attn.sampling_plan(&query, &refs, &shapes).unwrap();
        prop_assert_eq!(plan.locations.dims(), &[2, len_q, heads, n_levels, n_points, 2]);
        assert_rows_sum_to_one(&plan.attention_weights.flatten_from(3).unwrap())?;

        let out = attn
            .forward(&query, &refs, &value, &shapes, &level_start_index(&shapes), None)
            .unwrap();
        prop_assert_eq!(out.dims(), &[2, len_q, 8]);
    }

    /// Zero offsets put every sample on the reference point, for points and boxes.
    #[test]
    fn zero_offsets_sample_at_reference(
        coords in prop::collection::vec(0f32..1.0, 6),
        sizes in prop::collection::vec(0.01f32..2.0, 6),
        (h, w) in (1usize..64, 1usize..64),
    ) {
        let device = Device::Cpu;
        let xy = Tensor::from_vec(coords, (1, 3, 1, 2), &device).unwrap();
        let wh = Tensor::from_vec(sizes, (1, 3, 1, 2), &device).unwrap();
        let boxes = Tensor::cat(&[&xy, &wh], D::Minus1).unwrap();
        let offsets = Tensor::zeros((1, 3, 2, 1, 3, 2), DType::F32, &device).unwrap();
        let expected = xy
            .unsqueeze(2)
            .unwrap()
            .unsqueeze(4)
            .unwrap()
            .broadcast_as((1, 3, 2, 1, 3, 2))
            .unwrap();

        for refs in [&xy, &boxes] {
            let loc = sampling_locations(refs, &offsets, &[(h, w)]).unwrap();
            prop_assert_eq!(max_abs_diff(&loc, &expected), 0.0);
        }
    }

    /// Both sampling backends agree, with grids reaching outside the image.
    #[test]
    fn samplers_agree(
        (h, w) in (1usize..7, 1usize..7),
        (h_out, w_out) in (1usize..5, 1usize..5),
        channels in 1usize..4,
    ) {
        let device = Device::Cpu;
        let input = Tensor::randn(0f32, 1., (2, channels, h, w), &device).unwrap();
        let grid = Tensor::rand(-1.5f32, 1.5, (2, h_out, w_out, 2), &device).unwrap();

        let gather = GatherSampler.sample(&input, &grid).unwrap();
        let scalar = ScalarSampler.sample(&input, &grid).unwrap();
        prop_assert_eq!(gather.dims(), &[2, channels, h_out, w_out]);
        prop_assert!(max_abs_diff(&gather, &scalar) < 1e-5);
    }

    /// The table starts with (0, 1, 0, 1, ...) and is added regardless of batch size.
    #[test]
    fn position_embedding_adds_table(
        half_dim in 1usize..16,
        seq_len in 1usize..32,
        batch in 1usize..4,
    ) {
        let d_model = half_dim * 2;
        let device = Device::Cpu;
        let pe = PositionEmbedding::new(&PositionEmbeddingConfig::new(d_model, 32), &device)
            .unwrap();

        let row0: Vec<f32> = pe.table().get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        for (i, v) in row0.iter().enumerate() {
            prop_assert_eq!(*v, if i % 2 == 0 { 0.0 } else { 1.0 });
        }

        let x = Tensor::randn(0f32, 1., (batch, seq_len, d_model), &device).unwrap();
        let out = pe.forward(&x).unwrap();
        let expected = x
            .broadcast_add(&pe.table().narrow(1, 0, seq_len).unwrap())
            .unwrap();
        prop_assert_eq!(max_abs_diff(&out, &expected), 0.0);
    }
}
