//! Bilinear grid sampling backends
//!
//! Both kernels implement `F.grid_sample(mode="bilinear", padding_mode="zeros",
//! align_corners=False)`:
//!
//! - grid coordinates live in `[-1, 1]`, x along width, y along height
//! - pixel coordinate `x_pix = (x + 1) * W / 2 - 0.5`, so `[-1, 1]` spans pixel edges
//! - each of the four neighbouring corners contributes `weight * value` if it lies
//!   inside the image and nothing otherwise (no clamping, no wraparound)
//!
//! The backend is picked once, when a layer is built, from [`SamplerKind`].

use std::fmt::Debug;
use std::sync::Arc;

use candle_core::{DType, Device, IndexOp, Result, Tensor};
use rayon::prelude::*;

use crate::config::SamplerKind;

/// Bilinear sampling of `input` [N, C, H, W] at `grid` [N, H_out, W_out, 2],
/// returning [N, C, H_out, W_out]
pub trait GridSampler: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn sample(&self, input: &Tensor, grid: &Tensor) -> Result<Tensor>;
}

/// Resolve a [`SamplerKind`] for a layer living on `device`
pub fn select_sampler(kind: SamplerKind, device: &Device) -> Arc<dyn GridSampler> {
    let sampler: Arc<dyn GridSampler> = match kind {
        SamplerKind::Auto | SamplerKind::Gather => Arc::new(GatherSampler),
        SamplerKind::Scalar => Arc::new(ScalarSampler),
    };
    tracing::debug!(?kind, ?device, sampler = sampler.name(), "selected grid sampler");
    sampler
}

fn check_shapes(input: &Tensor, grid: &Tensor) -> Result<(usize, usize, usize, usize, usize, usize)> {
    let (n, c, h, w) = input.dims4()?;
    let (grid_n, h_out, w_out, two) = grid.dims4()?;
    if grid_n != n || two != 2 {
        candle_core::bail!(
            "grid {:?} incompatible with input {:?}, expected [{}, H_out, W_out, 2]",
            grid.dims(),
            input.dims(),
            n
        );
    }
    Ok((n, c, h, w, h_out, w_out))
}

/// Tensor-op kernel: floor, gather the four corners, mask out-of-bounds corners.
/// Stays on the input's device and keeps the autodiff graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct GatherSampler;

impl GridSampler for GatherSampler {
    fn name(&self) -> &'static str {
        "gather"
    }

    fn sample(&self, input: &Tensor, grid: &Tensor) -> Result<Tensor> {
        let (n, c, h, w, h_out, w_out) = check_shapes(input, grid)?;

        let device = input.device();
        let dtype = input.dtype();

        // grid[..., 0] is x (width), grid[..., 1] is y (height)
        let grid_x = grid.i((.., .., .., 0))?;
        let grid_y = grid.i((.., .., .., 1))?;

        // Unnormalize with align_corners=False: [-1, 1] -> [-0.5, W-0.5]
        let x = (((grid_x + 1.0)? * (w as f64 / 2.0))? - 0.5)?;
        let y = (((grid_y + 1.0)? * (h as f64 / 2.0))? - 0.5)?;

        let x0 = x.floor()?;
        let y0 = y.floor()?;
        let x1 = (&x0 + 1.0)?;
        let y1 = (&y0 + 1.0)?;

        // Interpolation weights
        let wa = (&x1 - &x)?.mul(&(&y1 - &y)?)?;
        let wb = (&x - &x0)?.mul(&(&y1 - &y)?)?;
        let wc = (&x1 - &x)?.mul(&(&y - &y0)?)?;
        let wd = (&x - &x0)?.mul(&(&y - &y0)?)?;

        // Clamp only to produce safe gather indices; out-of-bounds corners are
        // masked to zero below.
        let x0_idx = x0.clamp(0.0, (w - 1) as f64)?.to_dtype(DType::I64)?;
        let x1_idx = x1.clamp(0.0, (w - 1) as f64)?.to_dtype(DType::I64)?;
        let y0_idx = y0.clamp(0.0, (h - 1) as f64)?.to_dtype(DType::I64)?;
        let y1_idx = y1.clamp(0.0, (h - 1) as f64)?.to_dtype(DType::I64)?;

        // Linear indices: idx = y * W + x
        let w_tensor = Tensor::full(w as i64, y0_idx.dims(), device)?;
        let idx_a = (y0_idx.mul(&w_tensor)? + &x0_idx)?;
        let idx_b = (y0_idx.mul(&w_tensor)? + &x1_idx)?;
        let idx_c = (y1_idx.mul(&w_tensor)? + &x0_idx)?;
        let idx_d = (y1_idx.mul(&w_tensor)? + &x1_idx)?;

        let input_flat = input.reshape((n, c, h * w))?;
        let gather_corner = |idx: &Tensor| -> Result<Tensor> {
            let idx = idx.reshape((n, 1, h_out * w_out))?.repeat((1, c, 1))?;
            input_flat.gather(&idx, 2)?.reshape((n, c, h_out, w_out))
        };
        let va = gather_corner(&idx_a)?;
        let vb = gather_corner(&idx_b)?;
        let vc = gather_corner(&idx_c)?;
        let vd = gather_corner(&idx_d)?;

        // Corner validity: inside [0, W-1] x [0, H-1]
        let in_range = |t: &Tensor, size: usize| -> Result<Tensor> {
            t.ge(0.0)?.mul(&t.lt(size as f64)?)?.to_dtype(dtype)
        };
        let x0_valid = in_range(&x0, w)?;
        let x1_valid = in_range(&x1, w)?;
        let y0_valid = in_range(&y0, h)?;
        let y1_valid = in_range(&y1, h)?;

        // Fold the masks into the weights: [N, H_out, W_out] -> [N, 1, H_out, W_out]
        let wa = wa.to_dtype(dtype)?.mul(&x0_valid.mul(&y0_valid)?)?.unsqueeze(1)?;
        let wb = wb.to_dtype(dtype)?.mul(&x1_valid.mul(&y0_valid)?)?.unsqueeze(1)?;
        let wc = wc.to_dtype(dtype)?.mul(&x0_valid.mul(&y1_valid)?)?.unsqueeze(1)?;
        let wd = wd.to_dtype(dtype)?.mul(&x1_valid.mul(&y1_valid)?)?.unsqueeze(1)?;

        va.broadcast_mul(&wa)?
            .add(&vb.broadcast_mul(&wb)?)?
            .add(&vc.broadcast_mul(&wc)?)?
            .add(&vd.broadcast_mul(&wd)?)
    }
}

/// Direct CPU kernel over f32 slices, parallel over the leading (batch * heads)
/// axis. Inference only: the output is rebuilt from host memory, so no gradient
/// reaches the input or the grid. Only `F32` input and grid are accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarSampler;

impl GridSampler for ScalarSampler {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn sample(&self, input: &Tensor, grid: &Tensor) -> Result<Tensor> {
        let (n, c, h, w, h_out, w_out) = check_shapes(input, grid)?;
        if input.dtype() != DType::F32 || grid.dtype() != DType::F32 {
            candle_core::bail!(
                "scalar grid sampler expects f32 input and grid, got {:?} and {:?}",
                input.dtype(),
                grid.dtype()
            );
        }
        let device = input.device().clone();

        let plane = h * w;
        let n_out = h_out * w_out;
        if n * c * n_out == 0 || plane == 0 {
            return Tensor::zeros((n, c, h_out, w_out), DType::F32, &device);
        }

        let values: Vec<f32> = input
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1()?;
        let coords: Vec<f32> = grid
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1()?;

        let mut output = vec![0f32; n * c * n_out];

        output
            .par_chunks_mut(c * n_out)
            .zip(values.par_chunks(c * plane))
            .zip(coords.par_chunks(n_out * 2))
            .for_each(|((out, image), coords)| {
                for (p, xy) in coords.chunks_exact(2).enumerate() {
                    let x = (xy[0] + 1.0) * (w as f32 / 2.0) - 0.5;
                    let y = (xy[1] + 1.0) * (h as f32 / 2.0) - 0.5;
                    let (x0, y0) = (x.floor(), y.floor());
                    let (x1, y1) = (x0 + 1.0, y0 + 1.0);

                    let corners = [
                        (x0, y0, (x1 - x) * (y1 - y)),
                        (x1, y0, (x - x0) * (y1 - y)),
                        (x0, y1, (x1 - x) * (y - y0)),
                        (x1, y1, (x - x0) * (y - y0)),
                    ];
                    for (cx, cy, weight) in corners {
                        if cx < 0.0 || cy < 0.0 || cx >= w as f32 || cy >= h as f32 {
                            continue;
                        }
                        let idx = cy as usize * w + cx as usize;
                        for ch in 0..c {
                            out[ch * n_out + p] += weight * image[ch * plane + idx];
                        }
                    }
                }
            });

        Tensor::from_vec(output, (n, c, h_out, w_out), &Device::Cpu)?.to_device(&device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samplers() -> [Arc<dyn GridSampler>; 2] {
        [Arc::new(GatherSampler), Arc::new(ScalarSampler)]
    }

    fn sample_one(sampler: &dyn GridSampler, input: &Tensor, x: f32, y: f32) -> f32 {
        let grid = Tensor::from_vec(vec![x, y], (1, 1, 1, 2), &Device::Cpu).unwrap();
        let output = sampler.sample(input, &grid).unwrap();
        output.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_center_of_2x2() {
        let device = Device::Cpu;
        let input = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (1, 1, 2, 2), &device).unwrap();
        for sampler in samplers() {
            let value = sample_one(sampler.as_ref(), &input, 0.0, 0.0);
            assert!((value - 2.5).abs() < 1e-6, "{}: {}", sampler.name(), value);
        }
    }

    #[test]
    fn test_align_corners_false() {
        // 4x4 image with values 0-15
        let device = Device::Cpu;
        let input_data: Vec<f32> = (0..16).map(|x| x as f32).collect();
        let input = Tensor::from_vec(input_data, (1, 1, 4, 4), &device).unwrap();

        for sampler in samplers() {
            let s = sampler.as_ref();
            // (0, 0) -> pixel (1.5, 1.5): (5 + 6 + 9 + 10) / 4
            assert!((sample_one(s, &input, 0.0, 0.0) - 7.5).abs() < 1e-5);
            // (-0.5, -0.5) -> pixel (0.5, 0.5): (0 + 1 + 4 + 5) / 4
            assert!((sample_one(s, &input, -0.5, -0.5) - 2.5).abs() < 1e-5);
            // (0.5, 0.5) -> pixel (2.5, 2.5): (10 + 11 + 14 + 15) / 4
            assert!((sample_one(s, &input, 0.5, 0.5) - 12.5).abs() < 1e-5);
            // (-0.75, -0.75) -> pixel (0, 0) exactly
            assert!((sample_one(s, &input, -0.75, -0.75) - 0.0).abs() < 1e-6);
            // (-0.25, -0.75) -> pixel (1, 0) exactly
            assert!((sample_one(s, &input, -0.25, -0.75) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_corner_is_zero_padded() {
        // (-1, -1) -> pixel (-0.5, -0.5): only a quarter of pixel (0, 0) survives
        let device = Device::Cpu;
        let input = Tensor::ones((1, 1, 4, 4), DType::F32, &device).unwrap();
        for sampler in samplers() {
            let value = sample_one(sampler.as_ref(), &input, -1.0, -1.0);
            assert!((value - 0.25).abs() < 1e-6, "{}: {}", sampler.name(), value);
        }
    }

    #[test]
    fn test_outside_grid_is_exactly_zero() {
        let device = Device::Cpu;
        let input = Tensor::full(3.0f32, (1, 2, 3, 5), &device).unwrap();
        for sampler in samplers() {
            for (x, y) in [(1.5f32, 0.0f32), (0.0, -1.5), (-2.0, 2.0), (5.0, 5.0)] {
                let grid = Tensor::from_vec(vec![x, y], (1, 1, 1, 2), &device).unwrap();
                let out = sampler.sample(&input, &grid).unwrap();
                let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
                assert_eq!(values, vec![0.0, 0.0], "{} at ({}, {})", sampler.name(), x, y);
            }
        }
    }

    #[test]
    fn test_edge_sampling_keeps_in_bounds_corners() {
        // Near the bottom-right edge of a 24x24 map: x1 falls outside, x0 is valid.
        let device = Device::Cpu;
        let (h, w) = (24usize, 24usize);
        let input_data: Vec<f32> = (0..(h * w)).map(|x| x as f32).collect();
        let input = Tensor::from_vec(input_data, (1, 1, h, w), &device).unwrap();

        for sampler in samplers() {
            let value = sample_one(sampler.as_ref(), &input, 0.987, 0.8902);
            // x = 23.344, y = 22.1824: corners (23, 22) and (23, 23) survive
            let (fx, fy) = (0.344f32, 0.1824f32);
            let expected = (1.0 - fx) * (1.0 - fy) * 551.0 + (1.0 - fx) * fy * 575.0;
            assert!(
                (value - expected).abs() < 1e-1,
                "{}: expected ~{}, got {}",
                sampler.name(),
                expected,
                value
            );
        }
    }

    #[test]
    fn test_backends_agree() {
        let device = Device::Cpu;
        let input = Tensor::randn(0f32, 1., (6, 3, 5, 7), &device).unwrap();
        // Includes coordinates well outside [-1, 1]
        let grid = Tensor::rand(-1.4f32, 1.4, (6, 4, 9, 2), &device).unwrap();

        let a = GatherSampler.sample(&input, &grid).unwrap();
        let b = ScalarSampler.sample(&input, &grid).unwrap();
        assert_eq!(a.dims(), &[6, 3, 4, 9]);
        assert_eq!(a.dims(), b.dims());

        let diff: f32 = (&a - &b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5, "max diff {}", diff);
    }

    #[test]
    fn test_grid_batch_mismatch() {
        let device = Device::Cpu;
        let input = Tensor::zeros((2, 1, 2, 2), DType::F32, &device).unwrap();
        let grid = Tensor::zeros((3, 1, 1, 2), DType::F32, &device).unwrap();
        for sampler in samplers() {
            assert!(sampler.sample(&input, &grid).is_err());
        }
    }

    #[test]
    fn test_scalar_rejects_non_f32() {
        let device = Device::Cpu;
        let input = Tensor::ones((1, 1, 2, 2), DType::F64, &device).unwrap();
        let grid = Tensor::zeros((1, 1, 1, 2), DType::F64, &device).unwrap();
        assert!(ScalarSampler.sample(&input, &grid).is_err());

        // The gather kernel keeps f64 end to end
        let out = GatherSampler.sample(&input, &grid).unwrap();
        assert_eq!(out.dtype(), DType::F64);
        let value: f64 = out.flatten_all().unwrap().to_vec1::<f64>().unwrap()[0];
        assert!((value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_gather_propagates_gradients() {
        let device = Device::Cpu;
        let input = candle_core::Var::randn(0f32, 1., (1, 2, 3, 3), &device).unwrap();
        let grid = candle_core::Var::rand(-0.8f32, 0.8, (1, 2, 2, 2), &device).unwrap();
        let out = GatherSampler.sample(input.as_tensor(), grid.as_tensor()).unwrap();
        let grads = out.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        assert!(grads.get(input.as_tensor()).is_some());
        assert!(grads.get(grid.as_tensor()).is_some());
    }

    #[test]
    fn test_auto_selection() {
        assert_eq!(select_sampler(SamplerKind::Auto, &Device::Cpu).name(), "gather");
        assert_eq!(select_sampler(SamplerKind::Gather, &Device::Cpu).name(), "gather");
        assert_eq!(select_sampler(SamplerKind::Scalar, &Device::Cpu).name(), "scalar");
    }
}
