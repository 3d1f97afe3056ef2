use std::fmt;

use candle_core::Result;
use candle_core::Tensor;

/// Tensor statistics for debugging and validation
#[derive(Debug)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub sum: f32,
}

impl TensorStats {
    /// Compute statistics for a tensor
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let flat = tensor.flatten_all()?.to_dtype(candle_core::DType::F32)?;
        let data: Vec<f32> = flat.to_vec1()?;

        let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = data.iter().sum();
        let mean = if data.is_empty() {
            0.0
        } else {
            sum / data.len() as f32
        };

        Ok(Self {
            shape,
            min,
            max,
            mean,
            sum,
        })
    }

    /// Maximum absolute value
    pub fn max_abs(&self) -> f32 {
        self.min.abs().max(self.max.abs())
    }
}

impl fmt::Display for TensorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} min={:.6} max={:.6} mean={:.6} sum={:.6}",
            self.shape, self.min, self.max, self.mean, self.sum
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_stats() {
        let t = Tensor::new(&[[-2f32, 0.5], [1.0, 4.5]], &Device::Cpu).unwrap();
        let stats = TensorStats::from_tensor(&t).unwrap();
        assert_eq!(stats.shape, vec![2, 2]);
        assert_eq!(stats.min, -2.0);
        assert_eq!(stats.max, 4.5);
        assert_eq!(stats.sum, 4.0);
        assert_eq!(stats.mean, 1.0);
        assert_eq!(stats.max_abs(), 4.5);
        assert!(stats.to_string().starts_with("[2, 2] min=-2.000000"));
    }
}
