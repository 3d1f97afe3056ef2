//! Sinusoidal Position Embedding
//!
//! Fixed (non-learned) position table for 1-D token sequences, as in
//! "Attention Is All You Need":
//!
//! - `pe[pos, 2i]     = sin(pos / 10000^(2i / d_model))`
//! - `pe[pos, 2i + 1] = cos(pos / 10000^(2i / d_model))`
//!
//! The table is computed once at construction and stored as a plain tensor, so it
//! never appears in a `VarMap` and never receives gradient updates.

use candle_core::{Device, Tensor, D};

use crate::config::PositionEmbeddingConfig;
use crate::error::{Error, Result};

/// Sinusoidal position embedding added to a `[batch, seq_len, d_model]` input
#[derive(Debug, Clone)]
pub struct PositionEmbedding {
    /// Precomputed table: [1, max_len, d_model]
    pe: Tensor,
    max_len: usize,
    d_model: usize,
}

impl PositionEmbedding {
    pub fn new(config: &PositionEmbeddingConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let (max_len, d_model) = (config.max_len, config.d_model);

        // div_term[i] = exp(2i * -ln(10000) / d_model)
        let log_scale = -(10000.0f32).ln() / d_model as f32;
        let div_term: Vec<f32> = (0..d_model / 2)
            .map(|i| ((2 * i) as f32 * log_scale).exp())
            .collect();

        let mut table = vec![0f32; max_len * d_model];
        for (pos, row) in table.chunks_exact_mut(d_model).enumerate() {
            for (i, div) in div_term.iter().enumerate() {
                let angle = pos as f32 * div;
                row[2 * i] = angle.sin();
                row[2 * i + 1] = angle.cos();
            }
        }
        let pe = Tensor::from_vec(table, (1, max_len, d_model), device)?;

        tracing::debug!(max_len, d_model, "built position embedding table");
        Ok(Self {
            pe,
            max_len,
            d_model,
        })
    }

    /// The full table, [1, max_len, d_model]
    pub fn table(&self) -> &Tensor {
        &self.pe
    }

    /// Add the first `seq_len` rows of the table to `x` ([batch, seq_len, d_model])
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.dim(1)?;
        if seq_len > self.max_len {
            return Err(Error::SequenceTooLong {
                seq_len,
                max_len: self.max_len,
            });
        }
        let d_model = x.dim(D::Minus1)?;
        if d_model != self.d_model {
            return Err(candle_core::Error::Msg(format!(
                "position embedding expects d_model {}, got {}",
                self.d_model, d_model
            ))
            .into());
        }
        let pe = self.pe.narrow(1, 0, seq_len)?.to_dtype(x.dtype())?;
        Ok(x.broadcast_add(&pe)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn embedding(d_model: usize, max_len: usize) -> PositionEmbedding {
        PositionEmbedding::new(&PositionEmbeddingConfig::new(d_model, max_len), &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_first_row_alternates_zero_one() {
        let pe = embedding(16, 10);
        let row: Vec<f32> = pe.table().get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        for (i, v) in row.iter().enumerate() {
            let expected = if i % 2 == 0 { 0.0 } else { 1.0 };
            assert_eq!(*v, expected, "channel {}", i);
        }
    }

    #[test]
    fn test_table_values() {
        let pe = embedding(4, 8);
        let table = pe.table().squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        // pos 3, channel pair 1: angle = 3 / 10000^(2/4) = 0.03
        let angle = 3.0f32 * (-(10000.0f32).ln() * 2.0 / 4.0).exp();
        assert!((table[3][2] - angle.sin()).abs() < 1e-6);
        assert!((table[3][3] - angle.cos()).abs() < 1e-6);
        assert!((table[3][0] - 3.0f32.sin()).abs() < 1e-6);
        assert!((table[3][1] - 3.0f32.cos()).abs() < 1e-6);
    }

    #[test]
    fn test_forward_adds_table_independent_of_batch() {
        let device = Device::Cpu;
        let pe = embedding(8, 32);

        for batch in [1usize, 3] {
            let x = Tensor::randn(0f32, 1., (batch, 5, 8), &device).unwrap();
            let out = pe.forward(&x).unwrap();
            assert_eq!(out.dims(), &[batch, 5, 8]);

            let delta = (&out - &x).unwrap();
            let expected = pe
                .table()
                .narrow(1, 0, 5)
                .unwrap()
                .broadcast_as((batch, 5, 8))
                .unwrap();
            let diff: f32 = (&delta - &expected)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert!(diff < 1e-6);
        }
    }

    #[test]
    fn test_sequence_too_long() {
        let pe = embedding(8, 4);
        let x = Tensor::zeros((1, 5, 8), DType::F32, &Device::Cpu).unwrap();
        let err = pe.forward(&x).unwrap_err();
        assert!(matches!(
            err,
            Error::SequenceTooLong {
                seq_len: 5,
                max_len: 4
            }
        ));
    }

    #[test]
    fn test_full_length_is_accepted() {
        let pe = embedding(8, 4);
        let x = Tensor::zeros((2, 4, 8), DType::F32, &Device::Cpu).unwrap();
        let out = pe.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 4, 8]);
    }

    #[test]
    fn test_odd_dim_rejected() {
        let err = PositionEmbedding::new(&PositionEmbeddingConfig::new(7, 4), &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, Error::OddEmbeddingDim(7)));
    }

    #[test]
    fn test_range() {
        let pe = embedding(64, 200);
        let min: f32 = pe.table().min_all().unwrap().to_scalar().unwrap();
        let max: f32 = pe.table().max_all().unwrap().to_scalar().unwrap();
        assert!(min >= -1.0 - 1e-6, "min {} should be >= -1", min);
        assert!(max <= 1.0 + 1e-6, "max {} should be <= 1", max);
    }
}
