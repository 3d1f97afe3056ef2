//! Parameter initialization helpers
//!
//! Layers request their parameters through a `VarBuilder` with init hints. A
//! builder backed by a fresh `VarMap` applies the hints; a builder backed by
//! safetensors ignores them and loads the stored weights.

use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder, VarMap};

use crate::error::Error;

/// Xavier (Glorot) uniform init for a `fan_out x fan_in` weight:
/// `U(-a, a)` with `a = sqrt(6 / (fan_in + fan_out))`
pub fn xavier_uniform(fan_in: usize, fan_out: usize) -> Init {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Linear layer with Xavier-uniform weight and zero bias
pub fn xavier_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", xavier_uniform(in_dim, out_dim))?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Linear layer with all-zero weight and bias
pub fn zero_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", Init::Const(0.0))?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Overwrite the `VarMap` variable backing `param` with `value`.
///
/// `param` must be a tensor handed out by a builder over `varmap`; the
/// variable is found by tensor id, so the builder prefix does not matter.
pub fn assign(varmap: &VarMap, param: &Tensor, value: &Tensor) -> crate::Result<()> {
    let var = varmap
        .all_vars()
        .into_iter()
        .find(|var| var.as_tensor().id() == param.id())
        .ok_or(Error::UnknownParameter)?;
    var.set(&value.to_dtype(var.dtype())?)?;
    Ok(())
}

/// Re-draw the variable backing `param` from `init`
pub fn reinit(varmap: &VarMap, param: &Tensor, init: Init) -> crate::Result<()> {
    let fresh = init.var(param.dims(), param.dtype(), param.device())?;
    assign(varmap, param, fresh.as_tensor())
}

/// Reset a linear layer to Xavier-uniform weight and zero bias
pub fn reset_xavier_linear(varmap: &VarMap, layer: &Linear) -> crate::Result<()> {
    let (fan_out, fan_in) = layer.weight().dims2()?;
    reinit(varmap, layer.weight(), xavier_uniform(fan_in, fan_out))?;
    if let Some(bias) = layer.bias() {
        reinit(varmap, bias, Init::Const(0.0))?;
    }
    Ok(())
}
