/// RMS Layer Normalization
use candle_core::{Result, Tensor, DType, D};
use candle_nn::{Init, VarBuilder};

/// RMS Normalization function
///
/// The reduction always runs in F32, whatever the compute dtype, and the
/// result is cast back to the input dtype.
pub fn rms_norm(hidden_states: &Tensor, variance_epsilon: f64) -> Result<Tensor> {
    let input_dtype = hidden_states.dtype();

    let hidden_states = if input_dtype != DType::F32 {
        hidden_states.to_dtype(DType::F32)?
    } else {
        hidden_states.clone()
    };

    let variance = hidden_states.sqr()?.mean_keepdim(D::Minus1)?;
    let normalized = hidden_states.broadcast_div(&(variance + variance_epsilon)?.sqrt()?)?;

    if input_dtype != DType::F32 {
        normalized.to_dtype(input_dtype)
    } else {
        Ok(normalized)
    }
}

/// RMS Normalization layer with learnable scale
pub struct RMSNorm {
    weight: Tensor,
    eps: f64,
}

impl RMSNorm {
    pub fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((hidden_size,), "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let normalized = rms_norm(x, self.eps)?;
        // Scale may be stored wider than the compute dtype
        let weight = if self.weight.dtype() != normalized.dtype() {
            self.weight.to_dtype(normalized.dtype())?
        } else {
            self.weight.clone()
        };
        normalized.broadcast_mul(&weight)
    }
}
