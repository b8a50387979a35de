/// Linear layer that runs in the caller's dtype
use candle_core::{Result, Tensor, DType};
use candle_nn::{VarBuilder, Init};

/// Linear layer with automatic dtype casting
///
/// Weights stay in their storage dtype; they are cast to the input's dtype
/// for the matmul. Under an autocast region the model feeds inputs in the
/// compute dtype, so F32-stored weights run in BF16 and vice versa.
pub struct CastedLinear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl CastedLinear {
    /// Create new CastedLinear layer
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `bias` - Whether to include bias
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let init_ws = candle_nn::init::DEFAULT_KAIMING_NORMAL;
        let weight = vb.get_with_hints((out_features, in_features), "weight", init_ws)?;

        let bias = if bias {
            let bound = 1. / (in_features as f64).sqrt();
            let init_bs = Init::Uniform { lo: -bound, up: bound };
            Some(vb.get_with_hints(out_features, "bias", init_bs)?)
        } else {
            None
        };

        Ok(Self { weight, bias })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let input_dtype = input.dtype();

        // The CPU backend has no 16-bit matmul: run it in F32 and narrow back
        let matmul_dtype = if input.device().is_cpu() && is_half(input_dtype) {
            DType::F32
        } else {
            input_dtype
        };

        let weight = cast(&self.weight, matmul_dtype)?;
        // weight is [out, in]
        let output = cast(input, matmul_dtype)?.broadcast_matmul(&weight.t()?)?;
        let output = cast(&output, input_dtype)?;

        match &self.bias {
            Some(b) => output.broadcast_add(&cast(b, input_dtype)?),
            None => Ok(output),
        }
    }
}

fn is_half(dtype: DType) -> bool {
    matches!(dtype, DType::BF16 | DType::F16)
}

fn cast(t: &Tensor, dtype: DType) -> Result<Tensor> {
    if t.dtype() != dtype {
        t.to_dtype(dtype)
    } else {
        Ok(t.clone())
    }
}
