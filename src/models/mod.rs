/// Classifier interface and the bundled MLP classifier
use candle_core::{Result, Tensor, Device, DType, Var};
use candle_nn::{Dropout, VarBuilder, VarMap};

use crate::layers::{CastedLinear, RMSNorm};
use crate::precision::autocast_dtype;

/// A trainable classifier as seen by the training loop
///
/// The model exclusively owns its parameters through a `VarMap`; the
/// optimizer receives shared handles to the same variables.
pub trait Classifier {
    /// Map `[batch, features]` inputs to `[batch, n_classes]` logits
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Trainable parameters, keyed by name
    fn varmap(&self) -> &VarMap;

    /// Switch between training and evaluation behaviour (dropout etc.)
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Re-store every parameter in `dtype`
    ///
    /// Existing variable handles become stale; anything holding them (an
    /// optimizer) must be rebuilt.
    fn to_dtype(&mut self, dtype: DType) -> crate::Result<()>;

    /// Recompute activations in the backward pass instead of caching them.
    /// Models without such a mechanism ignore the hint.
    fn set_activation_recompute(&mut self, _enabled: bool) {}
}

/// Replace every variable in `varmap` by a copy stored in `dtype`
pub fn cast_varmap(varmap: &VarMap, dtype: DType) -> crate::Result<()> {
    let mut data = varmap
        .data()
        .lock()
        .map_err(|_| crate::TrainerError::Model("parameter map lock poisoned".to_string()))?;

    for var in data.values_mut() {
        if var.dtype() != dtype {
            *var = Var::from_tensor(&var.as_tensor().to_dtype(dtype)?)?;
        }
    }

    Ok(())
}

/// MLP classifier configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    /// Number of input features
    pub input_size: usize,

    /// Hidden layer widths; empty gives a linear classifier
    pub hidden_sizes: Vec<usize>,

    /// Number of output classes
    pub n_classes: usize,

    /// Dropout probability after each hidden block
    pub dropout: f32,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            input_size: 784,
            hidden_sizes: vec![256, 128],
            n_classes: 10,
            dropout: 0.1,
        }
    }
}

struct HiddenBlock {
    linear: CastedLinear,
    norm: RMSNorm,
}

/// Feed-forward classifier: (Linear -> SiLU -> RMSNorm -> Dropout)* -> Linear
pub struct MlpClassifier {
    config: MlpConfig,
    varmap: VarMap,
    blocks: Vec<HiddenBlock>,
    head: CastedLinear,
    dropout: Dropout,
    training: bool,
    recompute: bool,
    device: Device,
}

impl MlpClassifier {
    /// Create a freshly initialised F32 model
    pub fn new(config: MlpConfig, device: &Device) -> crate::Result<Self> {
        if config.input_size == 0 || config.n_classes == 0 {
            return Err(crate::TrainerError::Config(
                "input_size and n_classes must be > 0".to_string(),
            ));
        }
        if config.hidden_sizes.contains(&0) {
            return Err(crate::TrainerError::Config(
                "hidden layer widths must be > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&config.dropout) {
            return Err(crate::TrainerError::Config(format!(
                "dropout must lie in [0, 1), got {}",
                config.dropout
            )));
        }

        let varmap = VarMap::new();
        let (blocks, head) = Self::build_layers(&config, &varmap, DType::F32, device)?;

        Ok(Self {
            dropout: Dropout::new(config.dropout),
            config,
            varmap,
            blocks,
            head,
            training: true,
            recompute: false,
            device: device.clone(),
        })
    }

    /// Binds layers to the variables in `varmap`, creating missing ones
    fn build_layers(
        config: &MlpConfig,
        varmap: &VarMap,
        dtype: DType,
        device: &Device,
    ) -> Result<(Vec<HiddenBlock>, CastedLinear)> {
        let vb = VarBuilder::from_varmap(varmap, dtype, device);

        let mut blocks = Vec::with_capacity(config.hidden_sizes.len());
        let mut in_features = config.input_size;
        for (i, &width) in config.hidden_sizes.iter().enumerate() {
            let block_vb = vb.pp(format!("block_{}", i));
            blocks.push(HiddenBlock {
                linear: CastedLinear::new(in_features, width, true, block_vb.pp("linear"))?,
                norm: RMSNorm::new(width, 1e-6, block_vb.pp("norm"))?,
            });
            in_features = width;
        }

        let head = CastedLinear::new(in_features, config.n_classes, true, vb.pp("head"))?;
        Ok((blocks, head))
    }

    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    /// Current parameter storage dtype
    pub fn dtype(&self) -> DType {
        self.head.weight().dtype()
    }

    pub fn recomputes_activations(&self) -> bool {
        self.recompute
    }
}

impl Classifier for MlpClassifier {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let compute_dtype = autocast_dtype().unwrap_or_else(|| self.dtype());
        let mut hidden = if xs.dtype() != compute_dtype {
            xs.to_dtype(compute_dtype)?
        } else {
            xs.clone()
        };

        for block in &self.blocks {
            hidden = block.linear.forward(&hidden)?;
            hidden = candle_nn::ops::silu(&hidden)?;
            hidden = block.norm.forward(&hidden)?;
            if self.config.dropout > 0.0 {
                hidden = self.dropout.forward(&hidden, self.training)?;
            }
        }

        self.head.forward(&hidden)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn to_dtype(&mut self, dtype: DType) -> crate::Result<()> {
        if self.dtype() == dtype {
            return Ok(());
        }
        cast_varmap(&self.varmap, dtype)?;
        let (blocks, head) = Self::build_layers(&self.config, &self.varmap, dtype, &self.device)?;
        self.blocks = blocks;
        self.head = head;
        log::debug!("Model parameters re-stored as {:?}", dtype);
        Ok(())
    }

    fn set_activation_recompute(&mut self, enabled: bool) {
        // Plain feed-forward blocks keep no activations worth recomputing
        self.recompute = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precision::AutocastGuard;

    fn small() -> MlpConfig {
        MlpConfig {
            input_size: 4,
            hidden_sizes: vec![8],
            n_classes: 3,
            dropout: 0.0,
        }
    }

    #[test]
    fn test_forward_shape() -> crate::Result<()> {
        let device = Device::Cpu;
        let model = MlpClassifier::new(small(), &device)?;

        let x = Tensor::rand(-1f32, 1f32, (5, 4), &device)?;
        let logits = model.forward(&x)?;

        assert_eq!(logits.dims(), &[5, 3]);
        assert_eq!(logits.dtype(), DType::F32);
        // block linear (w, b), norm scale, head (w, b)
        assert_eq!(model.varmap().all_vars().len(), 5);
        Ok(())
    }

    #[test]
    fn test_linear_classifier() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = MlpConfig {
            hidden_sizes: vec![],
            ..small()
        };
        let model = MlpClassifier::new(config, &device)?;
        assert_eq!(model.varmap().all_vars().len(), 2);
        Ok(())
    }

    #[test]
    fn test_to_dtype_recasts_every_parameter() -> crate::Result<()> {
        let device = Device::Cpu;
        let mut model = MlpClassifier::new(small(), &device)?;

        model.to_dtype(DType::BF16)?;
        assert_eq!(model.dtype(), DType::BF16);
        for var in model.varmap().all_vars() {
            assert_eq!(var.dtype(), DType::BF16);
        }

        model.to_dtype(DType::F32)?;
        for var in model.varmap().all_vars() {
            assert_eq!(var.dtype(), DType::F32);
        }
        Ok(())
    }

    #[test]
    fn test_layers_follow_recast_variables() -> crate::Result<()> {
        let device = Device::Cpu;
        let mut model = MlpClassifier::new(small(), &device)?;
        let x = Tensor::rand(-1f32, 1f32, (2, 4), &device)?;

        model.to_dtype(DType::F64)?;
        let logits = model.forward(&x)?;
        assert_eq!(logits.dtype(), DType::F64);
        Ok(())
    }

    #[test]
    fn test_forward_uses_autocast_dtype() -> crate::Result<()> {
        let device = Device::Cpu;
        let model = MlpClassifier::new(small(), &device)?;
        let x = Tensor::rand(-1f32, 1f32, (2, 4), &device)?;

        let _guard = AutocastGuard::enter(DType::F64);
        let logits = model.forward(&x)?;
        assert_eq!(logits.dtype(), DType::F64);
        assert_eq!(model.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn test_invalid_dropout() {
        let config = MlpConfig {
            dropout: 1.0,
            ..small()
        };
        assert!(MlpClassifier::new(config, &Device::Cpu).is_err());
    }

    #[test]
    fn test_dropout_only_in_training() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = MlpConfig {
            dropout: 0.5,
            ..small()
        };
        let mut model = MlpClassifier::new(config, &device)?;
        let x = Tensor::rand(-1f32, 1f32, (16, 4), &device)?;

        assert!(model.is_training());
        assert_eq!(model.forward(&x)?.dims(), &[16, 3]);

        model.set_training(false);
        let a: Vec<Vec<f32>> = model.forward(&x)?.to_vec2()?;
        let b: Vec<Vec<f32>> = model.forward(&x)?.to_vec2()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_bf16_forward_on_cpu() -> crate::Result<()> {
        let device = Device::Cpu;
        let mut model = MlpClassifier::new(small(), &device)?;
        model.to_dtype(DType::BF16)?;
        let x = Tensor::rand(-1f32, 1f32, (3, 4), &device)?;

        let logits = model.forward(&x)?;
        assert_eq!(logits.dtype(), DType::BF16);
        assert_eq!(logits.dims(), &[3, 3]);
        Ok(())
    }
}
