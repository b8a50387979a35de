/// Precision modes and the policy they resolve to
///
/// A run picks exactly one `PrecisionMode`. Everything downstream (model
/// storage dtype, autocast region, optimizer variant, rounding strategy)
/// depends only on the resolved `PrecisionPolicy`, never on the mode string.
use std::cell::Cell;
use std::fmt;
use std::str::FromStr;

use candle_core::DType;

use crate::TrainerError;

/// Full-precision dtype
pub const FULL_DTYPE: DType = DType::F32;

/// Reduced-precision dtype used for storage and compute
pub const REDUCED_DTYPE: DType = DType::BF16;

/// Closed set of precision regimes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrecisionMode {
    /// F32 storage, F32 compute
    Full,
    /// BF16 storage, BF16 compute
    Reduced,
    /// BF16 storage with stochastically rounded updates
    ReducedStochastic,
    /// F32 storage, BF16 compute, activations recomputed in backward
    ReducedRecompute,
    /// `ReducedRecompute` with stochastically rounded updates
    ReducedStochasticRecompute,
    /// BF16 storage with the reduced-native optimizer
    ReducedAltOptimizer,
}

impl PrecisionMode {
    pub const ALL: [PrecisionMode; 6] = [
        PrecisionMode::Full,
        PrecisionMode::Reduced,
        PrecisionMode::ReducedStochastic,
        PrecisionMode::ReducedRecompute,
        PrecisionMode::ReducedStochasticRecompute,
        PrecisionMode::ReducedAltOptimizer,
    ];

    /// Canonical configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Reduced => "reduced",
            Self::ReducedStochastic => "reduced+sr",
            Self::ReducedRecompute => "reduced+recompute",
            Self::ReducedStochasticRecompute => "reduced+sr+recompute",
            Self::ReducedAltOptimizer => "reduced+alt-optimizer",
        }
    }

    /// Resolve this mode into the dtypes and update strategy of a run
    pub fn resolve(&self) -> PrecisionPolicy {
        let (weight_dtype, compute_dtype) = match self {
            Self::Full => (FULL_DTYPE, FULL_DTYPE),
            Self::Reduced | Self::ReducedStochastic | Self::ReducedAltOptimizer => {
                (REDUCED_DTYPE, REDUCED_DTYPE)
            }
            // Recompute variants only narrow the compute path
            Self::ReducedRecompute | Self::ReducedStochasticRecompute => {
                (FULL_DTYPE, REDUCED_DTYPE)
            }
        };

        let optimizer = match self {
            Self::ReducedAltOptimizer => OptimizerVariant::ReducedNative,
            _ => OptimizerVariant::Standard,
        };

        PrecisionPolicy {
            mode: *self,
            weight_dtype,
            compute_dtype,
            optimizer,
            stochastic_rounding: matches!(
                self,
                Self::ReducedStochastic | Self::ReducedStochasticRecompute
            ),
            activation_recompute: matches!(
                self,
                Self::ReducedRecompute | Self::ReducedStochasticRecompute
            ),
        }
    }
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrecisionMode {
    type Err = TrainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" | "float32" | "fp32" => Ok(Self::Full),
            "reduced" | "bfloat16" => Ok(Self::Reduced),
            "reduced+sr" | "bfloat16_sr" => Ok(Self::ReducedStochastic),
            "reduced+recompute" | "bfloat16_ac" => Ok(Self::ReducedRecompute),
            "reduced+sr+recompute" | "bfloat16_sr_ac" => Ok(Self::ReducedStochasticRecompute),
            "reduced+alt-optimizer" | "bfloat16_alt" => Ok(Self::ReducedAltOptimizer),
            other => Err(TrainerError::Config(format!(
                "unknown precision mode '{}', expected one of: {}",
                other,
                Self::ALL.map(|m| m.as_str()).join(", ")
            ))),
        }
    }
}

/// Which AdamW implementation updates the parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerVariant {
    /// Moments accumulated in F32 whatever the parameter dtype
    Standard,
    /// Moments stored in the parameter dtype
    ReducedNative,
}

/// Resolved precision choices for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    pub mode: PrecisionMode,
    /// Dtype parameters are stored in during training
    pub weight_dtype: DType,
    /// Dtype of the autocast region wrapping the training loop
    pub compute_dtype: DType,
    pub optimizer: OptimizerVariant,
    pub stochastic_rounding: bool,
    /// Hint for the model: recompute activations instead of caching them
    pub activation_recompute: bool,
}

thread_local! {
    static AUTOCAST: Cell<Option<DType>> = const { Cell::new(None) };
}

/// Compute dtype of the innermost active autocast region, if any
pub fn autocast_dtype() -> Option<DType> {
    AUTOCAST.with(|c| c.get())
}

/// Scoped compute-dtype region
///
/// Installs `dtype` as the thread's compute dtype until dropped, then
/// restores whatever was active before. Regions nest.
#[must_use = "the autocast region ends when the guard is dropped"]
pub struct AutocastGuard {
    previous: Option<DType>,
}

impl AutocastGuard {
    pub fn enter(dtype: DType) -> Self {
        let previous = AUTOCAST.with(|c| c.replace(Some(dtype)));
        log::debug!("Entering autocast region: {:?}", dtype);
        Self { previous }
    }
}

impl Drop for AutocastGuard {
    fn drop(&mut self) {
        AUTOCAST.with(|c| c.set(self.previous));
    }
}
