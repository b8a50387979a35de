/// AdamW optimizers with explicit control over precision
///
/// Adam with decoupled weight decay (Loshchilov & Hutter, 2019). Every
/// update is first computed exactly in F32 and only then narrowed into the
/// parameter's storage dtype; the narrowing step is what
/// `StochasticRounding` swaps out.
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};

use crate::precision::OptimizerVariant;
use crate::TrainerError;

/// AdamW optimizer configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    /// Learning rate
    pub lr: f64,
    /// Coefficient for computing running averages of gradient (beta1)
    pub beta1: f64,
    /// Coefficient for computing running averages of squared gradient (beta2)
    pub beta2: f64,
    /// Term added to denominator for numerical stability
    pub eps: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

impl AdamWConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.lr >= 0.0) {
            return Err(TrainerError::Config(format!("lr must be >= 0, got {}", self.lr)));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(TrainerError::Config(format!(
                "betas must lie in [0, 1), got ({}, {})",
                self.beta1, self.beta2
            )));
        }
        if !(self.eps > 0.0) {
            return Err(TrainerError::Config(format!("eps must be > 0, got {}", self.eps)));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(TrainerError::Config(format!(
                "weight_decay must be >= 0, got {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// A parameter's new value, computed in F32 but not yet written back
pub struct ParamUpdate {
    var: Var,
    value: Tensor,
}

impl ParamUpdate {
    pub fn new(var: Var, value: Tensor) -> Self {
        Self { var, value }
    }

    pub fn var(&self) -> &Var {
        &self.var
    }

    /// Exact updated value (F32)
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Narrow to the storage dtype with round-to-nearest and write back
    pub fn commit_nearest(self) -> crate::Result<()> {
        let narrowed = self.value.to_dtype(self.var.dtype())?;
        self.var.set(&narrowed)?;
        Ok(())
    }
}

/// Step / zero-gradient / learning-rate contract shared by every optimizer
pub trait Optimizer {
    /// Compute every parameter's exact new value from `grads`, advancing
    /// internal state, without touching the parameters
    fn compute_updates(&mut self, grads: &GradStore) -> crate::Result<Vec<ParamUpdate>>;

    /// One optimization step, narrowing with round-to-nearest
    fn step(&mut self, grads: &GradStore) -> crate::Result<()> {
        for update in self.compute_updates(grads)? {
            update.commit_nearest()?;
        }
        Ok(())
    }

    /// No-op: candle returns a fresh gradient store from every backward pass
    fn zero_grad(&mut self) {}

    /// Backward pass followed by `step`
    fn backward_step(&mut self, loss: &Tensor) -> crate::Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn vars(&self) -> &[Var];

    /// Whether `step` narrows stochastically
    fn uses_stochastic_rounding(&self) -> bool {
        false
    }
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn compute_updates(&mut self, grads: &GradStore) -> crate::Result<Vec<ParamUpdate>> {
        (**self).compute_updates(grads)
    }

    fn step(&mut self, grads: &GradStore) -> crate::Result<()> {
        (**self).step(grads)
    }

    fn zero_grad(&mut self) {
        (**self).zero_grad()
    }

    fn learning_rate(&self) -> f64 {
        (**self).learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        (**self).set_learning_rate(lr)
    }

    fn vars(&self) -> &[Var] {
        (**self).vars()
    }

    fn uses_stochastic_rounding(&self) -> bool {
        (**self).uses_stochastic_rounding()
    }
}

/// Moment buffers for one parameter
struct MomentState {
    /// First moment estimate (exponential moving average of gradients)
    m: Tensor,
    /// Second moment estimate (exponential moving average of squared gradients)
    v: Tensor,
}

impl MomentState {
    fn zeros(var: &Var, dtype: DType) -> crate::Result<Self> {
        let m = Tensor::zeros(var.shape(), dtype, var.device())?;
        let v = Tensor::zeros(var.shape(), dtype, var.device())?;
        Ok(Self { m, v })
    }
}

/// One AdamW update in F32; returns (new param, m, v)
fn adamw_update(
    config: &AdamWConfig,
    step: usize,
    param: &Tensor,
    grad: &Tensor,
    state: &MomentState,
) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
    let param = param.to_dtype(DType::F32)?;
    let grad = grad.to_dtype(DType::F32)?;
    let m_prev = state.m.to_dtype(DType::F32)?;
    let v_prev = state.v.to_dtype(DType::F32)?;

    // m = beta1 * m + (1 - beta1) * grad
    let m = ((m_prev * config.beta1)? + (&grad * (1.0 - config.beta1))?)?;
    // v = beta2 * v + (1 - beta2) * grad^2
    let v = ((v_prev * config.beta2)? + (grad.sqr()? * (1.0 - config.beta2))?)?;

    let m_hat = (&m / (1.0 - config.beta1.powi(step as i32)))?;
    let v_hat = (&v / (1.0 - config.beta2.powi(step as i32)))?;

    // lr * m_hat / (sqrt(v_hat) + eps)
    let update = ((m_hat / (v_hat.sqrt()? + config.eps)?)? * config.lr)?;

    let decayed = (param * (1.0 - config.lr * config.weight_decay))?;
    Ok(((decayed - update)?, m, v))
}

/// Runs `adamw_update` over every parameter that received a gradient,
/// storing moments in whatever dtype each state already has
fn adamw_updates(
    config: &AdamWConfig,
    step: usize,
    vars: &[Var],
    states: &mut [MomentState],
    grads: &GradStore,
) -> crate::Result<Vec<ParamUpdate>> {
    let mut updates = Vec::with_capacity(vars.len());

    for (var, state) in vars.iter().zip(states.iter_mut()) {
        let Some(grad) = grads.get(var) else {
            continue;
        };

        let (value, m, v) = adamw_update(config, step, var.as_tensor(), grad, state)?;
        state.m = m.to_dtype(state.m.dtype())?;
        state.v = v.to_dtype(state.v.dtype())?;
        updates.push(ParamUpdate::new(var.clone(), value));
    }

    Ok(updates)
}

/// AdamW with F32 moment buffers
///
/// Safe under any parameter dtype: accumulation never happens in BF16.
pub struct AdamW {
    config: AdamWConfig,
    vars: Vec<Var>,
    states: Vec<MomentState>,
    step: usize,
}

impl AdamW {
    /// Create new AdamW optimizer
    ///
    /// # Arguments
    /// * `vars` - Parameters to optimize
    /// * `config` - Optimizer configuration
    pub fn new(vars: Vec<Var>, config: AdamWConfig) -> crate::Result<Self> {
        config.validate()?;
        let states = vars
            .iter()
            .map(|var| MomentState::zeros(var, DType::F32))
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(Self {
            config,
            vars,
            states,
            step: 0,
        })
    }

    /// Dtype of the moment buffers of parameter `index`
    pub fn moment_dtype(&self, index: usize) -> Option<DType> {
        self.states.get(index).map(|s| s.m.dtype())
    }

    pub fn step_count(&self) -> usize {
        self.step
    }
}

impl Optimizer for AdamW {
    fn compute_updates(&mut self, grads: &GradStore) -> crate::Result<Vec<ParamUpdate>> {
        self.step += 1;
        adamw_updates(&self.config, self.step, &self.vars, &mut self.states, grads)
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn vars(&self) -> &[Var] {
        &self.vars
    }
}

/// AdamW whose moment buffers live in each parameter's own dtype
///
/// With BF16 parameters this halves optimizer memory, at the cost of
/// narrowing the moments after every step.
pub struct ReducedAdamW {
    config: AdamWConfig,
    vars: Vec<Var>,
    states: Vec<MomentState>,
    step: usize,
}

impl ReducedAdamW {
    pub fn new(vars: Vec<Var>, config: AdamWConfig) -> crate::Result<Self> {
        config.validate()?;
        let states = vars
            .iter()
            .map(|var| MomentState::zeros(var, var.dtype()))
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(Self {
            config,
            vars,
            states,
            step: 0,
        })
    }

    pub fn moment_dtype(&self, index: usize) -> Option<DType> {
        self.states.get(index).map(|s| s.m.dtype())
    }
}

impl Optimizer for ReducedAdamW {
    fn compute_updates(&mut self, grads: &GradStore) -> crate::Result<Vec<ParamUpdate>> {
        self.step += 1;
        adamw_updates(&self.config, self.step, &self.vars, &mut self.states, grads)
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn vars(&self) -> &[Var] {
        &self.vars
    }
}

/// Build the optimizer a precision policy asks for
pub fn build_optimizer(
    vars: Vec<Var>,
    variant: OptimizerVariant,
    config: AdamWConfig,
) -> crate::Result<Box<dyn Optimizer>> {
    log::info!(
        "Optimizer: {:?} AdamW over {} parameter tensors (lr={}, weight_decay={})",
        variant,
        vars.len(),
        config.lr,
        config.weight_decay
    );

    Ok(match variant {
        OptimizerVariant::Standard => Box::new(AdamW::new(vars, config)?),
        OptimizerVariant::ReducedNative => Box::new(ReducedAdamW::new(vars, config)?),
    })
}
