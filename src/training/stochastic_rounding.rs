/// Stochastic rounding of optimizer updates
///
/// Narrowing F32 to BF16 with round-to-nearest drops any update smaller than
/// half a BF16 ulp, so many small steps in a row can leave a parameter
/// exactly where it was. Rounding up with probability equal to the fractional
/// distance to the upper neighbour makes the expected narrowed value equal to
/// the exact one.
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::optimizer::{Optimizer, ParamUpdate};

/// 16-bit float formats that can be narrowed into
trait HalfFloat: Copy {
    fn from_f32(x: f32) -> Self;
    fn to_f32(self) -> f32;
    fn to_bits(self) -> u16;
    fn from_bits(bits: u16) -> Self;
}

impl HalfFloat for bf16 {
    fn from_f32(x: f32) -> Self {
        bf16::from_f32(x)
    }
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
    fn to_bits(self) -> u16 {
        bf16::to_bits(self)
    }
    fn from_bits(bits: u16) -> Self {
        bf16::from_bits(bits)
    }
}

impl HalfFloat for f16 {
    fn from_f32(x: f32) -> Self {
        f16::from_f32(x)
    }
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
    fn to_bits(self) -> u16 {
        f16::to_bits(self)
    }
    fn from_bits(bits: u16) -> Self {
        f16::from_bits(bits)
    }
}

const SIGN: u16 = 0x8000;

/// Next representable value towards +inf (finite, non-NaN input)
fn next_up<T: HalfFloat>(x: T) -> T {
    let bits = x.to_bits();
    if bits & !SIGN == 0 {
        T::from_bits(0x0001)
    } else if bits & SIGN == 0 {
        T::from_bits(bits + 1)
    } else {
        T::from_bits(bits - 1)
    }
}

/// Next representable value towards -inf (finite, non-NaN input)
fn next_down<T: HalfFloat>(x: T) -> T {
    let bits = x.to_bits();
    if bits & !SIGN == 0 {
        T::from_bits(SIGN | 0x0001)
    } else if bits & SIGN == 0 {
        T::from_bits(bits - 1)
    } else {
        T::from_bits(bits + 1)
    }
}

/// Round `x` to one of its two neighbours; `u` is uniform in [0, 1)
fn round_with<T: HalfFloat>(x: f32, u: f64) -> T {
    let nearest = T::from_f32(x);
    let nearest_f = nearest.to_f32();
    if !x.is_finite() || !nearest_f.is_finite() || nearest_f == x {
        return nearest;
    }

    let (lo, hi) = if nearest_f < x {
        (nearest, next_up(nearest))
    } else {
        (next_down(nearest), nearest)
    };
    let (lo_f, hi_f) = (lo.to_f32() as f64, hi.to_f32() as f64);
    // Past the largest finite value; saturate like round-to-nearest
    if !lo_f.is_finite() || !hi_f.is_finite() {
        return nearest;
    }

    let p_up = (x as f64 - lo_f) / (hi_f - lo_f);
    if u < p_up {
        hi
    } else {
        lo
    }
}

/// Stochastically round one value to BF16
pub fn stochastic_round_bf16<R: Rng>(x: f32, rng: &mut R) -> bf16 {
    round_with(x, rng.gen::<f64>())
}

/// Stochastically round one value to F16
pub fn stochastic_round_f16<R: Rng>(x: f32, rng: &mut R) -> f16 {
    round_with(x, rng.gen::<f64>())
}

/// Narrow `value` to `dtype`, rounding stochastically into 16-bit formats
///
/// Wider targets are handled by a plain cast; F32 updates are exact there.
pub fn stochastic_round<R: Rng>(
    value: &Tensor,
    dtype: DType,
    rng: &mut R,
) -> candle_core::Result<Tensor> {
    let shape = value.dims().to_vec();
    match dtype {
        DType::BF16 => {
            let exact = value.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            let rounded: Vec<bf16> = exact.iter().map(|&x| stochastic_round_bf16(x, &mut *rng)).collect();
            Tensor::from_vec(rounded, shape, value.device())
        }
        DType::F16 => {
            let exact = value.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            let rounded: Vec<f16> = exact.iter().map(|&x| stochastic_round_f16(x, &mut *rng)).collect();
            Tensor::from_vec(rounded, shape, value.device())
        }
        _ => value.to_dtype(dtype),
    }
}

impl ParamUpdate {
    /// Narrow to the storage dtype with stochastic rounding and write back
    pub fn commit_stochastic<R: Rng>(self, rng: &mut R) -> crate::Result<()> {
        let var = self.var().clone();
        let narrowed = stochastic_round(self.value(), var.dtype(), rng)?;
        var.set(&narrowed)?;
        Ok(())
    }
}

/// Optimizer decorator that narrows every update stochastically
///
/// Owns the wrapped optimizer; moments, step counts and learning rate all
/// stay with it. Only the final write into parameter storage changes.
pub struct StochasticRounding<O> {
    inner: O,
    rng: StdRng,
}

impl<O: Optimizer> StochasticRounding<O> {
    pub fn new(inner: O, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { inner, rng }
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    pub fn into_inner(self) -> O {
        self.inner
    }
}

impl<O: Optimizer> Optimizer for StochasticRounding<O> {
    fn compute_updates(&mut self, grads: &GradStore) -> crate::Result<Vec<ParamUpdate>> {
        self.inner.compute_updates(grads)
    }

    fn step(&mut self, grads: &GradStore) -> crate::Result<()> {
        for update in self.inner.compute_updates(grads)? {
            update.commit_stochastic(&mut self.rng)?;
        }
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.inner.zero_grad()
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr)
    }

    fn vars(&self) -> &[Var] {
        self.inner.vars()
    }

    fn uses_stochastic_rounding(&self) -> bool {
        true
    }
}

/// Wrap `optimizer` in stochastic rounding when `enabled`
///
/// Returns the optimizer untouched when disabled or already wrapped.
pub fn apply_stochastic_rounding(
    optimizer: Box<dyn Optimizer>,
    enabled: bool,
    seed: Option<u64>,
) -> Box<dyn Optimizer> {
    if !enabled || optimizer.uses_stochastic_rounding() {
        return optimizer;
    }
    log::info!("Stochastic rounding enabled for parameter updates");
    if !narrows_storage(optimizer.vars()) {
        log::info!("Parameters are stored in full precision; stochastic rounding has no effect");
    }
    Box::new(StochasticRounding::new(optimizer, seed))
}

/// Whether any parameter is stored in a 16-bit format, where rounding matters
pub fn narrows_storage(vars: &[Var]) -> bool {
    vars.iter()
        .any(|v| matches!(v.dtype(), DType::BF16 | DType::F16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precision::OptimizerVariant;
    use crate::training::optimizer::tests::grads_for;
    use crate::training::optimizer::{build_optimizer, AdamWConfig};
    use candle_core::Device;

    const BF16_ULP_AT_ONE: f32 = 0.0078125; // 2^-7

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_representable_values_are_exact() {
        let mut rng = rng();
        for x in [0.0f32, -0.0, 1.0, -2.5, 1.0 + BF16_ULP_AT_ONE, f32::INFINITY] {
            for _ in 0..16 {
                assert_eq!(stochastic_round_bf16(x, &mut rng).to_f32(), x);
            }
        }
        assert!(stochastic_round_bf16(f32::NAN, &mut rng).is_nan());
    }

    #[test]
    fn test_result_is_a_neighbour() {
        let mut rng = rng();
        let x = 1.0 + 0.3 * BF16_ULP_AT_ONE;
        for _ in 0..100 {
            let r = stochastic_round_bf16(x, &mut rng).to_f32();
            assert!(r == 1.0 || r == 1.0 + BF16_ULP_AT_ONE, "got {}", r);
        }
    }

    #[test]
    fn test_unbiased_in_expectation() {
        let mut rng = rng();
        let n = 20_000;
        for x in [
            1.0 + 0.3 * BF16_ULP_AT_ONE,
            -1.0 - 0.85 * BF16_ULP_AT_ONE,
            3.0e-3f32,
            -7.77e2,
        ] {
            let mean: f64 = (0..n)
                .map(|_| stochastic_round_bf16(x, &mut rng).to_f32() as f64)
                .sum::<f64>()
                / n as f64;
            let lo = bf16::from_f32(x);
            let ulp = (next_up(lo).to_f32() - next_down(lo).to_f32()).abs() as f64 / 2.0;
            assert!(
                (mean - x as f64).abs() < 0.05 * ulp,
                "x={} mean={} ulp={}",
                x,
                mean,
                ulp
            );
        }
    }

    #[test]
    fn test_f16_unbiased() {
        let mut rng = rng();
        let x = 1.0f32 + 0.25 * 0.000_976_562_5; // quarter of an f16 ulp at 1.0
        let n = 20_000;
        let mean: f64 = (0..n)
            .map(|_| stochastic_round_f16(x, &mut rng).to_f32() as f64)
            .sum::<f64>()
            / n as f64;
        assert!((mean - x as f64).abs() < 1e-4);
    }

    #[test]
    fn test_tiny_values_around_zero() {
        let mut rng = rng();
        let x = 2.0e-41f32; // below bf16's smallest subnormal
        for _ in 0..100 {
            let r = stochastic_round_bf16(x, &mut rng).to_f32();
            assert!(r >= 0.0 && r <= bf16::from_bits(1).to_f32());
        }
        let r = stochastic_round_bf16(-x, &mut rng).to_f32();
        assert!(r <= 0.0);
    }

    #[test]
    fn test_overflow_saturates_like_nearest() {
        let mut rng = rng();
        let x = f32::MAX;
        assert_eq!(
            stochastic_round_bf16(x, &mut rng).to_bits(),
            bf16::from_f32(x).to_bits()
        );
    }

    #[test]
    fn test_small_updates_are_not_starved() {
        let mut rng = rng();
        let step = 1.0e-3f32; // well below half a bf16 ulp at 1.0
        let steps = 500;

        let mut nearest = bf16::from_f32(1.0);
        let mut stochastic = bf16::from_f32(1.0);
        for _ in 0..steps {
            nearest = bf16::from_f32(nearest.to_f32() + step);
            stochastic = stochastic_round_bf16(stochastic.to_f32() + step, &mut rng);
        }

        assert_eq!(nearest.to_f32(), 1.0);
        let expected = 1.0 + step * steps as f32;
        assert!((stochastic.to_f32() - expected).abs() < 0.3, "got {}", stochastic.to_f32());
    }

    #[test]
    fn test_tensor_rounding_keeps_shape_and_dtype() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let value = Tensor::new(&[[1.001f32, -2.0], [0.5, 3.3]], &device)?;
        let mut rng = rng();

        let rounded = stochastic_round(&value, DType::BF16, &mut rng)?;
        assert_eq!(rounded.dtype(), DType::BF16);
        assert_eq!(rounded.dims(), &[2, 2]);

        let full = stochastic_round(&value, DType::F32, &mut rng)?;
        assert_eq!(full.to_vec2::<f32>()?, value.to_vec2::<f32>()?);
        Ok(())
    }

    fn run_steps(optimizer: &mut dyn Optimizer, var: &Var, grads: &[Tensor]) -> crate::Result<Vec<Vec<f32>>> {
        let mut trace = Vec::new();
        for grad in grads {
            optimizer.step(&grads_for(var, grad)?)?;
            trace.push(var.as_tensor().to_dtype(DType::F32)?.to_vec1::<f32>()?);
        }
        Ok(trace)
    }

    #[test]
    fn test_disabled_patch_is_identity() -> crate::Result<()> {
        let device = Device::Cpu;
        let init = Tensor::new(&[1.0f32, -0.5, 0.25, 2.0], &device)?.to_dtype(DType::BF16)?;
        let grads: Vec<Tensor> = (0..5)
            .map(|i| Tensor::new(&[0.1f32 * i as f32, -0.2, 0.05, 1.0], &device))
            .collect::<candle_core::Result<_>>()?;
        let config = AdamWConfig { lr: 0.01, ..Default::default() };

        let plain_var = Var::from_tensor(&init.copy()?)?;
        let mut plain = build_optimizer(vec![plain_var.clone()], OptimizerVariant::Standard, config.clone())?;
        let plain_trace = run_steps(&mut plain, &plain_var, &grads)?;

        let patched_var = Var::from_tensor(&init.copy()?)?;
        let inner = build_optimizer(vec![patched_var.clone()], OptimizerVariant::Standard, config)?;
        let mut patched = apply_stochastic_rounding(inner, false, Some(7));
        assert!(!patched.uses_stochastic_rounding());
        let patched_trace = run_steps(&mut patched, &patched_var, &grads)?;

        assert_eq!(plain_trace, patched_trace);
        Ok(())
    }

    #[test]
    fn test_apply_is_idempotent() -> crate::Result<()> {
        let device = Device::Cpu;
        let var = Var::ones((2,), DType::BF16, &device)?;
        let optimizer = build_optimizer(vec![var], OptimizerVariant::ReducedNative, AdamWConfig::default())?;

        let once = apply_stochastic_rounding(optimizer, true, Some(1));
        assert!(once.uses_stochastic_rounding());
        let twice = apply_stochastic_rounding(once, true, Some(1));
        assert!(twice.uses_stochastic_rounding());
        assert_eq!(twice.vars().len(), 1);
        Ok(())
    }

    #[test]
    fn test_wrapper_keeps_interface() -> crate::Result<()> {
        let device = Device::Cpu;
        let var = Var::ones((3,), DType::BF16, &device)?;
        let inner = build_optimizer(vec![var.clone()], OptimizerVariant::Standard, AdamWConfig::default())?;
        let mut optimizer = StochasticRounding::new(inner, Some(3));

        optimizer.set_learning_rate(0.05);
        assert_eq!(optimizer.learning_rate(), 0.05);
        assert_eq!(optimizer.inner().learning_rate(), 0.05);

        optimizer.zero_grad();
        optimizer.step(&grads_for(&var, &Tensor::new(&[1.0f32, 1.0, 1.0], &device)?)?)?;
        assert_eq!(var.dtype(), DType::BF16);
        let after = var.as_tensor().to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert!(after.iter().all(|&v| v < 1.0));
        Ok(())
    }

    #[test]
    fn test_seeded_wrappers_agree() -> crate::Result<()> {
        let device = Device::Cpu;
        let grad = Tensor::new(&[0.3f32, -0.7], &device)?;
        let mut traces = Vec::new();

        for _ in 0..2 {
            let var = Var::ones((2,), DType::BF16, &device)?;
            let inner = build_optimizer(
                vec![var.clone()],
                OptimizerVariant::Standard,
                AdamWConfig { lr: 1e-3, ..Default::default() },
            )?;
            let mut optimizer = apply_stochastic_rounding(inner, true, Some(11));
            traces.push(run_steps(&mut optimizer, &var, &[grad.clone(), grad.clone(), grad.clone()])?);
        }

        assert_eq!(traces[0], traces[1]);
        Ok(())
    }

    #[test]
    fn test_full_precision_storage_is_plain_cast() -> crate::Result<()> {
        let device = Device::Cpu;
        let init = Tensor::new(&[0.3f32, -1.7, 2.25], &device)?;
        let grad = Tensor::new(&[0.01f32, -0.2, 0.5], &device)?;

        let plain_var = Var::from_tensor(&init)?;
        let wrapped_var = Var::from_tensor(&init)?;
        assert!(!narrows_storage(&[plain_var.clone(), wrapped_var.clone()]));

        let config = AdamWConfig { lr: 0.05, ..Default::default() };
        let mut plain = build_optimizer(vec![plain_var.clone()], OptimizerVariant::Standard, config.clone())?;
        let mut wrapped = apply_stochastic_rounding(
            build_optimizer(vec![wrapped_var.clone()], OptimizerVariant::Standard, config)?,
            true,
            Some(3),
        );
        assert!(wrapped.uses_stochastic_rounding());

        for _ in 0..5 {
            plain.step(&grads_for(&plain_var, &grad)?)?;
            wrapped.step(&grads_for(&wrapped_var, &grad)?)?;
        }
        assert_eq!(
            plain_var.as_tensor().to_vec1::<f32>()?,
            wrapped_var.as_tensor().to_vec1::<f32>()?
        );

        let reduced = Var::from_tensor(&init.to_dtype(DType::BF16)?)?;
        assert!(narrows_storage(&[plain_var, reduced]));
        Ok(())
    }
}
