/// Neural network layer primitives
///
/// - Linear projections that follow the active compute dtype
/// - RMS normalisation computed in F32

pub mod linear;
pub mod normalization;

pub use linear::CastedLinear;
pub use normalization::RMSNorm;
