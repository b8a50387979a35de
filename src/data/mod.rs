/// Data loading for classifier training
pub mod array_dataset;

pub use array_dataset::{ArrayDataLoader, ArrayDataset};

use candle_core::{Result, Tensor, Device};

/// Generic data loader trait
///
/// A finite, restartable sequence of `(inputs, labels)` batches. Labels are
/// `U32` class indices of shape `[batch]`.
pub trait BatchDataLoader {
    /// Get next batch of (input, label) tensors
    fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    /// Get total number of batches
    fn num_batches(&self) -> usize;
}
