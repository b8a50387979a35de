/// In-memory classification dataset backed by ndarray, loadable from .npy
use candle_core::{Result, Tensor, Device};
use ndarray::{Array1, Array2, Axis};
use ndarray_npy::ReadNpyExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs::File;
use std::path::Path;

/// Dense feature matrix plus one class label per row
pub struct ArrayDataset {
    inputs: Array2<f32>,        // [N, n_features]
    labels: Array1<u32>,        // [N]
}

impl ArrayDataset {
    pub fn new(inputs: Array2<f32>, labels: Array1<u32>) -> crate::Result<Self> {
        if inputs.nrows() != labels.len() {
            return Err(crate::TrainerError::Config(format!(
                "Shape mismatch: {} input rows != {} labels",
                inputs.nrows(),
                labels.len()
            )));
        }
        Ok(Self { inputs, labels })
    }

    /// Load `<split>_inputs.npy` (f32, 2-D) and `<split>_labels.npy` (i64, 1-D)
    pub fn from_npy_dir<P: AsRef<Path>>(dir: P, split: &str) -> crate::Result<Self> {
        let dir = dir.as_ref();
        log::info!("Loading '{}' split from: {:?}", split, dir);

        let inputs_path = dir.join(format!("{}_inputs.npy", split));
        let inputs = <Array2<f32> as ReadNpyExt>::read_npy(File::open(&inputs_path)?)
            .map_err(|e| std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to read {:?}: {}", inputs_path, e)
            ))?;

        // numpy defaults to int64 labels
        let labels_path = dir.join(format!("{}_labels.npy", split));
        let labels_i64 = <Array1<i64> as ReadNpyExt>::read_npy(File::open(&labels_path)?)
            .map_err(|e| std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to read {:?}: {}", labels_path, e)
            ))?;

        if let Some(bad) = labels_i64.iter().find(|&&y| y < 0 || y > u32::MAX as i64) {
            return Err(crate::TrainerError::Config(format!(
                "Label {} in {:?} is not a valid class index",
                bad, labels_path
            )));
        }
        let labels = labels_i64.mapv(|y| y as u32);

        log::info!(
            "Loaded '{}': {} examples, {} features",
            split,
            inputs.nrows(),
            inputs.ncols()
        );

        Self::new(inputs, labels)
    }

    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }

    pub fn n_features(&self) -> usize {
        self.inputs.ncols()
    }

    pub fn labels(&self) -> &Array1<u32> {
        &self.labels
    }
}

/// Batching loader over an `ArrayDataset`
pub struct ArrayDataLoader {
    dataset: ArrayDataset,
    batch_size: usize,
    current_idx: usize,
    indices: Vec<usize>,
    shuffle: bool,
    rng: StdRng,
}

impl ArrayDataLoader {
    pub fn new(dataset: ArrayDataset, batch_size: usize, shuffle: bool) -> Self {
        Self::with_rng(dataset, batch_size, shuffle, StdRng::from_entropy())
    }

    /// Loader with a reproducible shuffle order
    pub fn seeded(dataset: ArrayDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self::with_rng(dataset, batch_size, shuffle, StdRng::seed_from_u64(seed))
    }

    fn with_rng(dataset: ArrayDataset, batch_size: usize, shuffle: bool, mut rng: StdRng) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        if shuffle {
            indices.shuffle(&mut rng);
        }

        Self {
            dataset,
            batch_size: batch_size.max(1),
            current_idx: 0,
            indices,
            shuffle,
            rng,
        }
    }

    pub fn dataset(&self) -> &ArrayDataset {
        &self.dataset
    }
}

impl super::BatchDataLoader for ArrayDataLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>> {
        if self.current_idx >= self.indices.len() {
            return Ok(None);
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.current_idx..end_idx];
        self.current_idx = end_idx;

        let inputs = self.dataset.inputs.select(Axis(0), batch_indices);
        let labels: Vec<u32> = batch_indices.iter().map(|&i| self.dataset.labels[i]).collect();

        let shape = (batch_indices.len(), self.dataset.n_features());
        let input_tensor = Tensor::from_iter(inputs.iter().copied(), device)?.reshape(shape)?;
        let label_tensor = Tensor::from_vec(labels, batch_indices.len(), device)?;

        Ok(Some((input_tensor, label_tensor)))
    }

    fn reset(&mut self) {
        self.current_idx = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    fn num_batches(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BatchDataLoader;
    use ndarray::array;
    use ndarray_npy::WriteNpyExt;

    fn toy() -> ArrayDataset {
        let inputs = array![[1.0f32, 0.0], [2.0, 0.0], [3.0, 0.0], [4.0, 0.0], [5.0, 0.0]];
        let labels = array![0u32, 1, 0, 1, 0];
        ArrayDataset::new(inputs, labels).unwrap()
    }

    #[test]
    fn test_shape_mismatch() {
        let inputs = Array2::<f32>::zeros((3, 2));
        let labels = Array1::<u32>::zeros(2);
        assert!(ArrayDataset::new(inputs, labels).is_err());
    }

    #[test]
    fn test_batches_cover_dataset_once() -> Result<()> {
        let device = Device::Cpu;
        let mut loader = ArrayDataLoader::new(toy(), 2, false);
        assert_eq!(loader.num_batches(), 3);

        let mut firsts = Vec::new();
        let mut sizes = Vec::new();
        while let Some((x, y)) = loader.next_batch(&device)? {
            assert_eq!(x.dims()[1], 2);
            assert_eq!(y.dtype(), candle_core::DType::U32);
            sizes.push(x.dims()[0]);
            firsts.extend(x.get_on_dim(1, 0)?.to_vec1::<f32>()?);
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(firsts, vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        loader.reset();
        assert!(loader.next_batch(&device)?.is_some());
        Ok(())
    }

    #[test]
    fn test_shuffle_keeps_pairs() -> Result<()> {
        let device = Device::Cpu;
        let mut loader = ArrayDataLoader::seeded(toy(), 5, true, 7);
        let (x, y) = loader.next_batch(&device)?.unwrap();
        let xs = x.get_on_dim(1, 0)?.to_vec1::<f32>()?;
        let ys = y.to_vec1::<u32>()?;
        for (x, y) in xs.iter().zip(ys.iter()) {
            assert_eq!(*y, if *x as u32 % 2 == 0 { 1 } else { 0 });
        }
        Ok(())
    }

    #[test]
    fn test_from_npy_dir() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let inputs = array![[0.5f32, -1.0], [1.5, 2.0]];
        let labels = array![1i64, 0];
        inputs
            .write_npy(File::create(dir.path().join("train_inputs.npy"))?)
            .unwrap();
        labels
            .write_npy(File::create(dir.path().join("train_labels.npy"))?)
            .unwrap();

        let dataset = ArrayDataset::from_npy_dir(dir.path(), "train")?;
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.n_features(), 2);
        assert_eq!(dataset.labels().to_vec(), vec![1, 0]);
        Ok(())
    }

    #[test]
    fn test_negative_label_rejected() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        array![[0.0f32]]
            .write_npy(File::create(dir.path().join("test_inputs.npy"))?)
            .unwrap();
        array![-1i64]
            .write_npy(File::create(dir.path().join("test_labels.npy"))?)
            .unwrap();

        assert!(ArrayDataset::from_npy_dir(dir.path(), "test").is_err());
        Ok(())
    }
}
