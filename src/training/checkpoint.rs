/// Model checkpointing with safetensors
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::tensor::SafeTensors;

use crate::TrainerError;

/// File name of the single, overwritten checkpoint inside a run directory
pub const CHECKPOINT_FILE: &str = "model.safetensors";

/// Header key the training state is stored under
const METADATA_KEY: &str = "training_state";

/// Training state stored next to the weights
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// Last completed epoch (0-based)
    pub epoch: usize,
    /// Learning rate used in that epoch
    pub lr: f64,
    /// Best held-out accuracy so far
    pub best_accuracy: f64,
    /// Precision mode the weights were trained under
    pub precision: String,
}

/// One checkpoint slot in a run directory
///
/// Every save replaces the previous file; a reader never observes a
/// half-written checkpoint because the bytes go to a temporary file first.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Write every variable of `varmap` in its current dtype
    pub fn save(&self, varmap: &VarMap, metadata: &CheckpointMetadata) -> crate::Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let tensors: Vec<(String, Tensor)> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| TrainerError::Checkpoint("parameter map lock poisoned".to_string()))?;
            data.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect()
        };

        let mut header = HashMap::new();
        header.insert(METADATA_KEY.to_string(), serde_json::to_string(metadata)?);

        let final_path = self.path();
        let tmp_path = final_path.with_extension("safetensors.tmp");
        safetensors::serialize_to_file(tensors, &Some(header), &tmp_path)
            .map_err(|e| TrainerError::Checkpoint(format!("failed to write {:?}: {}", tmp_path, e)))?;
        std::fs::rename(&tmp_path, &final_path)?;

        log::debug!("Checkpoint written to {:?} (epoch {})", final_path, metadata.epoch + 1);
        Ok(())
    }

    /// Load all stored tensors onto `device`
    pub fn load(&self, device: &Device) -> crate::Result<HashMap<String, Tensor>> {
        let path = self.path();
        if !path.is_file() {
            return Err(TrainerError::Checkpoint(format!("no checkpoint at {:?}", path)));
        }
        Ok(candle_core::safetensors::load(&path, device)?)
    }

    /// Overwrite every variable in `varmap` with its stored value
    ///
    /// Stored tensors are cast to each variable's current dtype, so a
    /// checkpoint written in one precision mode loads into any other.
    pub fn load_into(&self, varmap: &VarMap, device: &Device) -> crate::Result<()> {
        let stored = self.load(device)?;
        let data = varmap
            .data()
            .lock()
            .map_err(|_| TrainerError::Checkpoint("parameter map lock poisoned".to_string()))?;

        for (name, var) in data.iter() {
            let tensor = stored
                .get(name)
                .ok_or_else(|| TrainerError::Checkpoint(format!("missing tensor '{}'", name)))?;
            if tensor.dims() != var.dims() {
                return Err(TrainerError::Checkpoint(format!(
                    "shape mismatch for '{}': stored {:?}, model {:?}",
                    name,
                    tensor.dims(),
                    var.dims()
                )));
            }
            var.set(&tensor.to_dtype(var.dtype())?)?;
        }

        log::info!("Loaded {} parameters from {:?}", data.len(), self.path());
        Ok(())
    }

    /// Training state from the checkpoint header, if any was recorded
    pub fn read_metadata(&self) -> crate::Result<Option<CheckpointMetadata>> {
        let buffer = std::fs::read(self.path())?;
        let (_, header) = SafeTensors::read_metadata(&buffer)
            .map_err(|e| TrainerError::Checkpoint(format!("unreadable header: {}", e)))?;

        match header.metadata().as_ref().and_then(|m| m.get(METADATA_KEY)) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }
}
