//! Checkpointing and Serialization.
//!
//! Tensors are stored in the `safetensors` format. A training checkpoint is a directory per
//! save point:
//!
//! ```text
//! <work_dir>/ckpt-<step, zero-padded to the width of total_steps>/
//! ├── training_state.json          (authoritative rank only)
//! ├── rank_0/model.safetensors
//! ├── rank_0/optimizer.safetensors (unless the optimizer is dropped)
//! ├── rank_1/...
//! ```
//!
//! Every rank writes only its own shard files. Shard files are never overwritten.

use crate::error::{Error, Result, config_err};
use crate::optim::SchedulerState;
use crate::tensor::{DType, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

pub const CHECKPOINT_VERSION: u32 = 1;

const MODEL_FILE: &str = "model.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.safetensors";
const STATE_FILE: &str = "training_state.json";

fn to_safetensors_dtype(dtype: DType) -> Dtype {
    match dtype {
        DType::F32 => Dtype::F32,
        DType::F16 => Dtype::F16,
        DType::BF16 => Dtype::BF16,
    }
}

fn from_safetensors_dtype(dtype: Dtype) -> Result<DType> {
    match dtype {
        Dtype::F32 => Ok(DType::F32),
        Dtype::F16 => Ok(DType::F16),
        Dtype::BF16 => Ok(DType::BF16),
        other => Err(Error::SafeTensors(format!("unsupported dtype {other:?}"))),
    }
}

/// Saves a map of tensors to a safetensors file.
pub fn save_tensors<P: AsRef<Path>>(
    path: P,
    tensors: &BTreeMap<String, Tensor>,
    metadata: Option<HashMap<String, String>>,
) -> Result<()> {
    // Views borrow the encoded bytes, which must outlive them.
    let encoded: Vec<(&String, &Tensor, Vec<u8>)> = tensors
        .iter()
        .map(|(name, t)| (name, t, t.to_le_bytes()))
        .collect();

    let mut views = HashMap::new();
    for (name, tensor, bytes) in &encoded {
        let view = TensorView::new(
            to_safetensors_dtype(tensor.dtype()),
            tensor.shape().to_vec(),
            bytes,
        )?;
        views.insert((*name).clone(), view);
    }

    safetensors::serialize_to_file(&views, metadata, path.as_ref())?;
    Ok(())
}

/// Decodes every tensor of a safetensors buffer.
pub fn tensors_from_bytes(bytes: &[u8]) -> Result<BTreeMap<String, Tensor>> {
    let safetensors = SafeTensors::deserialize(bytes)?;
    let mut tensors = BTreeMap::new();
    for (name, view) in safetensors.tensors() {
        let dtype = from_safetensors_dtype(view.dtype())?;
        let tensor = Tensor::from_le_bytes(view.data(), view.shape(), dtype)?;
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

/// Loads a map of tensors from a safetensors file.
pub fn load_tensors<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, Tensor>> {
    let file_content = std::fs::read(path)?;
    tensors_from_bytes(&file_content)
}

/// `<work_dir>/ckpt-<step>` with `step` zero-padded to the number of digits in `total_steps`.
pub fn checkpoint_dir(work_dir: &Path, step: usize, total_steps: usize) -> PathBuf {
    let width = total_steps.to_string().len();
    work_dir.join(format!("ckpt-{step:0width$}"))
}

/// Loop position persisted next to the shards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub version: u32,
    /// Index of the last completed optimizer step.
    pub step: usize,
    pub total_steps: usize,
    pub warmup: SchedulerState,
    pub main: SchedulerState,
    /// World size that wrote the shards; resuming requires the same layout.
    pub world_size: usize,
}

impl TrainingState {
    /// Derived, never stored.
    pub fn epoch(&self, per_epoch_steps: usize) -> usize {
        self.step / per_epoch_steps.max(1)
    }
}

/// Writes one rank's part of a checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointWriter {
    rank: usize,
    world_size: usize,
    drop_optimizer: bool,
}

impl CheckpointWriter {
    pub fn new(rank: usize, world_size: usize, drop_optimizer: bool) -> Self {
        Self {
            rank,
            world_size,
            drop_optimizer,
        }
    }

    pub fn rank_dir(&self, dir: &Path) -> PathBuf {
        dir.join(format!("rank_{}", self.rank))
    }

    /// Persists this rank's shards; the authoritative rank also writes `training_state.json`.
    ///
    /// # Errors
    ///
    /// `Configuration` if this rank already wrote a shard into `dir`.
    pub fn save(
        &self,
        dir: &Path,
        model_state: &BTreeMap<String, Tensor>,
        optimizer_state: &BTreeMap<String, Tensor>,
        training_state: &TrainingState,
        authoritative: bool,
    ) -> Result<()> {
        let rank_dir = self.rank_dir(dir);
        let model_path = rank_dir.join(MODEL_FILE);
        if model_path.exists() {
            return Err(config_err(format!(
                "refusing to overwrite existing checkpoint shard {}",
                model_path.display()
            )));
        }
        std::fs::create_dir_all(&rank_dir)?;

        let metadata = HashMap::from([
            ("rank".to_string(), self.rank.to_string()),
            ("world_size".to_string(), self.world_size.to_string()),
            ("step".to_string(), training_state.step.to_string()),
        ]);
        save_tensors(&model_path, model_state, Some(metadata.clone()))?;
        if !self.drop_optimizer {
            save_tensors(rank_dir.join(OPTIMIZER_FILE), optimizer_state, Some(metadata))?;
        }

        if authoritative {
            let json = serde_json::to_string_pretty(training_state)?;
            std::fs::write(dir.join(STATE_FILE), json)?;
        }
        tracing::debug!(
            rank = self.rank,
            dir = %dir.display(),
            tensors = model_state.len(),
            "Wrote checkpoint shard"
        );
        Ok(())
    }
}

/// One rank's view of a checkpoint.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub model: BTreeMap<String, Tensor>,
    /// `None` when the checkpoint was written with the optimizer dropped.
    pub optimizer: Option<BTreeMap<String, Tensor>>,
    pub state: TrainingState,
}

/// Reads `rank`'s shards and the shared training state from `dir`.
pub fn load_checkpoint(dir: &Path, rank: usize) -> Result<LoadedCheckpoint> {
    let state_json = std::fs::read_to_string(dir.join(STATE_FILE))?;
    let state: TrainingState = serde_json::from_str(&state_json)?;
    if state.version != CHECKPOINT_VERSION {
        return Err(config_err(format!(
            "checkpoint version {} is not supported (expected {CHECKPOINT_VERSION})",
            state.version
        )));
    }
    if rank >= state.world_size {
        return Err(config_err(format!(
            "checkpoint was written by {} ranks, no shard for rank {rank}",
            state.world_size
        )));
    }

    let rank_dir = dir.join(format!("rank_{rank}"));
    let model = load_tensors(rank_dir.join(MODEL_FILE))?;
    let optimizer_path = rank_dir.join(OPTIMIZER_FILE);
    let optimizer = if optimizer_path.exists() {
        Some(load_tensors(optimizer_path)?)
    } else {
        None
    };
    Ok(LoadedCheckpoint {
        model,
        optimizer,
        state,
    })
}
