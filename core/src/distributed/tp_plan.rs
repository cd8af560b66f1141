//! Tensor-parallel placement: which parameters are split, along which axis, and which
//! modules need a reduction after their forward.
//!
//! Weights are stored `[out_features, in_features]`, so
//!
//! * **Colwise** splits the *output* features: axis 0 of the weight, axis 0 of the bias.
//! * **Rowwise** splits the *input* features: axis 1 of the weight. The bias is added after
//!   the reduction and stays replicated.
//! * **Replicate** keeps the full tensor on every rank.

use super::backend::CollectiveBackend;
use super::mesh::{DeviceMesh, MeshDim};
use crate::error::{Result, config_err};
use crate::model::{LinearRole, MetaSkeleton, ModuleKind};
use crate::tensor::{Tensor, TensorError};
use std::collections::BTreeMap;

/// How a module's parameters are laid out across the tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelStyle {
    Colwise,
    Rowwise,
    Replicate,
}

/// Which slice of a full tensor a rank owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    /// Split axis, `None` when replicated.
    pub axis: Option<usize>,
    pub shard_count: usize,
    pub shard_index: usize,
}

impl ShardSpec {
    pub fn replicate() -> Self {
        Self {
            axis: None,
            shard_count: 1,
            shard_index: 0,
        }
    }

    pub fn split(axis: usize, shard_count: usize, shard_index: usize) -> Self {
        Self {
            axis: Some(axis),
            shard_count,
            shard_index,
        }
    }

    /// `true` when ranks hold different slices.
    pub fn is_split(&self) -> bool {
        self.axis.is_some() && self.shard_count > 1
    }

    /// The same layout, for another shard index.
    pub fn with_index(&self, shard_index: usize) -> Self {
        Self {
            shard_index,
            ..*self
        }
    }

    pub fn local_shape(&self, full: &[usize]) -> Vec<usize> {
        let mut shape = full.to_vec();
        if let Some(axis) = self.axis {
            shape[axis] /= self.shard_count;
        }
        shape
    }

    /// Start of this shard along the split axis.
    pub fn offset(&self, full: &[usize]) -> usize {
        match self.axis {
            Some(axis) => self.shard_index * (full[axis] / self.shard_count),
            None => 0,
        }
    }

    /// Cuts this rank's shard out of the full tensor.
    pub fn slice(&self, full: &Tensor) -> std::result::Result<Tensor, TensorError> {
        match self.axis {
            Some(axis) => {
                let rank = full.rank();
                let dim = *full
                    .shape()
                    .get(axis)
                    .ok_or(TensorError::AxisOutOfRange { axis, rank })?;
                if dim % self.shard_count != 0 {
                    return Err(TensorError::Unsupported(format!(
                        "dimension {dim} on axis {axis} does not split into {} shards",
                        self.shard_count
                    )));
                }
                full.narrow(axis, self.offset(full.shape()), dim / self.shard_count)
            }
            None => Ok(full.clone()),
        }
    }

    /// Every shard of `full`, in shard-index order.
    pub fn slice_all(&self, full: &Tensor) -> std::result::Result<Vec<Tensor>, TensorError> {
        (0..self.shard_count)
            .map(|i| self.with_index(i).slice(full))
            .collect()
    }

    /// Reassembles the full tensor from every shard, in shard-index order.
    pub fn reconstruct(&self, shards: &[Tensor]) -> std::result::Result<Tensor, TensorError> {
        match self.axis {
            Some(axis) => Tensor::cat(shards, axis),
            None => shards
                .first()
                .cloned()
                .ok_or_else(|| TensorError::Unsupported("no shards".to_string())),
        }
    }
}

/// Outcome of planning: the style chosen for every leaf module.
#[derive(Debug, Clone, Default)]
pub struct TensorParallelPlan {
    pub styles: BTreeMap<String, ParallelStyle>,
}

impl TensorParallelPlan {
    /// Rowwise modules produce partial sums and must all-reduce over the TP group.
    pub fn requires_all_reduce(&self, module: &str) -> bool {
        self.styles.get(module) == Some(&ParallelStyle::Rowwise)
    }

    pub fn style(&self, module: &str) -> Option<ParallelStyle> {
        self.styles.get(module).copied()
    }
}

/// Assigns a [`ShardSpec`] to every parameter of the skeleton.
#[derive(Debug, Clone, Copy)]
pub struct TensorParallelPlanner {
    tp_size: usize,
}

impl TensorParallelPlanner {
    pub fn new(tp_size: usize) -> Self {
        Self { tp_size }
    }

    pub fn from_mesh<B: CollectiveBackend>(mesh: &DeviceMesh<B>) -> Self {
        Self::new(mesh.size(MeshDim::Tensor))
    }

    /// Style for a module kind, before any divisibility check.
    pub fn plan_for(kind: ModuleKind) -> ParallelStyle {
        match kind {
            ModuleKind::Linear(LinearRole::Qkv)
            | ModuleKind::Linear(LinearRole::Gate)
            | ModuleKind::Linear(LinearRole::Up)
            | ModuleKind::Unembedding => ParallelStyle::Colwise,
            ModuleKind::Linear(LinearRole::AttnOut) | ModuleKind::Linear(LinearRole::Down) => {
                ParallelStyle::Rowwise
            }
            ModuleKind::Linear(LinearRole::ProjectorIn)
            | ModuleKind::Linear(LinearRole::ProjectorOut)
            | ModuleKind::Linear(LinearRole::Generic)
            | ModuleKind::Embedding
            | ModuleKind::Norm
            | ModuleKind::Block
            | ModuleKind::Attention
            | ModuleKind::FeedForward
            | ModuleKind::VisionEncoderLayer
            | ModuleKind::Projector
            | ModuleKind::Container => ParallelStyle::Replicate,
        }
    }

    /// Writes shard specs for `tp_rank` into the skeleton and shrinks attention attributes
    /// to the local heads. Call once, before any storage is materialised.
    ///
    /// # Errors
    ///
    /// `Configuration` if a head count, hidden width or split dimension is not divisible by
    /// the tensor-parallel width.
    pub fn apply(&self, skeleton: &mut MetaSkeleton, tp_rank: usize) -> Result<TensorParallelPlan> {
        let tp = self.tp_size;
        if tp == 0 || tp_rank >= tp {
            return Err(config_err(format!("tp rank {tp_rank} outside tp size {tp}")));
        }

        let mut plan = TensorParallelPlan::default();
        for id in skeleton.leaf_modules() {
            let node = skeleton.module(id);
            let mut style = Self::plan_for(node.kind);
            if node.kind == ModuleKind::Unembedding {
                let vocab = node
                    .params
                    .first()
                    .and_then(|p| skeleton.param_slot(p))
                    .map(|slot| slot.desc.shape[0])
                    .unwrap_or(0);
                if vocab % tp != 0 {
                    tracing::info!(
                        module = %node.path,
                        vocab,
                        tp,
                        "Vocabulary does not divide the TP width, replicating unembedding"
                    );
                    style = ParallelStyle::Replicate;
                }
            }
            let path = node.path.clone();
            let params = node.params.clone();

            for param in params {
                let Some(slot) = skeleton.param_slot_mut(&param) else {
                    continue;
                };
                let is_bias = param.ends_with(".bias");
                let axis = match style {
                    ParallelStyle::Colwise => Some(0),
                    ParallelStyle::Rowwise if !is_bias => Some(1),
                    ParallelStyle::Rowwise | ParallelStyle::Replicate => None,
                };
                slot.spec = match axis {
                    Some(axis) => {
                        let dim = slot.desc.shape[axis];
                        if dim % tp != 0 {
                            return Err(config_err(format!(
                                "{param}: dimension {dim} on axis {axis} is not divisible by tp size {tp}"
                            )));
                        }
                        ShardSpec::split(axis, tp, tp_rank)
                    }
                    None => ShardSpec::replicate(),
                };
            }
            tracing::debug!(module = %path, ?style, "Planned tensor parallel style");
            plan.styles.insert(path, style);
        }

        for node in skeleton.modules().to_vec() {
            let Some(attrs) = node.attention else {
                continue;
            };
            for (what, value) in [
                ("num_heads", attrs.num_heads),
                ("num_kv_heads", attrs.num_kv_heads),
                ("hidden_size", attrs.hidden_size),
            ] {
                if value % tp != 0 {
                    return Err(config_err(format!(
                        "{}: {what} = {value} is not divisible by tp size {tp}",
                        node.path
                    )));
                }
            }
            if let Some(id) = skeleton.find(&node.path) {
                if let Some(local) = skeleton.module_mut(id).attention.as_mut() {
                    local.num_heads /= tp;
                    local.num_kv_heads /= tp;
                    local.hidden_size /= tp;
                }
            }
        }

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelSpec;
    use crate::tensor::{DType, ops::arange};

    #[test]
    fn test_shard_spec_slice_and_reconstruct() {
        let full = arange(&[4, 6], DType::F32);
        let spec = ShardSpec::split(1, 3, 0);
        let shards = spec.slice_all(&full).unwrap();
        assert_eq!(shards[1].to_f32_vec(), vec![2.0, 3.0, 8.0, 9.0, 14.0, 15.0, 20.0, 21.0]);
        assert!(spec.reconstruct(&shards).unwrap().bit_eq(&full));
        assert_eq!(spec.with_index(2).offset(full.shape()), 4);
    }

    #[test]
    fn test_plan_for_roles() {
        use LinearRole::*;
        assert_eq!(
            TensorParallelPlanner::plan_for(ModuleKind::Linear(Qkv)),
            ParallelStyle::Colwise
        );
        assert_eq!(
            TensorParallelPlanner::plan_for(ModuleKind::Linear(Down)),
            ParallelStyle::Rowwise
        );
        assert_eq!(
            TensorParallelPlanner::plan_for(ModuleKind::Norm),
            ParallelStyle::Replicate
        );
        assert_eq!(
            TensorParallelPlanner::plan_for(ModuleKind::Embedding),
            ParallelStyle::Replicate
        );
    }

    #[test]
    fn test_apply_tp2() {
        let mut sk = MetaSkeleton::build(&ModelSpec::tiny(), DType::F32).unwrap();
        let plan = TensorParallelPlanner::new(2).apply(&mut sk, 1).unwrap();

        let wqkv = sk.param_slot("model.layers.0.attention.wqkv.weight").unwrap();
        assert_eq!(wqkv.spec, ShardSpec::split(0, 2, 1));
        assert_eq!(wqkv.local_shape(), vec![16, 16]);

        let wo = sk.param_slot("model.layers.0.attention.wo.weight").unwrap();
        assert_eq!(wo.spec.axis, Some(1));
        assert!(plan.requires_all_reduce("model.layers.0.attention.wo"));
        assert!(!plan.requires_all_reduce("model.layers.0.attention.wqkv"));

        let norm = sk.param_slot("model.norm.weight").unwrap();
        assert_eq!(norm.spec, ShardSpec::replicate());

        let attn = sk.find("model.layers.0.attention").unwrap();
        let attrs = sk.module(attn).attention.unwrap();
        assert_eq!((attrs.num_heads, attrs.num_kv_heads, attrs.hidden_size), (2, 1, 8));
    }

    #[test]
    fn test_unembedding_replicated_when_vocab_indivisible() {
        let spec = ModelSpec {
            vocab_size: 63,
            ..ModelSpec::tiny()
        };
        let mut sk = MetaSkeleton::build(&spec, DType::F32).unwrap();
        let plan = TensorParallelPlanner::new(2).apply(&mut sk, 0).unwrap();
        assert_eq!(plan.style("output"), Some(ParallelStyle::Replicate));
        assert!(!sk.param_slot("output.weight").unwrap().spec.is_split());
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let mut sk = MetaSkeleton::build(&ModelSpec::tiny(), DType::F32).unwrap();
        // Four heads split four ways, two kv heads do not.
        let err = TensorParallelPlanner::new(4).apply(&mut sk, 0);
        assert!(matches!(err, Err(crate::error::Error::Configuration(_))));
    }
}
