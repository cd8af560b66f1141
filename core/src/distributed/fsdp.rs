use super::backend::CollectiveBackend;
use super::mesh::{DeviceMesh, MeshDim};
use super::tp_plan::{ShardSpec, TensorParallelPlan};
use crate::error::{Result, config_err};
use crate::policy::ShardingPlan;
use crate::tensor::{DType, Tensor, TensorError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One trainable parameter: this rank's shard, its gradient, and where the shard sits in the
/// full tensor.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub value: Tensor,
    /// Accumulated in `f32` regardless of the training dtype.
    grad: Option<Tensor>,
    pub spec: ShardSpec,
}

impl Parameter {
    pub fn new(value: Tensor, spec: ShardSpec) -> Self {
        Self {
            value,
            grad: None,
            spec,
        }
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    /// Borrows the value mutably next to the gradient, for optimizer updates.
    pub fn value_and_grad_mut(&mut self) -> (&mut Tensor, Option<&Tensor>) {
        (&mut self.value, self.grad.as_ref())
    }
}

/// Ordered parameter table, keyed by full parameter path.
///
/// Every rank holds the same keys in the same order, so iterating the store is a valid
/// collective schedule.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    params: BTreeMap<String, Parameter>,
    /// Set by gradient accumulation, cleared by the data-parallel reduction.
    pending_reduce: bool,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, param: Parameter) {
        self.params.insert(name.into(), param);
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Parameter)> {
        self.params.iter_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.params.keys()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Elements held locally.
    pub fn numel(&self) -> usize {
        self.params.values().map(|p| p.value.numel()).sum()
    }

    /// Adds `grad` into the named parameter's gradient.
    pub fn accumulate_grad(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| config_err(format!("unknown parameter `{name}`")))?;
        if grad.shape() != param.value.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: param.value.shape().to_vec(),
                got: grad.shape().to_vec(),
            }
            .into());
        }
        match param.grad.as_mut() {
            Some(acc) => acc.add_assign(grad)?,
            None => param.grad = Some(grad.to_dtype(DType::F32)),
        }
        self.pending_reduce = true;
        Ok(())
    }

    /// Drops every gradient.
    pub fn clear_grads(&mut self) {
        for param in self.params.values_mut() {
            param.grad = None;
        }
        self.pending_reduce = false;
    }

    pub fn has_pending_reduce(&self) -> bool {
        self.pending_reduce
    }
}

/// What a forward/backward pass needs besides the parameters: the mesh, which blocks
/// recompute activations, and which modules reduce their output over the TP group.
pub struct ForwardContext<'a, B: CollectiveBackend> {
    pub mesh: &'a DeviceMesh<B>,
    pub plan: &'a ShardingPlan,
    pub tp_plan: &'a TensorParallelPlan,
}

impl<B: CollectiveBackend> ForwardContext<'_, B> {
    /// `true` if the sharding unit rooted at `path` discards and recomputes activations.
    pub fn recomputes(&self, path: &str) -> bool {
        self.plan
            .units()
            .iter()
            .any(|unit| unit.recompute && unit.path == path)
    }

    /// `true` if `module` yields a partial sum that must be all-reduced over the TP group.
    pub fn requires_all_reduce(&self, module: &str) -> bool {
        self.tp_plan.requires_all_reduce(module)
    }
}

/// The materialised, tensor-parallel-sharded model of one rank.
///
/// Data-parallel replicas hold identical shards (no sharding along the data dimension);
/// gradients are averaged over the data-parallel group before the optimizer runs.
pub struct ShardedModel<B: CollectiveBackend> {
    params: ParamStore,
    plan: ShardingPlan,
    tp_plan: TensorParallelPlan,
    mesh: Arc<DeviceMesh<B>>,
}

impl<B: CollectiveBackend> ShardedModel<B> {
    pub fn new(
        params: ParamStore,
        plan: ShardingPlan,
        tp_plan: TensorParallelPlan,
        mesh: Arc<DeviceMesh<B>>,
    ) -> Self {
        Self {
            params,
            plan,
            tp_plan,
            mesh,
        }
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    /// Mutable parameters alongside a read-only view of the plans, for one micro-batch.
    pub fn forward_parts(&mut self) -> (&mut ParamStore, ForwardContext<'_, B>) {
        (
            &mut self.params,
            ForwardContext {
                mesh: &self.mesh,
                plan: &self.plan,
                tp_plan: &self.tp_plan,
            },
        )
    }

    pub fn plan(&self) -> &ShardingPlan {
        &self.plan
    }

    pub fn tp_plan(&self) -> &TensorParallelPlan {
        &self.tp_plan
    }

    pub fn mesh(&self) -> &Arc<DeviceMesh<B>> {
        &self.mesh
    }

    /// Averages gradients over the data-parallel group.
    ///
    /// Parameters without a gradient contribute zeros, so every rank runs the same sequence
    /// of all-reduces.
    pub fn reduce_gradients(&mut self) -> Result<()> {
        let dp_group = self.mesh.group(MeshDim::Data);
        let dp = dp_group.world_size();
        for param in self.params.params.values_mut() {
            let mut grad = match param.grad.take() {
                Some(g) => g,
                None => Tensor::zeros(param.value.shape(), DType::F32),
            };
            if dp > 1 {
                dp_group.all_reduce_sum(&mut grad)?;
                grad.scale(1.0 / dp as f32);
            }
            param.grad = Some(grad);
        }
        self.params.pending_reduce = false;
        Ok(())
    }

    /// Global L2 norm of the gradients.
    ///
    /// Split parameters contribute their local squared norm, summed over the tensor-parallel
    /// group; replicated parameters are identical on every TP rank and count once.
    pub fn grad_norm(&self) -> Result<f32> {
        if self.params.pending_reduce {
            return Err(config_err(
                "gradients must be reduced across data-parallel ranks before clipping",
            ));
        }
        let mut split_sq = 0.0f64;
        let mut replicated_sq = 0.0f64;
        for param in self.params.params.values() {
            let Some(grad) = param.grad.as_ref() else {
                continue;
            };
            if param.spec.is_split() {
                split_sq += grad.sq_norm();
            } else {
                replicated_sq += grad.sq_norm();
            }
        }
        let mut split = Tensor::new(vec![split_sq as f32], &[1])?;
        self.mesh.group(MeshDim::Tensor).all_reduce_sum(&mut split)?;
        let total = split.to_f32_vec()[0] as f64 + replicated_sq;
        Ok(total.sqrt() as f32)
    }

    /// Scales gradients so the global norm does not exceed `max_norm`. Returns the norm
    /// before clipping.
    pub fn clip_grad_norm(&mut self, max_norm: f32) -> Result<f32> {
        let norm = self.grad_norm()?;
        if norm.is_finite() && norm > max_norm {
            let factor = max_norm / (norm + 1e-6);
            for param in self.params.params.values_mut() {
                if let Some(grad) = param.grad.as_mut() {
                    grad.scale(factor);
                }
            }
        }
        Ok(norm)
    }

    /// Reassembles the full tensor of one parameter from the tensor-parallel group.
    ///
    /// Collective over the TP group.
    pub fn gather_param(&self, name: &str) -> Result<Tensor> {
        let param = self
            .params
            .get(name)
            .ok_or_else(|| config_err(format!("unknown parameter `{name}`")))?;
        match param.spec.axis {
            Some(axis) if param.spec.is_split() => {
                self.mesh.group(MeshDim::Tensor).all_gather(&param.value, axis)
            }
            _ => Ok(param.value.clone()),
        }
    }

    /// Local shards, keyed by parameter path.
    pub fn model_state(&self) -> BTreeMap<String, Tensor> {
        self.params
            .iter()
            .map(|(name, p)| (name.clone(), p.value.clone()))
            .collect()
    }

    /// Overwrites local shards. Every parameter must be present with its local shape.
    pub fn load_model_state(&mut self, state: &BTreeMap<String, Tensor>) -> Result<()> {
        for (name, param) in self.params.iter_mut() {
            let loaded = state
                .get(name)
                .ok_or_else(|| config_err(format!("checkpoint is missing `{name}`")))?;
            if loaded.shape() != param.value.shape() {
                return Err(TensorError::ShapeMismatch {
                    expected: param.value.shape().to_vec(),
                    got: loaded.shape().to_vec(),
                }
                .into());
            }
            param.value = loaded.to_dtype(param.value.dtype());
        }
        Ok(())
    }
}
