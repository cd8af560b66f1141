//! # Phase Pipeline
//!
//! Getting from "a checkpoint on disk" to "a sharded replica on every rank" touches every
//! process, and every process must enter the same collectives in the same order. Rather
//! than sprinkling barriers through the code, each phase is its own type:
//!
//! ```text
//! LoadPhase ─▶ BuildSkeletonPhase ─▶ ShardPhase ─▶ SyncPhase ─▶ TrainPhase
//!         barrier              barrier        barrier       barrier
//! ```
//!
//! A transition consumes the previous phase and calls `mesh.barrier()` exactly once, so the
//! compiler rules out running the sync before the authoritative load has finished, or
//! training on a replica that was never synchronised.

use crate::config::TrainConfig;
use crate::distributed::backend::CollectiveBackend;
use crate::distributed::fsdp::{ParamStore, Parameter, ShardedModel};
use crate::distributed::mesh::{DeviceMesh, MeshDim};
use crate::distributed::tp_plan::{TensorParallelPlan, TensorParallelPlanner};
use crate::error::{Result, config_err};
use crate::init::{LazyInitializer, sync_module_states};
use crate::loader::{AuthoritativeModel, ModuleCorrespondenceMap, RankAuthoritativeLoader};
use crate::model::{MetaSkeleton, ModelSpec};
use crate::policy::{RecomputePolicy, ShardingPlan, UnitPolicy, WrapPolicy};
use crate::tensor::DType;
use std::sync::Arc;

/// Knobs the pipeline needs from the recipe.
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub dtype: DType,
    pub packed_sequences: bool,
    pub wrap: WrapPolicy,
    pub recompute_ratio: f64,
}

impl BootstrapOptions {
    pub fn from_config(config: &TrainConfig, dtype: DType) -> Self {
        Self {
            dtype,
            packed_sequences: config.packed_sequences,
            wrap: WrapPolicy::new(config.wrap_kinds.clone()),
            recompute_ratio: config.selective_recompute,
        }
    }
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            dtype: DType::F32,
            packed_sequences: false,
            wrap: WrapPolicy::default(),
            recompute_ratio: 1.0,
        }
    }
}

pub struct LoadPhase;

pub struct BuildSkeletonPhase {
    model: Option<AuthoritativeModel>,
}

pub struct ShardPhase {
    skeleton: MetaSkeleton,
    map: ModuleCorrespondenceMap,
    plan: ShardingPlan,
    tp_plan: TensorParallelPlan,
}

pub struct SyncPhase {
    skeleton: MetaSkeleton,
    map: ModuleCorrespondenceMap,
    plan: ShardingPlan,
    tp_plan: TensorParallelPlan,
}

pub struct TrainPhase<B: CollectiveBackend> {
    model: ShardedModel<B>,
}

struct Context<B: CollectiveBackend> {
    mesh: Arc<DeviceMesh<B>>,
    spec: ModelSpec,
    options: BootstrapOptions,
    barriers: usize,
}

/// The pipeline in phase `P`.
pub struct Bootstrap<B: CollectiveBackend, P> {
    ctx: Context<B>,
    phase: P,
}

impl<B: CollectiveBackend, P> Bootstrap<B, P> {
    fn advance<Q>(mut ctx: Context<B>, phase: Q, name: &'static str) -> Result<Bootstrap<B, Q>> {
        ctx.mesh.barrier()?;
        ctx.barriers += 1;
        tracing::info!(rank = ctx.mesh.rank(), phase = name, "Entered phase");
        Ok(Bootstrap { ctx, phase })
    }

    pub fn mesh(&self) -> &Arc<DeviceMesh<B>> {
        &self.ctx.mesh
    }

    /// Barriers crossed so far.
    pub fn barriers(&self) -> usize {
        self.ctx.barriers
    }
}

impl<B: CollectiveBackend> Bootstrap<B, LoadPhase> {
    pub fn new(mesh: Arc<DeviceMesh<B>>, spec: ModelSpec, options: BootstrapOptions) -> Self {
        Self {
            ctx: Context {
                mesh,
                spec,
                options,
                barriers: 0,
            },
            phase: LoadPhase,
        }
    }

    /// Loads (and operates on) the authoritative copy. A no-op on every other rank.
    pub fn load(self, loader: &RankAuthoritativeLoader) -> Result<Bootstrap<B, BuildSkeletonPhase>> {
        let model = loader.load(&self.ctx.mesh, &self.ctx.spec)?;
        Self::advance(self.ctx, BuildSkeletonPhase { model }, "build_skeleton")
    }
}

impl<B: CollectiveBackend> Bootstrap<B, BuildSkeletonPhase> {
    /// Builds the storage-free skeleton, plans tensor parallelism and wrap units, and keys the
    /// authoritative copy to the skeleton.
    pub fn build_skeleton(self) -> Result<Bootstrap<B, ShardPhase>> {
        let Bootstrap { ctx, phase } = self;
        let mut skeleton = MetaSkeleton::build(&ctx.spec, ctx.options.dtype)?;
        if ctx.options.packed_sequences {
            skeleton.dispatch_packed_kernels();
        }
        let tp_plan = TensorParallelPlanner::from_mesh(&ctx.mesh)
            .apply(&mut skeleton, ctx.mesh.coordinate(MeshDim::Tensor))?;

        let recompute =
            RecomputePolicy::from_ratio(ctx.options.recompute_ratio, skeleton.blocks().len())?;
        let policy = UnitPolicy::new(ctx.options.wrap.clone(), recompute);
        let plan = ShardingPlan::build(&skeleton, &policy);

        let map = ModuleCorrespondenceMap::build(&skeleton, phase.model);
        tracing::info!(
            modules = skeleton.modules().len(),
            params = skeleton.params().len(),
            numel = skeleton.numel(),
            "Built meta skeleton"
        );
        let next = ShardPhase {
            skeleton,
            map,
            plan,
            tp_plan,
        };
        Self::advance(ctx, next, "shard")
    }
}

impl<B: CollectiveBackend> Bootstrap<B, ShardPhase> {
    /// Materialises every unit's leaves, in unit order.
    pub fn shard(self) -> Result<Bootstrap<B, SyncPhase>> {
        let Bootstrap { ctx, phase } = self;
        let ShardPhase {
            mut skeleton,
            map,
            plan,
            tp_plan,
        } = phase;

        let mut init = LazyInitializer::new();
        for unit in plan.units() {
            let n = init.init_unit(&mut skeleton, unit, &map)?;
            tracing::debug!(unit = %unit.path, modules = n, recompute = unit.recompute, "Initialised unit");
        }
        if !init.mismatches().is_empty() {
            tracing::warn!(
                count = init.mismatches().len(),
                "Modules re-initialised without authoritative weights"
            );
        }
        tracing::info!(
            bytes = skeleton.materialized_bytes(),
            modules = init.initialised(),
            "Materialised local shards"
        );

        let next = SyncPhase {
            skeleton,
            map,
            plan,
            tp_plan,
        };
        Self::advance(ctx, next, "sync")
    }
}

impl<B: CollectiveBackend> Bootstrap<B, SyncPhase> {
    /// Broadcasts authoritative values and frees the authoritative copy.
    pub fn sync(self) -> Result<Bootstrap<B, TrainPhase<B>>> {
        let Bootstrap { ctx, phase } = self;
        let SyncPhase {
            mut skeleton,
            map,
            plan,
            tp_plan,
        } = phase;
        sync_module_states(&mut skeleton, map, &ctx.mesh)?;

        let mut params = ParamStore::new();
        for (name, slot) in skeleton.into_params() {
            let value = slot
                .value
                .ok_or_else(|| config_err(format!("`{name}` left unmaterialised after sync")))?;
            params.insert(name, Parameter::new(value, slot.spec));
        }
        let model = ShardedModel::new(params, plan, tp_plan, Arc::clone(&ctx.mesh));
        Self::advance(ctx, TrainPhase { model }, "train")
    }
}

impl<B: CollectiveBackend> Bootstrap<B, TrainPhase<B>> {
    pub fn model(&self) -> &ShardedModel<B> {
        &self.phase.model
    }

    pub fn into_model(self) -> ShardedModel<B> {
        self.phase.model
    }
}

/// Runs every phase and returns the synchronised replica.
pub fn run<B: CollectiveBackend>(
    mesh: Arc<DeviceMesh<B>>,
    spec: ModelSpec,
    options: BootstrapOptions,
    loader: &RankAuthoritativeLoader,
) -> Result<ShardedModel<B>> {
    let model = Bootstrap::new(mesh, spec, options)
        .load(loader)?
        .build_skeleton()?
        .shard()?
        .sync()?
        .into_model();
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::cpu_backend::CpuBackend;
    use crate::distributed::mesh::MeshShape;
    use crate::loader::{SeededSource, WeightSource};
    use std::thread;

    #[test]
    fn test_single_rank_pipeline() {
        let world = CpuBackend::spawn_world(1).pop().unwrap();
        let mesh = Arc::new(DeviceMesh::new(MeshShape::new(1, 1, 1).unwrap(), world).unwrap());
        let spec = ModelSpec::tiny();
        let loader = RankAuthoritativeLoader::new(Arc::new(SeededSource::new(5)));

        let done = Bootstrap::new(mesh, spec.clone(), BootstrapOptions::default())
            .load(&loader)
            .unwrap()
            .build_skeleton()
            .unwrap()
            .shard()
            .unwrap()
            .sync()
            .unwrap();
        assert_eq!(done.barriers(), 4);

        let reference = SeededSource::new(5).load(&spec, DType::F32).unwrap();
        let model = done.into_model();
        assert_eq!(model.params().len(), reference.len());
        for (name, want) in reference.tensors() {
            assert!(model.params().get(name).unwrap().value.bit_eq(want), "{name}");
        }
    }

    #[test]
    fn test_indivisible_heads_fail_on_every_rank() {
        let spec = ModelSpec {
            num_kv_heads: 1,
            num_heads: 2,
            hidden_size: 16,
            ..ModelSpec::tiny()
        };
        let handles: Vec<_> = CpuBackend::spawn_world(2)
            .into_iter()
            .map(|world| {
                let spec = spec.clone();
                thread::spawn(move || {
                    let mesh =
                        Arc::new(DeviceMesh::new(MeshShape::new(2, 2, 1).unwrap(), world).unwrap());
                    let loader = RankAuthoritativeLoader::new(Arc::new(SeededSource::new(1)));
                    Bootstrap::new(mesh, spec, BootstrapOptions::default())
                        .load(&loader)
                        .and_then(|b| b.build_skeleton())
                        .is_err()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
