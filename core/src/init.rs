//! # Lazy Parameter Initialization
//!
//! The skeleton describes every parameter but owns no storage. Storage appears here, one
//! module at a time, in three steps:
//!
//! 1.  **Copy** (authoritative rank only): if the [`ModuleCorrespondenceMap`] has an entry for
//!     the module, each parameter is narrowed to this rank's shard and cast to the training
//!     dtype.
//! 2.  **Fill** (everyone else, and the authoritative rank on a structural mismatch): storage
//!     comes from the descriptor's deterministic fill (`ones` for norms, `zeros` otherwise).
//! 3.  **Sync**: once every leaf exists, [`sync_module_states`] overwrites the filled bytes
//!     with the authoritative rank's values.
//!
//! ## 🔁 The Two-Stage Sync
//!
//! Only one rank holds the unsharded weights, but tensor-parallel peers need *different*
//! slices. So we cannot just broadcast:
//!
//! ```text
//!   stage 1 (pp=0, dp=0 row)     stage 2 (pp groups)   stage 3 (dp groups)
//!   rank0 ──scatter──▶ tp0..tpN  ──broadcast──▶ ...    ──broadcast──▶ every replica
//! ```
//!
//! Pipeline stages hold full replicas here, so they are synchronised like data-parallel
//! replicas. Every rank walks parameters in the same (sorted) order and enters the same
//! collectives, whether or not it has anything useful to send.

use crate::distributed::backend::CollectiveBackend;
use crate::distributed::mesh::{DeviceMesh, MeshDim};
use crate::error::{Result, config_err};
use crate::loader::ModuleCorrespondenceMap;
use crate::model::{MetaSkeleton, ModuleId};
use crate::policy::ShardingUnit;
use crate::tensor::Tensor;

/// Materialises module storage on first use.
#[derive(Debug, Default)]
pub struct LazyInitializer {
    initialised: usize,
    mismatches: Vec<String>,
}

impl LazyInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates and fills every parameter of `module`.
    ///
    /// Returns `false` if the module was already materialised; a second call changes nothing.
    pub fn init_module(
        &mut self,
        skeleton: &mut MetaSkeleton,
        module: ModuleId,
        map: &ModuleCorrespondenceMap,
    ) -> Result<bool> {
        let node = skeleton.module(module);
        let already = node
            .params
            .iter()
            .all(|p| skeleton.param_slot(p).is_some_and(|s| s.value.is_some()));
        if already {
            return Ok(false);
        }
        let path = node.path.clone();
        let params = node.params.clone();

        let weights = if map.is_authoritative() {
            let found = map.get(&path);
            if found.is_none() {
                tracing::warn!(
                    module = %path,
                    "Structural mismatch: no authoritative weights, re-initialising module"
                );
                self.mismatches.push(path.clone());
            }
            found
        } else {
            None
        };

        for param in &params {
            let Some(slot) = skeleton.param_slot_mut(param) else {
                continue;
            };
            let value = match weights.and_then(|w| w.get(param)) {
                Some(full) => slot.spec.slice(full)?.to_dtype(slot.desc.dtype),
                None => slot.allocate(),
            };
            slot.value = Some(value);
        }
        self.initialised += 1;
        Ok(true)
    }

    /// Initialises every leaf a sharding unit claims.
    pub fn init_unit(
        &mut self,
        skeleton: &mut MetaSkeleton,
        unit: &ShardingUnit,
        map: &ModuleCorrespondenceMap,
    ) -> Result<usize> {
        let mut count = 0;
        for &leaf in &unit.leaves {
            if self.init_module(skeleton, leaf, map)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Modules materialised so far.
    pub fn initialised(&self) -> usize {
        self.initialised
    }

    /// Module paths the authoritative rank had to re-initialise.
    pub fn mismatches(&self) -> &[String] {
        &self.mismatches
    }
}

/// Overwrites every rank's shards with the authoritative values.
///
/// Consumes the correspondence map: the authoritative copy is freed once this returns.
///
/// # Errors
///
/// `Configuration` if a parameter is still unmaterialised, plus any collective failure.
pub fn sync_module_states<B: CollectiveBackend>(
    skeleton: &mut MetaSkeleton,
    map: ModuleCorrespondenceMap,
    mesh: &DeviceMesh<B>,
) -> Result<()> {
    if let Some((name, _)) = skeleton.params().iter().find(|(_, s)| s.value.is_none()) {
        return Err(config_err(format!(
            "cannot sync module states: `{name}` was never initialised"
        )));
    }

    let names: Vec<String> = skeleton.params().keys().cloned().collect();
    let in_source_row =
        mesh.coordinate(MeshDim::Pipeline) == 0 && mesh.coordinate(MeshDim::Data) == 0;

    if in_source_row {
        let tp = mesh.group(MeshDim::Tensor);
        for name in &names {
            let Some(slot) = skeleton.param_slot_mut(name) else {
                continue;
            };
            let Some(local) = slot.value.as_mut() else {
                continue;
            };
            if slot.spec.is_split() {
                let parts = if map.is_authoritative() {
                    let module = name.rsplit_once('.').map_or("", |(m, _)| m);
                    let shards = match map.get(module).and_then(|w| w.get(name)) {
                        Some(full) => slot
                            .spec
                            .slice_all(full)?
                            .into_iter()
                            .map(|t| t.to_dtype(slot.desc.dtype))
                            .collect(),
                        None => vec![local.clone(); slot.spec.shard_count],
                    };
                    Some(shards)
                } else {
                    None
                };
                *local = tp.scatter(parts, 0)?;
            } else {
                tp.broadcast(local, 0)?;
            }
        }
    }

    if mesh.coordinate(MeshDim::Data) == 0 {
        broadcast_all(skeleton, &names, mesh.group(MeshDim::Pipeline))?;
    }
    broadcast_all(skeleton, &names, mesh.group(MeshDim::Data))?;

    drop(map);
    tracing::info!(params = names.len(), "Synchronised module states");
    Ok(())
}

fn broadcast_all<B: CollectiveBackend>(
    skeleton: &mut MetaSkeleton,
    names: &[String],
    group: &B,
) -> Result<()> {
    if group.world_size() == 1 {
        return Ok(());
    }
    for name in names {
        if let Some(value) = skeleton.param_slot_mut(name).and_then(|s| s.value.as_mut()) {
            group.broadcast(value, 0)?;
        }
    }
    Ok(())
}

/// Full tensor for `param`, gathered over the tensor-parallel group. Test and debug aid.
pub fn gather_full<B: CollectiveBackend>(
    skeleton: &MetaSkeleton,
    param: &str,
    mesh: &DeviceMesh<B>,
) -> Result<Tensor> {
    let slot = skeleton
        .param_slot(param)
        .ok_or_else(|| config_err(format!("unknown parameter `{param}`")))?;
    let value = slot
        .value
        .as_ref()
        .ok_or_else(|| config_err(format!("`{param}` is not materialised")))?;
    match slot.spec.axis {
        Some(axis) if slot.spec.is_split() => mesh.group(MeshDim::Tensor).all_gather(value, axis),
        _ => Ok(value.clone()),
    }
}
