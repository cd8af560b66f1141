//! Rank-authoritative weight loading.
//!
//! Exactly one rank (coordinate 0 on every mesh dimension) ever holds the complete,
//! unsharded model. It loads from a [`WeightSource`], applies any [`Surgery`], and hands the
//! result to a [`ModuleCorrespondenceMap`] keyed by the skeleton's module paths. Every other
//! rank skips loading entirely and later receives its shards over the collectives.

use crate::checkpoint::tensors_from_bytes;
use crate::distributed::backend::CollectiveBackend;
use crate::distributed::mesh::DeviceMesh;
use crate::error::{Result, config_err};
use crate::model::{MetaSkeleton, ModelSpec, ParamInit};
use crate::tensor::{DType, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `true` if `path` is `prefix` itself or lies under it.
fn under(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'.'))
}

/// Parent module of a parameter path (`a.b.weight` → `a.b`).
fn module_of(param: &str) -> &str {
    param.rsplit_once('.').map_or("", |(module, _)| module)
}

/// The complete, unsharded weights, keyed by parameter path.
#[derive(Debug, Clone, Default)]
pub struct AuthoritativeModel {
    tensors: BTreeMap<String, Tensor>,
}

impl AuthoritativeModel {
    pub fn new(tensors: BTreeMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    pub fn get(&self, param: &str) -> Option<&Tensor> {
        self.tensors.get(param)
    }

    pub fn tensors(&self) -> &BTreeMap<String, Tensor> {
        &self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn numel(&self) -> usize {
        self.tensors.values().map(Tensor::numel).sum()
    }

    /// Modules owning at least one parameter, deduplicated and sorted.
    pub fn module_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .tensors
            .keys()
            .map(|p| module_of(p).to_string())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Removes every parameter under `prefix`, returning them.
    pub fn take_subtree(&mut self, prefix: &str) -> BTreeMap<String, Tensor> {
        let names: Vec<String> = self
            .tensors
            .keys()
            .filter(|k| under(k, prefix))
            .cloned()
            .collect();
        names
            .into_iter()
            .filter_map(|n| self.tensors.remove(&n).map(|t| (n, t)))
            .collect()
    }

    pub fn has_subtree(&self, prefix: &str) -> bool {
        self.tensors.keys().any(|k| under(k, prefix))
    }

    fn into_tensors(self) -> BTreeMap<String, Tensor> {
        self.tensors
    }
}

/// An external weights store.
pub trait WeightSource: Send + Sync {
    /// Loads every tensor of `model`, cast to `dtype`.
    fn load(&self, model: &ModelSpec, dtype: DType) -> Result<AuthoritativeModel>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

/// A `.safetensors` file, memory-mapped rather than read into memory.
#[derive(Debug, Clone)]
pub struct SafetensorsSource {
    path: PathBuf,
}

impl SafetensorsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WeightSource for SafetensorsSource {
    fn load(&self, _model: &ModelSpec, dtype: DType) -> Result<AuthoritativeModel> {
        let file = File::open(&self.path)?;
        // SAFETY: the file is opened read-only and not modified while mapped.
        let mmap = unsafe { Mmap::map(&file)? };
        let tensors = tensors_from_bytes(&mmap)?
            .into_iter()
            .map(|(name, t)| (name, t.to_dtype(dtype)))
            .collect();
        Ok(AuthoritativeModel::new(tensors))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Deterministic synthetic weights: norms are ones, everything else is uniform in
/// `[-scale, scale)` from a seeded generator.
#[derive(Debug, Clone, Copy)]
pub struct SeededSource {
    pub seed: u64,
    pub scale: f32,
}

impl SeededSource {
    pub fn new(seed: u64) -> Self {
        Self { seed, scale: 0.02 }
    }
}

impl WeightSource for SeededSource {
    fn load(&self, model: &ModelSpec, dtype: DType) -> Result<AuthoritativeModel> {
        let skeleton = MetaSkeleton::build(model, dtype)?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut tensors = BTreeMap::new();
        for (name, slot) in skeleton.params() {
            let shape = &slot.desc.shape;
            let tensor = match slot.desc.init {
                ParamInit::Ones => Tensor::ones(shape, dtype),
                ParamInit::Zeros => {
                    let values: Vec<f32> = (0..slot.desc.numel())
                        .map(|_| rng.random_range(-self.scale..self.scale))
                        .collect();
                    Tensor::new(values, shape)?.to_dtype(dtype)
                }
            };
            tensors.insert(name.clone(), tensor);
        }
        Ok(AuthoritativeModel::new(tensors))
    }

    fn describe(&self) -> String {
        format!("seeded(seed={})", self.seed)
    }
}

/// A structural edit applied to the authoritative model before sharding.
#[derive(Clone)]
pub enum Surgery {
    /// Drops every parameter under `prefix`.
    Detach { prefix: String },
    /// Re-sources a detached subtree from another artifact.
    Graft {
        prefix: String,
        source: Arc<dyn WeightSource>,
    },
    /// Sets every parameter under `prefix` to `1 / numel`. Used for freshly added projectors.
    UniformFill { prefix: String },
}

impl fmt::Debug for Surgery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Surgery::Detach { prefix } => f.debug_struct("Detach").field("prefix", prefix).finish(),
            Surgery::Graft { prefix, source } => f
                .debug_struct("Graft")
                .field("prefix", prefix)
                .field("source", &source.describe())
                .finish(),
            Surgery::UniformFill { prefix } => {
                f.debug_struct("UniformFill").field("prefix", prefix).finish()
            }
        }
    }
}

impl Surgery {
    pub fn apply(&self, model: &mut AuthoritativeModel, spec: &ModelSpec, dtype: DType) -> Result<()> {
        match self {
            Surgery::Detach { prefix } => {
                let removed = model.take_subtree(prefix);
                tracing::info!(prefix = %prefix, tensors = removed.len(), "Detached subtree");
            }
            Surgery::Graft { prefix, source } => {
                if model.has_subtree(prefix) {
                    return Err(config_err(format!(
                        "cannot graft `{prefix}`: subtree is still attached"
                    )));
                }
                let mut donor = source.load(spec, dtype)?;
                let grafted = donor.take_subtree(prefix);
                if grafted.is_empty() {
                    return Err(config_err(format!(
                        "{} has no tensors under `{prefix}`",
                        source.describe()
                    )));
                }
                tracing::info!(
                    prefix = %prefix,
                    source = %source.describe(),
                    tensors = grafted.len(),
                    "Grafted subtree"
                );
                model.tensors.extend(grafted);
            }
            Surgery::UniformFill { prefix } => {
                let mut filled = 0;
                for (name, tensor) in model.tensors.iter_mut() {
                    if under(name, prefix) {
                        let numel = tensor.numel().max(1);
                        *tensor = Tensor::full(tensor.shape(), 1.0 / numel as f32, tensor.dtype());
                        filled += 1;
                    }
                }
                if filled == 0 {
                    return Err(config_err(format!("no tensors under `{prefix}` to fill")));
                }
                tracing::info!(prefix = %prefix, tensors = filled, "Uniformly filled subtree");
            }
        }
        Ok(())
    }
}

/// Loads the authoritative model on exactly one rank.
pub struct RankAuthoritativeLoader {
    source: Arc<dyn WeightSource>,
    surgeries: Vec<Surgery>,
}

impl RankAuthoritativeLoader {
    pub fn new(source: Arc<dyn WeightSource>) -> Self {
        Self {
            source,
            surgeries: Vec::new(),
        }
    }

    pub fn with_surgery(mut self, surgery: Surgery) -> Self {
        self.surgeries.push(surgery);
        self
    }

    /// `Some` on the authoritative rank, `None` (without touching the source) elsewhere.
    ///
    /// The authoritative copy is kept in `f32`; the training dtype is applied per shard
    /// during initialization.
    pub fn load<B: CollectiveBackend>(
        &self,
        mesh: &DeviceMesh<B>,
        spec: &ModelSpec,
    ) -> Result<Option<AuthoritativeModel>> {
        if !mesh.is_authoritative() {
            return Ok(None);
        }
        self.load_local(spec).map(Some)
    }

    /// Loads unconditionally. Only the authoritative rank should call this.
    pub fn load_local(&self, spec: &ModelSpec) -> Result<AuthoritativeModel> {
        tracing::info!(source = %self.source.describe(), "Loading authoritative weights");
        let mut model = self.source.load(spec, DType::F32)?;
        for surgery in &self.surgeries {
            surgery.apply(&mut model, spec, DType::F32)?;
        }
        tracing::info!(
            tensors = model.len(),
            numel = model.numel(),
            "Authoritative model ready"
        );
        Ok(model)
    }
}

/// Authoritative tensors of one module, keyed by full parameter path.
pub type ModuleWeights = BTreeMap<String, Tensor>;

/// Skeleton module path → authoritative module.
///
/// Built once, read-only afterwards, and consumed when synchronisation finishes, which frees
/// the authoritative copy.
#[derive(Debug, Default)]
pub struct ModuleCorrespondenceMap {
    authoritative: bool,
    entries: HashMap<String, ModuleWeights>,
}

impl ModuleCorrespondenceMap {
    /// Matches authoritative tensors to skeleton modules by path and shape.
    ///
    /// A module gets an entry only if every one of its parameters is present with the
    /// skeleton's full shape.
    pub fn build(skeleton: &MetaSkeleton, model: Option<AuthoritativeModel>) -> Self {
        let Some(model) = model else {
            return Self::default();
        };
        let mut tensors = model.into_tensors();
        let mut entries = HashMap::new();
        for id in skeleton.leaf_modules() {
            let node = skeleton.module(id);
            let complete = node.params.iter().all(|p| {
                match (tensors.get(p), skeleton.param_slot(p)) {
                    (Some(t), Some(slot)) => t.shape() == slot.desc.shape.as_slice(),
                    _ => false,
                }
            });
            if !complete {
                continue;
            }
            let weights: ModuleWeights = node
                .params
                .iter()
                .filter_map(|p| tensors.remove(p).map(|t| (p.clone(), t)))
                .collect();
            entries.insert(node.path.clone(), weights);
        }
        for leftover in tensors.keys() {
            tracing::warn!(param = %leftover, "Authoritative tensor has no place in the skeleton");
        }
        tracing::debug!(entries = entries.len(), "Built module correspondence map");
        Self {
            authoritative: true,
            entries,
        }
    }

    /// Whether this rank holds the authoritative copy.
    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    pub fn get(&self, module: &str) -> Option<&ModuleWeights> {
        self.entries.get(module)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::save_tensors;
    use crate::model::VisionSpec;

    fn vlm() -> ModelSpec {
        ModelSpec {
            vision: Some(VisionSpec {
                hidden_size: 8,
                intermediate_size: 16,
                num_layers: 1,
            }),
            ..ModelSpec::tiny()
        }
    }

    #[test]
    fn test_seeded_source_is_deterministic() {
        let a = SeededSource::new(7).load(&ModelSpec::tiny(), DType::F32).unwrap();
        let b = SeededSource::new(7).load(&ModelSpec::tiny(), DType::F32).unwrap();
        let c = SeededSource::new(8).load(&ModelSpec::tiny(), DType::F32).unwrap();
        let key = "model.layers.1.feed_forward.w2.weight";
        assert!(a.get(key).unwrap().bit_eq(b.get(key).unwrap()));
        assert!(!a.get(key).unwrap().bit_eq(c.get(key).unwrap()));
        assert_eq!(a.get("model.norm.weight").unwrap().to_f32_vec(), vec![1.0; 16]);
    }

    #[test]
    fn test_safetensors_source_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let model = SeededSource::new(1).load(&ModelSpec::tiny(), DType::BF16).unwrap();
        save_tensors(&path, model.tensors(), None).unwrap();

        let loaded = SafetensorsSource::new(&path)
            .load(&ModelSpec::tiny(), DType::BF16)
            .unwrap();
        assert_eq!(loaded.len(), model.len());
        let key = "output.weight";
        assert!(loaded.get(key).unwrap().bit_eq(model.get(key).unwrap()));
    }

    #[test]
    fn test_detach_then_graft() {
        let spec = vlm();
        let loader = RankAuthoritativeLoader::new(Arc::new(SeededSource::new(1)))
            .with_surgery(Surgery::Detach {
                prefix: "vision_tower".to_string(),
            })
            .with_surgery(Surgery::Graft {
                prefix: "vision_tower".to_string(),
                source: Arc::new(SeededSource::new(2)),
            });
        let model = loader.load_local(&spec).unwrap();
        let donor = SeededSource::new(2).load(&spec, DType::F32).unwrap();
        let key = "vision_tower.layers.0.fc1.weight";
        assert!(model.get(key).unwrap().bit_eq(donor.get(key).unwrap()));
    }

    #[test]
    fn test_graft_onto_attached_subtree_fails() {
        let spec = vlm();
        let mut model = SeededSource::new(1).load(&spec, DType::F32).unwrap();
        let graft = Surgery::Graft {
            prefix: "vision_tower".to_string(),
            source: Arc::new(SeededSource::new(2)),
        };
        assert!(graft.apply(&mut model, &spec, DType::F32).is_err());
    }

    #[test]
    fn test_uniform_fill() {
        let spec = vlm();
        let mut model = SeededSource::new(1).load(&spec, DType::F32).unwrap();
        Surgery::UniformFill {
            prefix: "multi_modal_projector".to_string(),
        }
        .apply(&mut model, &spec, DType::F32)
        .unwrap();
        let w = model.get("multi_modal_projector.linear_1.weight").unwrap();
        assert!(w.to_f32_vec().iter().all(|&v| v == 1.0 / 128.0));
        let b = model.get("multi_modal_projector.linear_2.bias").unwrap();
        assert!(b.to_f32_vec().iter().all(|&v| v == 1.0 / 16.0));
    }

    #[test]
    fn test_prefix_matching_respects_boundaries() {
        assert!(under("model.layers.1.attention", "model.layers.1"));
        assert!(!under("model.layers.10.attention", "model.layers.1"));
        assert_eq!(module_of("model.norm.weight"), "model.norm");
    }

    #[test]
    fn test_correspondence_skips_mismatched_shapes() {
        let spec = ModelSpec::tiny();
        let sk = MetaSkeleton::build(&spec, DType::F32).unwrap();
        let mut model = SeededSource::new(0).load(&spec, DType::F32).unwrap();
        model
            .tensors
            .insert("model.norm.weight".to_string(), Tensor::ones(&[3], DType::F32));
        let map = ModuleCorrespondenceMap::build(&sk, Some(model));
        assert!(map.is_authoritative());
        assert!(map.get("model.norm").is_none());
        assert!(map.get("output").is_some());

        let empty = ModuleCorrespondenceMap::build(&sk, None);
        assert!(!empty.is_authoritative());
        assert!(empty.is_empty());
    }
}
