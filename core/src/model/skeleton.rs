//! Meta skeleton: a storage-free replica of the model.
//!
//! Building the skeleton is phase one of a two-phase construction. Every process builds the
//! same arena of module nodes and parameter descriptors, in the same order, without
//! allocating a single weight. Phase two (the lazy initializer) fills a slot's storage only
//! when its module is claimed by a sharding unit.
//!
//! Modules and parameters are addressed by their structural path
//! (`model.layers.3.attention.wqkv`, `model.layers.3.attention.wqkv.weight`). Because the
//! paths are identical on every rank, the authoritative copy can be matched to the skeleton
//! by path alone.

use super::{
    AttentionAttrs, AttentionKernel, LinearRole, ModelSpec, ModuleKind, VisionSpec,
};
use crate::distributed::tp_plan::ShardSpec;
use crate::error::Result;
use crate::tensor::{DType, Tensor};
use std::collections::{BTreeMap, HashMap};

/// Index of a module in the skeleton arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub usize);

/// Deterministic fill used when a parameter is allocated without an authoritative source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamInit {
    Zeros,
    Ones,
}

/// Shape-only description of a parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDesc {
    /// Full, unsharded shape.
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub init: ParamInit,
}

impl ParamDesc {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// One parameter: its description, how it is partitioned, and (once materialised) the local shard.
#[derive(Debug, Clone)]
pub struct ParamSlot {
    pub desc: ParamDesc,
    pub spec: ShardSpec,
    pub value: Option<Tensor>,
}

impl ParamSlot {
    /// Shape of the shard this rank owns.
    pub fn local_shape(&self) -> Vec<usize> {
        self.spec.local_shape(&self.desc.shape)
    }

    /// Allocates storage from the descriptor's fill.
    pub fn allocate(&self) -> Tensor {
        let shape = self.local_shape();
        match self.desc.init {
            ParamInit::Zeros => Tensor::zeros(&shape, self.desc.dtype),
            ParamInit::Ones => Tensor::ones(&shape, self.desc.dtype),
        }
    }
}

/// A node in the module tree.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub path: String,
    pub kind: ModuleKind,
    pub parent: Option<ModuleId>,
    pub children: Vec<ModuleId>,
    /// Full paths of the parameters this module owns directly.
    pub params: Vec<String>,
    pub attention: Option<AttentionAttrs>,
}

impl ModuleNode {
    /// A leaf owns parameters directly.
    pub fn is_leaf(&self) -> bool {
        !self.params.is_empty()
    }
}

/// Arena of module nodes and parameter slots, in definition order.
#[derive(Debug, Clone)]
pub struct MetaSkeleton {
    modules: Vec<ModuleNode>,
    params: BTreeMap<String, ParamSlot>,
    index: HashMap<String, ModuleId>,
    blocks: Vec<ModuleId>,
}

/// Joins a parent path and a child name.
fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

impl MetaSkeleton {
    /// Builds the skeleton for `spec` with every parameter typed as `dtype`.
    ///
    /// No storage is allocated.
    pub fn build(spec: &ModelSpec, dtype: DType) -> Result<Self> {
        spec.validate()?;
        let mut sk = Self {
            modules: Vec::new(),
            params: BTreeMap::new(),
            index: HashMap::new(),
            blocks: Vec::new(),
        };
        let root = sk.push(None, "", ModuleKind::Container);

        let lm_root = match spec.vision {
            Some(ref vision) => {
                sk.build_vision(root, spec, vision, dtype);
                sk.push(Some(root), "language_model", ModuleKind::Container)
            }
            None => root,
        };
        sk.build_language_model(lm_root, spec, dtype);

        tracing::debug!(
            modules = sk.modules.len(),
            params = sk.params.len(),
            numel = sk.numel(),
            "Built meta skeleton"
        );
        Ok(sk)
    }

    fn build_language_model(&mut self, root: ModuleId, spec: &ModelSpec, dtype: DType) {
        let h = spec.hidden_size;
        let model = self.child(root, "model", ModuleKind::Container);

        let emb = self.child(model, "tok_embeddings", ModuleKind::Embedding);
        self.param(emb, "weight", &[spec.vocab_size, h], dtype, ParamInit::Zeros);

        let layers = self.child(model, "layers", ModuleKind::Container);
        for i in 0..spec.num_layers {
            let block = self.child(layers, &i.to_string(), ModuleKind::Block);
            self.blocks.push(block);

            let attn = self.child(block, "attention", ModuleKind::Attention);
            self.modules[attn.0].attention = Some(AttentionAttrs {
                num_heads: spec.num_heads,
                num_kv_heads: spec.num_kv_heads,
                head_dim: spec.head_dim(),
                hidden_size: h,
                kernel: AttentionKernel::Dense,
            });
            let wqkv = self.child(attn, "wqkv", ModuleKind::Linear(LinearRole::Qkv));
            self.param(wqkv, "weight", &[spec.qkv_out_features(), h], dtype, ParamInit::Zeros);
            let wo = self.child(attn, "wo", ModuleKind::Linear(LinearRole::AttnOut));
            self.param(wo, "weight", &[h, spec.num_heads * spec.head_dim()], dtype, ParamInit::Zeros);

            let attn_norm = self.child(block, "attention_norm", ModuleKind::Norm);
            self.param(attn_norm, "weight", &[h], dtype, ParamInit::Ones);

            let ffn = self.child(block, "feed_forward", ModuleKind::FeedForward);
            let inter = spec.intermediate_size;
            let w1 = self.child(ffn, "w1", ModuleKind::Linear(LinearRole::Gate));
            self.param(w1, "weight", &[inter, h], dtype, ParamInit::Zeros);
            let w3 = self.child(ffn, "w3", ModuleKind::Linear(LinearRole::Up));
            self.param(w3, "weight", &[inter, h], dtype, ParamInit::Zeros);
            let w2 = self.child(ffn, "w2", ModuleKind::Linear(LinearRole::Down));
            self.param(w2, "weight", &[h, inter], dtype, ParamInit::Zeros);

            let ffn_norm = self.child(block, "ffn_norm", ModuleKind::Norm);
            self.param(ffn_norm, "weight", &[h], dtype, ParamInit::Ones);
        }

        let norm = self.child(model, "norm", ModuleKind::Norm);
        self.param(norm, "weight", &[h], dtype, ParamInit::Ones);

        let output = self.child(root, "output", ModuleKind::Unembedding);
        self.param(output, "weight", &[spec.vocab_size, h], dtype, ParamInit::Zeros);
    }

    fn build_vision(&mut self, root: ModuleId, spec: &ModelSpec, vision: &VisionSpec, dtype: DType) {
        let vh = vision.hidden_size;
        let tower = self.child(root, "vision_tower", ModuleKind::Container);
        let layers = self.child(tower, "layers", ModuleKind::Container);
        for i in 0..vision.num_layers {
            let layer = self.child(layers, &i.to_string(), ModuleKind::VisionEncoderLayer);
            let ln = self.child(layer, "layer_norm", ModuleKind::Norm);
            self.param(ln, "weight", &[vh], dtype, ParamInit::Ones);
            self.param(ln, "bias", &[vh], dtype, ParamInit::Zeros);
            let fc1 = self.child(layer, "fc1", ModuleKind::Linear(LinearRole::Generic));
            self.param(fc1, "weight", &[vision.intermediate_size, vh], dtype, ParamInit::Zeros);
            let fc2 = self.child(layer, "fc2", ModuleKind::Linear(LinearRole::Generic));
            self.param(fc2, "weight", &[vh, vision.intermediate_size], dtype, ParamInit::Zeros);
        }

        let proj = self.child(root, "multi_modal_projector", ModuleKind::Projector);
        let l1 = self.child(proj, "linear_1", ModuleKind::Linear(LinearRole::ProjectorIn));
        self.param(l1, "weight", &[spec.hidden_size, vh], dtype, ParamInit::Zeros);
        self.param(l1, "bias", &[spec.hidden_size], dtype, ParamInit::Zeros);
        let l2 = self.child(proj, "linear_2", ModuleKind::Linear(LinearRole::ProjectorOut));
        self.param(l2, "weight", &[spec.hidden_size, spec.hidden_size], dtype, ParamInit::Zeros);
        self.param(l2, "bias", &[spec.hidden_size], dtype, ParamInit::Zeros);
    }

    fn push(&mut self, parent: Option<ModuleId>, path: &str, kind: ModuleKind) -> ModuleId {
        let id = ModuleId(self.modules.len());
        self.modules.push(ModuleNode {
            path: path.to_string(),
            kind,
            parent,
            children: Vec::new(),
            params: Vec::new(),
            attention: None,
        });
        self.index.insert(path.to_string(), id);
        if let Some(p) = parent {
            self.modules[p.0].children.push(id);
        }
        id
    }

    fn child(&mut self, parent: ModuleId, name: &str, kind: ModuleKind) -> ModuleId {
        let path = join(&self.modules[parent.0].path, name);
        self.push(Some(parent), &path, kind)
    }

    fn param(&mut self, module: ModuleId, name: &str, shape: &[usize], dtype: DType, init: ParamInit) {
        let path = join(&self.modules[module.0].path, name);
        self.modules[module.0].params.push(path.clone());
        self.params.insert(
            path,
            ParamSlot {
                desc: ParamDesc {
                    shape: shape.to_vec(),
                    dtype,
                    init,
                },
                spec: ShardSpec::replicate(),
                value: None,
            },
        );
    }

    /// Routes every attention module to the packed variable-length kernel.
    ///
    /// A structural rewrite: parameters are untouched.
    pub fn dispatch_packed_kernels(&mut self) {
        let mut rewritten = 0;
        for node in &mut self.modules {
            if let Some(attrs) = node.attention.as_mut() {
                attrs.kernel = AttentionKernel::PackedVarlen;
                rewritten += 1;
            }
        }
        tracing::info!(modules = rewritten, "Dispatched packed-sequence attention kernels");
    }

    pub fn modules(&self) -> &[ModuleNode] {
        &self.modules
    }

    pub fn module(&self, id: ModuleId) -> &ModuleNode {
        &self.modules[id.0]
    }

    pub fn module_mut(&mut self, id: ModuleId) -> &mut ModuleNode {
        &mut self.modules[id.0]
    }

    pub fn root(&self) -> ModuleId {
        ModuleId(0)
    }

    /// Looks a module up by structural path.
    pub fn find(&self, path: &str) -> Option<ModuleId> {
        self.index.get(path).copied()
    }

    /// Language-model transformer blocks in definition order.
    pub fn blocks(&self) -> &[ModuleId] {
        &self.blocks
    }

    /// Every module that owns parameters, in definition order.
    pub fn leaf_modules(&self) -> Vec<ModuleId> {
        (0..self.modules.len())
            .map(ModuleId)
            .filter(|id| self.modules[id.0].is_leaf())
            .collect()
    }

    /// `id` and all its descendants, pre-order.
    pub fn subtree(&self, id: ModuleId) -> Vec<ModuleId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.modules[next.0].children.iter().rev().copied());
        }
        out
    }

    pub fn params(&self) -> &BTreeMap<String, ParamSlot> {
        &self.params
    }

    /// Slots owned directly by `id`, in declaration order.
    pub fn params_of(&self, id: ModuleId) -> Vec<(&str, &ParamSlot)> {
        self.modules[id.0]
            .params
            .iter()
            .filter_map(|p| self.params.get(p).map(|slot| (p.as_str(), slot)))
            .collect()
    }

    pub fn param_slot(&self, path: &str) -> Option<&ParamSlot> {
        self.params.get(path)
    }

    pub fn param_slot_mut(&mut self, path: &str) -> Option<&mut ParamSlot> {
        self.params.get_mut(path)
    }

    /// Elements described by the skeleton (full, unsharded).
    pub fn numel(&self) -> usize {
        self.params.values().map(|p| p.desc.numel()).sum()
    }

    /// Bytes currently backed by storage on this rank.
    pub fn materialized_bytes(&self) -> usize {
        self.params
            .values()
            .filter_map(|p| p.value.as_ref())
            .map(Tensor::size_in_bytes)
            .sum()
    }

    pub fn is_materialized(&self) -> bool {
        self.params.values().all(|p| p.value.is_some())
    }

    /// Hands out the parameter slots, consuming the skeleton.
    pub fn into_params(self) -> BTreeMap<String, ParamSlot> {
        self.params
    }
}
