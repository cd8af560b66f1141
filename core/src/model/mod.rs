//! Structural description of the model being trained.
//!
//! Only the parts of a transformer that matter for *placement* are described here: module
//! hierarchy, parameter shapes, and a role tag per module. The tag set is closed, so every
//! wrap or shard decision is an exhaustive `match` instead of a string comparison against
//! a runtime class name.

pub mod skeleton;

pub use skeleton::{MetaSkeleton, ModuleId, ModuleNode, ParamDesc, ParamInit, ParamSlot};

use crate::error::{Result, config_err};
use serde::{Deserialize, Serialize};

/// Role of a linear projection inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearRole {
    /// Fused query/key/value projection.
    Qkv,
    /// Attention output projection.
    AttnOut,
    /// Feed-forward gate projection (`w1`).
    Gate,
    /// Feed-forward up projection (`w3`).
    Up,
    /// Feed-forward down projection (`w2`).
    Down,
    ProjectorIn,
    ProjectorOut,
    /// Any projection without a tensor-parallel role (e.g. inside the vision tower).
    Generic,
}

/// Closed set of module roles, assigned when the skeleton is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Structural grouping with no parameters of its own.
    Container,
    Embedding,
    /// One transformer decoder block.
    Block,
    Attention,
    FeedForward,
    Norm,
    Linear(LinearRole),
    Unembedding,
    VisionEncoderLayer,
    /// Multimodal projector between the vision tower and the language model.
    Projector,
}

impl ModuleKind {
    /// Module kinds that become their own sharding unit unless configured otherwise.
    pub fn default_wrap_kinds() -> Vec<ModuleKind> {
        vec![
            ModuleKind::Block,
            ModuleKind::VisionEncoderLayer,
            ModuleKind::Projector,
        ]
    }
}

/// Which attention kernel a module dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKernel {
    Dense,
    /// Variable-length kernel over packed sequences (cumulative sequence lengths).
    PackedVarlen,
}

/// Attention attributes derived from hidden width.
///
/// Tensor parallelism divides these by the TP width so that attention math runs on the
/// local shard's heads only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionAttrs {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub hidden_size: usize,
    pub kernel: AttentionKernel,
}

/// Vision tower shape for the multimodal recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionSpec {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_layers: usize,
}

/// Architecture hyper-parameters of a decoder-only transformer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Identifier handed to the weight source.
    pub name: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    #[serde(default)]
    pub vision: Option<VisionSpec>,
}

impl ModelSpec {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Rows of the fused QKV weight.
    pub fn qkv_out_features(&self) -> usize {
        (self.num_heads + 2 * self.num_kv_heads) * self.head_dim()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.num_kv_heads == 0 {
            return Err(config_err("head counts must be positive"));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(config_err(format!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(config_err(format!(
                "num_heads {} is not a multiple of num_kv_heads {}",
                self.num_heads, self.num_kv_heads
            )));
        }
        Ok(())
    }

    /// Path prefix of the language model inside the module tree.
    pub fn language_prefix(&self) -> &'static str {
        if self.vision.is_some() {
            "language_model."
        } else {
            ""
        }
    }

    /// A small model, handy for tests and the demo binary.
    pub fn tiny() -> Self {
        Self {
            name: "tiny-internlm2".to_string(),
            vocab_size: 64,
            hidden_size: 16,
            intermediate_size: 32,
            num_layers: 4,
            num_heads: 4,
            num_kv_heads: 2,
            vision: None,
        }
    }
}
