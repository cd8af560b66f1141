//! Which modules become their own sharding unit, and which blocks recompute activations.
//!
//! A *sharding unit* is the granularity at which parameters are materialised and
//! synchronised. Units are formed bottom-up: every module accepted by the [`UnitPolicy`]
//! claims the leaves in its subtree that no deeper unit has claimed, and whatever is left
//! (embedding, final norm, unembedding) falls into the root unit, which is always last.

use crate::error::{Result, config_err};
use crate::model::{MetaSkeleton, ModuleId, ModuleKind};
use std::collections::HashMap;

/// Accepts modules by their kind tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapPolicy {
    kinds: Vec<ModuleKind>,
}

impl Default for WrapPolicy {
    fn default() -> Self {
        Self::new(ModuleKind::default_wrap_kinds())
    }
}

impl WrapPolicy {
    pub fn new(kinds: Vec<ModuleKind>) -> Self {
        Self { kinds }
    }

    pub fn should_wrap(&self, kind: ModuleKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn kinds(&self) -> &[ModuleKind] {
        &self.kinds
    }
}

/// Per-block activation recomputation flags.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecomputePolicy {
    flags: Vec<bool>,
}

impl RecomputePolicy {
    /// Flags the first `floor(ratio * num_blocks)` blocks.
    ///
    /// # Errors
    ///
    /// `Configuration` if `ratio` is outside `[0, 1]`.
    pub fn from_ratio(ratio: f64, num_blocks: usize) -> Result<Self> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(config_err(format!(
                "selective_recompute must be in [0, 1], got {ratio}"
            )));
        }
        let count = (num_blocks as f64 * ratio).floor() as usize;
        Ok(Self {
            flags: (0..num_blocks).map(|i| i < count).collect(),
        })
    }

    pub fn flags(&self) -> &[bool] {
        &self.flags
    }

    pub fn is_flagged(&self, block_index: usize) -> bool {
        self.flags.get(block_index).copied().unwrap_or(false)
    }

    pub fn num_recompute(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }
}

/// Logical OR of the wrap and recompute policies.
#[derive(Debug, Clone, Default)]
pub struct UnitPolicy {
    pub wrap: WrapPolicy,
    pub recompute: RecomputePolicy,
}

impl UnitPolicy {
    pub fn new(wrap: WrapPolicy, recompute: RecomputePolicy) -> Self {
        Self { wrap, recompute }
    }

    fn accepts(&self, kind: ModuleKind, block_index: Option<usize>) -> bool {
        self.wrap.should_wrap(kind) || block_index.is_some_and(|i| self.recompute.is_flagged(i))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingUnit {
    pub root: ModuleId,
    pub path: String,
    pub kind: ModuleKind,
    /// Leaf modules owned by this unit, in definition order.
    pub leaves: Vec<ModuleId>,
    pub recompute: bool,
}

/// Ordered units covering every leaf module exactly once.
#[derive(Debug, Clone, Default)]
pub struct ShardingPlan {
    units: Vec<ShardingUnit>,
}

impl ShardingPlan {
    pub fn build(skeleton: &MetaSkeleton, policy: &UnitPolicy) -> Self {
        let block_index: HashMap<ModuleId, usize> = skeleton
            .blocks()
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();

        let mut owner: HashMap<ModuleId, usize> = HashMap::new();
        let mut units = Vec::new();

        // Post-order: a unit only sees leaves its descendants left unclaimed.
        let mut order = Vec::new();
        let mut stack = vec![(skeleton.root(), false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            for &child in skeleton.module(id).children.iter().rev() {
                stack.push((child, false));
            }
        }

        for id in order {
            let node = skeleton.module(id);
            let is_root = id == skeleton.root();
            let block = block_index.get(&id).copied();
            if !is_root && !policy.accepts(node.kind, block) {
                continue;
            }
            let leaves: Vec<ModuleId> = skeleton
                .subtree(id)
                .into_iter()
                .filter(|leaf| skeleton.module(*leaf).is_leaf() && !owner.contains_key(leaf))
                .collect();
            if leaves.is_empty() && !is_root {
                continue;
            }
            for &leaf in &leaves {
                owner.insert(leaf, units.len());
            }
            units.push(ShardingUnit {
                root: id,
                path: node.path.clone(),
                kind: node.kind,
                leaves,
                recompute: block.is_some_and(|i| policy.recompute.is_flagged(i)),
            });
        }

        tracing::info!(
            units = units.len(),
            recompute = policy.recompute.num_recompute(),
            "Built sharding plan"
        );
        Self { units }
    }

    pub fn units(&self) -> &[ShardingUnit] {
        &self.units
    }

    /// Unit that owns `leaf`, if any.
    pub fn unit_of(&self, leaf: ModuleId) -> Option<&ShardingUnit> {
        self.units.iter().find(|u| u.leaves.contains(&leaf))
    }

    /// Paths of the blocks that recompute activations.
    pub fn recompute_paths(&self) -> Vec<&str> {
        self.units
            .iter()
            .filter(|u| u.recompute)
            .map(|u| u.path.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelSpec, VisionSpec};
    use crate::tensor::DType;

    #[test]
    fn test_recompute_floor() {
        let policy = RecomputePolicy::from_ratio(0.5, 5).unwrap();
        assert_eq!(policy.flags(), &[true, true, false, false, false]);
        assert_eq!(RecomputePolicy::from_ratio(1.0, 3).unwrap().num_recompute(), 3);
        assert_eq!(RecomputePolicy::from_ratio(0.0, 3).unwrap().num_recompute(), 0);
        assert!(RecomputePolicy::from_ratio(1.01, 3).is_err());
    }

    #[test]
    fn test_every_leaf_in_exactly_one_unit() {
        let spec = ModelSpec {
            vision: Some(VisionSpec {
                hidden_size: 8,
                intermediate_size: 16,
                num_layers: 2,
            }),
            ..ModelSpec::tiny()
        };
        let sk = MetaSkeleton::build(&spec, DType::F32).unwrap();
        let plan = ShardingPlan::build(&sk, &UnitPolicy::default());

        let mut seen = std::collections::HashSet::new();
        for unit in plan.units() {
            for leaf in &unit.leaves {
                assert!(seen.insert(*leaf), "leaf claimed twice");
            }
        }
        assert_eq!(seen.len(), sk.leaf_modules().len());

        // 2 vision layers + projector + 4 blocks + root.
        assert_eq!(plan.units().len(), 8);
        assert_eq!(plan.units().last().unwrap().root, sk.root());
    }

    #[test]
    fn test_root_unit_holds_embedding_and_head() {
        let sk = MetaSkeleton::build(&ModelSpec::tiny(), DType::F32).unwrap();
        let plan = ShardingPlan::build(&sk, &UnitPolicy::default());
        let root = plan.units().last().unwrap();
        let paths: Vec<_> = root.leaves.iter().map(|&l| sk.module(l).path.as_str()).collect();
        assert_eq!(paths, vec!["model.tok_embeddings", "model.norm", "output"]);
    }

    #[test]
    fn test_recompute_wraps_blocks_without_wrap_kind() {
        let sk = MetaSkeleton::build(&ModelSpec::tiny(), DType::F32).unwrap();
        let policy = UnitPolicy::new(
            WrapPolicy::new(vec![]),
            RecomputePolicy::from_ratio(0.5, sk.blocks().len()).unwrap(),
        );
        let plan = ShardingPlan::build(&sk, &policy);
        assert_eq!(plan.recompute_paths(), vec!["model.layers.0", "model.layers.1"]);
        // Two flagged blocks plus the root.
        assert_eq!(plan.units().len(), 3);
    }
}
