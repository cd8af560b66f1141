//! The device mesh: a `pp × dp × tp` grid over the world ranks.
//!
//! The tensor dimension is innermost, so tensor-parallel peers are adjacent ranks (on a real
//! cluster, the same node). Rank `r` sits at
//!
//! ```text
//! r = (pp_coord * dp + dp_coord) * tp + tp_coord
//! ```
//!
//! The mesh creates every sub-communicator exactly once, in the same order on every rank.
//! Nothing else in the crate calls `new_group`.

use super::backend::CollectiveBackend;
use crate::error::{Result, config_err};
use std::fmt;

/// A named mesh dimension, listed outermost to innermost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshDim {
    Pipeline,
    Data,
    Tensor,
}

impl MeshDim {
    pub const ALL: [MeshDim; 3] = [MeshDim::Pipeline, MeshDim::Data, MeshDim::Tensor];
}

impl fmt::Display for MeshDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MeshDim::Pipeline => "pp",
            MeshDim::Data => "dp",
            MeshDim::Tensor => "tp",
        })
    }
}

/// Sizes of the mesh dimensions. Pure arithmetic, no communicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshShape {
    pp: usize,
    dp: usize,
    tp: usize,
}

impl MeshShape {
    /// Derives the data-parallel width from the world size.
    pub fn new(world_size: usize, tp: usize, pp: usize) -> Result<Self> {
        if tp == 0 || pp == 0 || world_size == 0 || world_size % (tp * pp) != 0 {
            return Err(config_err(format!(
                "world size {world_size} cannot be split into tp={tp} x pp={pp}"
            )));
        }
        Ok(Self {
            pp,
            dp: world_size / (tp * pp),
            tp,
        })
    }

    /// Uses explicit sizes, which must multiply to `world_size`.
    pub fn with_dims(world_size: usize, dp: usize, tp: usize, pp: usize) -> Result<Self> {
        if dp * tp * pp != world_size || dp == 0 || tp == 0 || pp == 0 {
            return Err(config_err(format!(
                "mesh dp={dp} x tp={tp} x pp={pp} does not match world size {world_size}"
            )));
        }
        Ok(Self { pp, dp, tp })
    }

    pub fn world_size(&self) -> usize {
        self.pp * self.dp * self.tp
    }

    pub fn size(&self, dim: MeshDim) -> usize {
        match dim {
            MeshDim::Pipeline => self.pp,
            MeshDim::Data => self.dp,
            MeshDim::Tensor => self.tp,
        }
    }

    fn stride(&self, dim: MeshDim) -> usize {
        match dim {
            MeshDim::Pipeline => self.dp * self.tp,
            MeshDim::Data => self.tp,
            MeshDim::Tensor => 1,
        }
    }

    pub fn coordinate(&self, rank: usize, dim: MeshDim) -> usize {
        (rank / self.stride(dim)) % self.size(dim)
    }

    /// `(pp, dp, tp)` coordinates of `rank`.
    pub fn coordinates(&self, rank: usize) -> (usize, usize, usize) {
        (
            self.coordinate(rank, MeshDim::Pipeline),
            self.coordinate(rank, MeshDim::Data),
            self.coordinate(rank, MeshDim::Tensor),
        )
    }

    /// Inverse of [`MeshShape::coordinates`].
    pub fn rank_of(&self, pp: usize, dp: usize, tp: usize) -> usize {
        (pp * self.dp + dp) * self.tp + tp
    }

    /// Ranks sharing every coordinate of `rank` except `dim`, ascending.
    pub fn group_ranks(&self, rank: usize, dim: MeshDim) -> Vec<usize> {
        let stride = self.stride(dim);
        let base = rank - self.coordinate(rank, dim) * stride;
        (0..self.size(dim)).map(|c| base + c * stride).collect()
    }
}

/// A rank's view of the mesh: its coordinates and one communicator per dimension.
pub struct DeviceMesh<B: CollectiveBackend> {
    shape: MeshShape,
    rank: usize,
    world: B,
    pipeline: B,
    data: B,
    tensor: B,
}

impl<B: CollectiveBackend> DeviceMesh<B> {
    /// Builds the mesh over `world`. Collective: every rank must call it.
    pub fn new(shape: MeshShape, world: B) -> Result<Self> {
        if world.world_size() != shape.world_size() {
            return Err(config_err(format!(
                "mesh expects {} ranks, backend has {}",
                shape.world_size(),
                world.world_size()
            )));
        }
        let rank = world.rank();
        let pipeline = world.new_group(&shape.group_ranks(rank, MeshDim::Pipeline))?;
        let data = world.new_group(&shape.group_ranks(rank, MeshDim::Data))?;
        let tensor = world.new_group(&shape.group_ranks(rank, MeshDim::Tensor))?;

        let (pp, dp, tp) = shape.coordinates(rank);
        tracing::debug!(rank, pp, dp, tp, "Resolved mesh coordinates");
        if rank == 0 {
            tracing::info!(
                pp = shape.size(MeshDim::Pipeline),
                dp = shape.size(MeshDim::Data),
                tp = shape.size(MeshDim::Tensor),
                "Built device mesh"
            );
        }
        Ok(Self {
            shape,
            rank,
            world,
            pipeline,
            data,
            tensor,
        })
    }

    pub fn shape(&self) -> MeshShape {
        self.shape
    }

    /// Global rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.shape.world_size()
    }

    pub fn coordinate(&self, dim: MeshDim) -> usize {
        self.shape.coordinate(self.rank, dim)
    }

    pub fn size(&self, dim: MeshDim) -> usize {
        self.shape.size(dim)
    }

    /// Communicator over the ranks that differ from this one only in `dim`.
    pub fn group(&self, dim: MeshDim) -> &B {
        match dim {
            MeshDim::Pipeline => &self.pipeline,
            MeshDim::Data => &self.data,
            MeshDim::Tensor => &self.tensor,
        }
    }

    pub fn world(&self) -> &B {
        &self.world
    }

    /// The single rank at coordinate 0 on every dimension. It alone materialises the full
    /// model and writes training state.
    pub fn is_authoritative(&self) -> bool {
        self.rank == 0
    }

    pub fn barrier(&self) -> Result<()> {
        self.world.barrier()
    }
}
