use crate::error::Result;
use crate::tensor::Tensor;

/// Abstraction for a distributed communication backend.
///
/// One value of this trait is one *communicator*: a fixed, ordered set of ranks that run
/// collectives together. `rank()` and `world_size()` are relative to that set. A world
/// communicator spans every process; [`CollectiveBackend::new_group`] carves out
/// sub-communicators for the mesh dimensions.
///
/// Every collective must be entered by every member of the communicator, in the same order.
/// A member that skips a collective leaves its peers waiting forever.
pub trait CollectiveBackend: Send + Sync {
    /// Rank of this process inside the communicator.
    fn rank(&self) -> usize;

    /// Number of ranks in the communicator.
    fn world_size(&self) -> usize;

    /// Sums `tensor` across all ranks in place. Every rank ends up with identical bits.
    fn all_reduce_sum(&self, tensor: &mut Tensor) -> Result<()>;

    /// Concatenates every rank's `tensor` along `axis`, in rank order.
    fn all_gather(&self, tensor: &Tensor, axis: usize) -> Result<Tensor>;

    /// Replaces `tensor` on every rank with `root`'s value.
    ///
    /// Non-root ranks must pass a tensor of the same shape; its contents are overwritten.
    fn broadcast(&self, tensor: &mut Tensor, root: usize) -> Result<()>;

    /// `root` hands part `i` of `parts` to rank `i`. Other ranks pass `None`.
    fn scatter(&self, parts: Option<Vec<Tensor>>, root: usize) -> Result<Tensor>;

    /// Returns once every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Creates a sub-communicator over `ranks`, given as ranks of *this* communicator in
    /// ascending order. Must be called by every member of `ranks`, in the same order
    /// relative to their other `new_group` calls.
    fn new_group(&self, ranks: &[usize]) -> Result<Self>
    where
        Self: Sized;
}
