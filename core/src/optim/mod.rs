pub mod adamw;
pub mod scheduler;

pub use adamw::AdamW;
pub use scheduler::{
    CosineAnnealing, LRScheduler, LrSchedule, SchedulePhase, SchedulerState, WarmupSchedule,
};

use crate::distributed::fsdp::ParamStore;
use crate::error::Result;
use crate::tensor::Tensor;
use std::collections::BTreeMap;

/// A trait for optimizers.
///
/// Optimizers update the *local shard* of every parameter from its (already reduced)
/// gradient. Their state is keyed by parameter path, so it is sharded exactly like the
/// parameters and each rank checkpoints only its own slice.
pub trait Optimizer {
    /// Performs a single optimization step.
    ///
    /// # Errors
    ///
    /// Returns an error if gradients have not been reduced across data-parallel ranks yet,
    /// or if a gradient's shape does not match its parameter.
    fn step(&mut self, params: &mut ParamStore) -> Result<()>;

    /// Drops every gradient.
    fn zero_grad(&mut self, params: &mut ParamStore) {
        params.clear_grads();
    }

    fn set_lr(&mut self, lr: f32);

    fn lr(&self) -> f32;

    /// Optimizer state as named tensors.
    fn state_dict(&self) -> BTreeMap<String, Tensor>;

    fn load_state_dict(&mut self, state: &BTreeMap<String, Tensor>) -> Result<()>;
}
