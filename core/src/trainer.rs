//! # Training Loop Driver
//!
//! One optimizer *step* consumes `per_step_iters` micro-batches (gradient accumulation):
//!
//! $$
//! \text{per\_step\_iters} = \frac{\text{global\_batch\_size}}{\text{micro\_batch\_size} \times \text{dp}}
//! $$
//!
//! and an epoch is `ceil(per_epoch_iters / per_step_iters)` steps, the last one possibly
//! partial. The learning rate follows a linear warmup and then a cosine decay
//! ([`LrSchedule`]); exactly one of the two schedulers advances per step.
//!
//! ## 🧭 Uniform control flow
//!
//! Every rank executes the same number of steps, the same number of gradient all-reduces,
//! and decides logging and checkpointing from the step index alone. The samplers pad every
//! data-parallel rank to the same number of micro-batches, so even the partial step at an
//! epoch boundary is identical everywhere.

use crate::checkpoint::{
    CHECKPOINT_VERSION, CheckpointWriter, TrainingState, checkpoint_dir, load_checkpoint,
};
use crate::config::TrainConfig;
use crate::data::{Batch, DataLoader, DataLoaderIter, Dataset, PackedCollate, Sample};
use crate::distributed::backend::CollectiveBackend;
use crate::distributed::fsdp::{ForwardContext, ParamStore, ShardedModel};
use crate::distributed::mesh::MeshDim;
use crate::error::{Error, Result, config_err};
use crate::logging::{LogContext, TRAIN_TARGET};
use crate::model::ModelSpec;
use crate::optim::{LrSchedule, Optimizer};
use crate::tensor::Tensor;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Step arithmetic derived from the batch sizes and the dataset length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub per_step_iters: usize,
    pub per_epoch_iters: usize,
    pub per_epoch_steps: usize,
    pub total_steps: usize,
    pub warmup_steps: usize,
}

impl Schedule {
    pub fn compute(
        per_epoch_iters: usize,
        global_batch_size: usize,
        micro_batch_size: usize,
        dp: usize,
        epochs: usize,
        warmup_ratio: f64,
    ) -> Result<Self> {
        if micro_batch_size == 0 || dp == 0 {
            return Err(config_err("micro_batch_size and dp must be positive"));
        }
        let per_step_iters = global_batch_size / micro_batch_size / dp;
        if per_step_iters == 0 {
            return Err(config_err(format!(
                "global_batch_size {global_batch_size} is smaller than micro_batch_size {micro_batch_size} x dp {dp}"
            )));
        }
        if per_epoch_iters == 0 {
            return Err(config_err("the dataloader yields no micro-batches"));
        }
        if !(0.0..=1.0).contains(&warmup_ratio) {
            return Err(config_err(format!(
                "warmup_ratio must be in [0, 1], got {warmup_ratio}"
            )));
        }
        let per_epoch_steps = per_epoch_iters.div_ceil(per_step_iters);
        let total_steps = per_epoch_steps * epochs;
        let warmup_steps = (warmup_ratio * total_steps as f64) as usize;
        Ok(Self {
            per_step_iters,
            per_epoch_iters,
            per_epoch_steps,
            total_steps,
            warmup_steps,
        })
    }

    pub fn epoch_of(&self, step: usize) -> usize {
        step / self.per_epoch_steps
    }
}

/// Converts a configured interval to a step count.
///
/// Values below 1 are a fraction of `total_steps`; values of 1 or more are absolute. Both
/// are floored. The result may be 0, which [`is_interval`] treats as "final step only".
pub fn checkpoint_interval(value: f64, total_steps: usize) -> Result<usize> {
    if !value.is_finite() || value < 0.0 {
        return Err(config_err(format!(
            "checkpoint_interval must be a non-negative number, got {value}"
        )));
    }
    if value < 1.0 {
        Ok((value * total_steps as f64) as usize)
    } else {
        Ok(value as usize)
    }
}

/// `true` on every `interval`-th step and on the final one.
pub fn is_interval(step: usize, total_steps: usize, interval: usize) -> bool {
    step + 1 == total_steps || (interval != 0 && (step + 1) % interval == 0)
}

/// Forward and backward pass, supplied by the model implementation.
pub trait Objective<B: CollectiveBackend> {
    /// Runs one micro-batch, accumulating `loss_scale`-weighted gradients into `params`
    /// through [`ParamStore::accumulate_grad`]. Returns the scaled loss.
    ///
    /// `ctx` names the blocks that must recompute activations in backward and the
    /// row-parallel modules whose outputs need a TP all-reduce.
    fn forward_backward(
        &mut self,
        params: &mut ParamStore,
        batch: &Batch,
        loss_scale: f32,
        ctx: &ForwardContext<'_, B>,
    ) -> Result<f32>;
}

/// Peak device memory since the last reset.
pub trait MemoryProbe {
    fn max_allocated_bytes(&self) -> usize;

    fn reset_peak(&mut self);
}

/// For hosts without device memory accounting.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMemoryProbe;

impl MemoryProbe for NullMemoryProbe {
    fn max_allocated_bytes(&self) -> usize {
        0
    }

    fn reset_peak(&mut self) {}
}

/// Pulls the embedding rows of every input token toward zero.
///
/// $$
/// \mathcal{L} = \frac{1}{N} \sum_{i=1}^{N} \tfrac{1}{2} \lVert E_{x_i} \rVert^2,
/// \qquad \frac{\partial \mathcal{L}}{\partial E_{x_i}} = \frac{E_{x_i}}{N}
/// $$
///
/// A stand-in objective with a closed-form gradient, used to drive the loop end to end.
/// The embedding is replicated across tensor-parallel ranks, so no collective is needed.
#[derive(Debug, Clone)]
pub struct EmbeddingL2Objective {
    param: String,
}

impl EmbeddingL2Objective {
    pub fn new(spec: &ModelSpec) -> Self {
        Self {
            param: format!("{}model.tok_embeddings.weight", spec.language_prefix()),
        }
    }
}

impl<B: CollectiveBackend> Objective<B> for EmbeddingL2Objective {
    fn forward_backward(
        &mut self,
        params: &mut ParamStore,
        batch: &Batch,
        loss_scale: f32,
        _ctx: &ForwardContext<'_, B>,
    ) -> Result<f32> {
        let param = params
            .get(&self.param)
            .ok_or_else(|| config_err(format!("model has no `{}`", self.param)))?;
        let shape = param.value.shape().to_vec();
        let (vocab, hidden) = (shape[0], shape[1]);
        let table = param.value.to_f32_vec();

        let n = batch.input_ids.len().max(1) as f32;
        let mut grad = vec![0.0f32; table.len()];
        let mut loss = 0.0f32;
        for &token in &batch.input_ids {
            let row = token as usize % vocab;
            let range = row * hidden..(row + 1) * hidden;
            for (g, &w) in grad[range.clone()].iter_mut().zip(&table[range]) {
                loss += 0.5 * w * w;
                *g += w * loss_scale / n;
            }
        }
        params.accumulate_grad(&self.param, &Tensor::new(grad, &shape)?)?;
        Ok(loss * loss_scale / n)
    }
}

/// What a finished (or empty) run reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainSummary {
    /// Index of the last step run, if any.
    pub final_step: Option<usize>,
    pub steps_run: usize,
    pub last_loss: f32,
}

/// Per-step numbers that end up in the log record.
#[derive(Debug, Clone, Copy, Default)]
struct StepStats {
    loss: f32,
    text_tokens: usize,
    image_tokens: usize,
    data_time: Duration,
}

pub struct Trainer<B: CollectiveBackend, D: Dataset<Sample> + 'static> {
    config: TrainConfig,
    model: ShardedModel<B>,
    optimizer: Box<dyn Optimizer>,
    objective: Box<dyn Objective<B>>,
    loader: DataLoader<D, Sample, PackedCollate>,
    probe: Box<dyn MemoryProbe>,
    log: LogContext,
    schedule: Schedule,
    lr: LrSchedule,
    checkpoint_every: usize,
    writer: CheckpointWriter,
    start_step: usize,
}

impl<B: CollectiveBackend, D: Dataset<Sample> + 'static> Trainer<B, D> {
    /// Derives the schedule from the loader's length and the mesh's data-parallel width.
    pub fn new(
        config: TrainConfig,
        model: ShardedModel<B>,
        optimizer: Box<dyn Optimizer>,
        objective: Box<dyn Objective<B>>,
        loader: DataLoader<D, Sample, PackedCollate>,
        log: LogContext,
    ) -> Result<Self> {
        let mesh = Arc::clone(model.mesh());
        let schedule = Schedule::compute(
            loader.len(),
            config.global_batch_size,
            config.micro_batch_size,
            mesh.size(MeshDim::Data),
            config.epochs,
            config.warmup_ratio,
        )?;
        let lr = LrSchedule::new(config.lr, schedule.warmup_steps, schedule.total_steps);
        let checkpoint_every = checkpoint_interval(config.checkpoint_interval, schedule.total_steps)?;
        if checkpoint_every == 0 {
            let _guard = log.enter();
            tracing::warn!("checkpoint_interval rounds to 0 steps, only the final step is saved");
        }
        let writer = CheckpointWriter::new(
            mesh.rank(),
            mesh.world_size(),
            config.checkpoint_drop_optimizer,
        );
        Ok(Self {
            config,
            model,
            optimizer,
            objective,
            loader,
            probe: Box::new(NullMemoryProbe),
            log,
            schedule,
            lr,
            checkpoint_every,
            writer,
            start_step: 0,
        })
    }

    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn lr_schedule(&self) -> &LrSchedule {
        &self.lr
    }

    pub fn model(&self) -> &ShardedModel<B> {
        &self.model
    }

    pub fn checkpoint_every(&self) -> usize {
        self.checkpoint_every
    }

    /// First step the next `run` executes.
    pub fn start_step(&self) -> usize {
        self.start_step
    }

    /// Loop position after `step` completed.
    pub fn training_state(&self, step: usize) -> TrainingState {
        TrainingState {
            version: CHECKPOINT_VERSION,
            step,
            total_steps: self.schedule.total_steps,
            warmup: self.lr.warmup_state(),
            main: self.lr.main_state(),
            world_size: self.model.mesh().world_size(),
        }
    }

    /// Restores a checkpoint written by [`Trainer::run`]; training continues at `step + 1`.
    ///
    /// # Errors
    ///
    /// `ResumeMismatch` if the checkpoint was cut from a schedule of a different length.
    pub fn resume(&mut self, dir: &Path) -> Result<()> {
        let _guard = self.log.enter();
        let mesh = Arc::clone(self.model.mesh());
        let ckpt = load_checkpoint(dir, mesh.rank())?;
        if ckpt.state.total_steps != self.schedule.total_steps {
            return Err(Error::ResumeMismatch {
                saved: ckpt.state.total_steps,
                expected: self.schedule.total_steps,
            });
        }
        if ckpt.state.world_size != mesh.world_size() {
            return Err(config_err(format!(
                "checkpoint was written by {} ranks, this run has {}",
                ckpt.state.world_size,
                mesh.world_size()
            )));
        }
        let Some(optimizer_state) = ckpt.optimizer else {
            return Err(config_err(format!(
                "{} holds no optimizer state and cannot be resumed",
                dir.display()
            )));
        };
        self.model.load_model_state(&ckpt.model)?;
        self.optimizer.load_state_dict(&optimizer_state)?;
        self.lr.load_states(ckpt.state.warmup, ckpt.state.main);
        self.start_step = ckpt.state.step + 1;
        tracing::info!(
            dir = %dir.display(),
            step = ckpt.state.step,
            epoch = ckpt.state.epoch(self.schedule.per_epoch_steps),
            "Resumed from checkpoint"
        );
        Ok(())
    }

    /// Runs from the current position to `total_steps`.
    pub fn run(&mut self) -> Result<TrainSummary> {
        let _guard = self.log.enter();
        let schedule = self.schedule;
        let total_steps = schedule.total_steps;
        let mesh = Arc::clone(self.model.mesh());
        let loss_scale = 1.0 / schedule.per_step_iters as f32;

        tracing::info!(
            rank = mesh.rank(),
            start_step = self.start_step,
            total_steps,
            per_step_iters = schedule.per_step_iters,
            per_epoch_steps = schedule.per_epoch_steps,
            warmup_steps = schedule.warmup_steps,
            checkpoint_every = self.checkpoint_every,
            "Begin train loop"
        );

        let train_start = Instant::now();
        let mut data_iter: Option<DataLoaderIter<D, Sample, PackedCollate>> = None;
        let mut summary = TrainSummary {
            final_step: None,
            steps_run: 0,
            last_loss: 0.0,
        };

        for step in self.start_step..total_steps {
            let epoch = schedule.epoch_of(step);
            if step % schedule.per_epoch_steps == 0 || data_iter.is_none() {
                self.loader.set_epoch(epoch);
                let mut iter = self.loader.iter();
                // A resume inside an epoch continues after the micro-batches already consumed.
                let inner_step = step % schedule.per_epoch_steps;
                if inner_step != 0 {
                    iter.skip_batches(inner_step * schedule.per_step_iters);
                    tracing::info!(epoch, inner_step, "Fast-forwarded data iterator");
                }
                data_iter = Some(iter);
            }

            let lr = self.lr.advance(step);
            self.optimizer.set_lr(lr);
            self.probe.reset_peak();

            let step_start = Instant::now();
            let mut stats = StepStats::default();
            for _ in 0..schedule.per_step_iters {
                let fetch = Instant::now();
                let Some(batch) = data_iter.as_mut().and_then(Iterator::next) else {
                    break;
                };
                stats.data_time += fetch.elapsed();
                let (params, ctx) = self.model.forward_parts();
                stats.loss += self
                    .objective
                    .forward_backward(params, &batch, loss_scale, &ctx)?;
                stats.text_tokens += batch.text_tokens();
                stats.image_tokens += batch.image_tokens();
            }

            self.model.reduce_gradients()?;
            let grad_norm = self.model.clip_grad_norm(self.config.max_grad_norm)?;
            self.optimizer.step(self.model.params_mut())?;
            self.optimizer.zero_grad(self.model.params_mut());

            let step_time = step_start.elapsed().as_secs_f64();
            if is_interval(step, total_steps, self.config.log_interval) {
                self.log_step(epoch, step, lr, grad_norm, &stats, step_time);
            }
            if is_interval(step, total_steps, self.checkpoint_every) {
                self.save_checkpoint(step)?;
            }

            summary.final_step = Some(step);
            summary.steps_run += 1;
            summary.last_loss = stats.loss;
        }

        tracing::info!(
            seconds = train_start.elapsed().as_secs_f64(),
            steps = summary.steps_run,
            "Train loop finished"
        );
        Ok(summary)
    }

    fn log_step(
        &self,
        epoch: usize,
        step: usize,
        lr: f32,
        grad_norm: f32,
        stats: &StepStats,
        step_time: f64,
    ) {
        let total_steps = self.schedule.total_steps;
        let tokens = stats.text_tokens + stats.image_tokens;
        let tgs = if step_time > 0.0 {
            (tokens as f64 / step_time) as u64
        } else {
            0
        };
        let eta = Duration::from_secs_f64(step_time * (total_steps - step) as f64);
        let max_memory_gib = self.probe.max_allocated_bytes() as f64 / (1u64 << 30) as f64;
        tracing::info!(
            target: TRAIN_TARGET,
            epoch,
            step = step + 1,
            total_steps,
            lr,
            loss = stats.loss,
            grad_norm,
            max_memory_gib,
            text_tokens = stats.text_tokens,
            image_tokens = stats.image_tokens,
            tgs,
            data_time = stats.data_time.as_secs_f64(),
            step_time,
            eta = eta.as_secs(),
            "[Train] (Epoch {epoch}) Step {}/{total_steps}",
            step + 1
        );
    }

    /// Writes this rank's shards for `step`, then waits for every rank to finish.
    fn save_checkpoint(&self, step: usize) -> Result<()> {
        let mesh = self.model.mesh();
        let dir = checkpoint_dir(&self.config.work_dir, step, self.schedule.total_steps);
        self.writer.save(
            &dir,
            &self.model.model_state(),
            &self.optimizer.state_dict(),
            &self.training_state(step),
            mesh.is_authoritative(),
        )?;
        mesh.barrier()?;
        tracing::info!(dir = %dir.display(), step, "Saved checkpoint");
        Ok(())
    }
}
