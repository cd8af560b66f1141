//! Learning Rate Schedulers.
//!
//! Schedulers are *stateful*: each `step()` advances an internal counter and returns the
//! new learning rate, and the counter is part of the checkpoint. The training driver owns
//! two of them (a linear warmup and a cosine decay) and an [`LrSchedule`] that decides which
//! one advances on a given optimizer step.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Serializable scheduler position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Number of `step()` calls so far.
    pub last_epoch: usize,
    pub base_lr: f32,
}

/// A trait for learning rate schedulers.
pub trait LRScheduler {
    /// Advances one position and returns the new learning rate.
    fn step(&mut self) -> f32;

    /// Learning rate at the current position.
    fn get_lr(&self) -> f32;

    fn state(&self) -> SchedulerState;

    fn load_state(&mut self, state: SchedulerState);
}

/// Linear warmup multiplier: `x / warmup` below `warmup`, then exactly `1`.
pub fn warmup_factor(x: usize, warmup_steps: usize) -> f64 {
    if x < warmup_steps {
        x as f64 / warmup_steps as f64
    } else {
        1.0
    }
}

/// `base_lr * warmup_factor(last_epoch)`.
#[derive(Debug, Clone)]
pub struct WarmupSchedule {
    base_lr: f32,
    warmup_steps: usize,
    last_epoch: usize,
}

impl WarmupSchedule {
    pub fn new(base_lr: f32, warmup_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            last_epoch: 0,
        }
    }
}

impl LRScheduler for WarmupSchedule {
    fn step(&mut self) -> f32 {
        self.last_epoch += 1;
        self.get_lr()
    }

    fn get_lr(&self) -> f32 {
        (self.base_lr as f64 * warmup_factor(self.last_epoch, self.warmup_steps)) as f32
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            last_epoch: self.last_epoch,
            base_lr: self.base_lr,
        }
    }

    fn load_state(&mut self, state: SchedulerState) {
        self.last_epoch = state.last_epoch;
        self.base_lr = state.base_lr;
    }
}

/// Cosine decay from `base_lr` to `eta_min` over `t_max` steps.
///
/// $$
/// \eta_t = \eta_{min} + \frac{1}{2}(\eta_{base} - \eta_{min})\left(1 + \cos\frac{\pi t}{T_{max}}\right)
/// $$
#[derive(Debug, Clone)]
pub struct CosineAnnealing {
    base_lr: f32,
    eta_min: f32,
    t_max: usize,
    last_epoch: usize,
}

impl CosineAnnealing {
    pub fn new(base_lr: f32, t_max: usize) -> Self {
        Self {
            base_lr,
            eta_min: 0.0,
            t_max,
            last_epoch: 0,
        }
    }

    pub fn with_eta_min(mut self, eta_min: f32) -> Self {
        self.eta_min = eta_min;
        self
    }
}

impl LRScheduler for CosineAnnealing {
    fn step(&mut self) -> f32 {
        self.last_epoch += 1;
        self.get_lr()
    }

    fn get_lr(&self) -> f32 {
        if self.t_max == 0 {
            return self.eta_min;
        }
        let t = self.last_epoch.min(self.t_max) as f64;
        let cosine = 0.5 * (1.0 + (PI * t / self.t_max as f64).cos());
        (self.eta_min as f64 + (self.base_lr - self.eta_min) as f64 * cosine) as f32
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            last_epoch: self.last_epoch,
            base_lr: self.base_lr,
        }
    }

    fn load_state(&mut self, state: SchedulerState) {
        self.last_epoch = state.last_epoch;
        self.base_lr = state.base_lr;
    }
}

/// Which scheduler an optimizer step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePhase {
    WarmingUp,
    MainSchedule,
    Done,
}

/// Warmup followed by cosine decay; exactly one scheduler advances per step.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    warmup: WarmupSchedule,
    main: CosineAnnealing,
    warmup_steps: usize,
    total_steps: usize,
}

impl LrSchedule {
    pub fn new(base_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            warmup: WarmupSchedule::new(base_lr, warmup_steps),
            main: CosineAnnealing::new(base_lr, total_steps.saturating_sub(warmup_steps)),
            warmup_steps,
            total_steps,
        }
    }

    /// Steps `[0, warmup_steps)` warm up, `[warmup_steps, total_steps)` decay.
    pub fn phase(&self, step: usize) -> SchedulePhase {
        if step >= self.total_steps {
            SchedulePhase::Done
        } else if step < self.warmup_steps {
            SchedulePhase::WarmingUp
        } else {
            SchedulePhase::MainSchedule
        }
    }

    /// Advances the scheduler owning `step` and returns the learning rate for it.
    pub fn advance(&mut self, step: usize) -> f32 {
        match self.phase(step) {
            SchedulePhase::WarmingUp => self.warmup.step(),
            SchedulePhase::MainSchedule => self.main.step(),
            SchedulePhase::Done => self.main.get_lr(),
        }
    }

    pub fn warmup_state(&self) -> SchedulerState {
        self.warmup.state()
    }

    pub fn main_state(&self) -> SchedulerState {
        self.main.state()
    }

    pub fn load_states(&mut self, warmup: SchedulerState, main: SchedulerState) {
        self.warmup.load_state(warmup);
        self.main.load_state(main);
    }

    /// Learning rate after the most recent `advance(step)`.
    pub fn current_lr(&self, step: usize) -> f32 {
        match self.phase(step) {
            SchedulePhase::WarmingUp => self.warmup.get_lr(),
            SchedulePhase::MainSchedule | SchedulePhase::Done => self.main.get_lr(),
        }
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}
