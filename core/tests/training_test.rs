use meshtune::bootstrap::{self, BootstrapOptions};
use meshtune::checkpoint::{TrainingState, checkpoint_dir, load_checkpoint};
use meshtune::config::TrainConfig;
use meshtune::data::{Batch, DataLoader, ParallelSampler, Sample};
use meshtune::distributed::fsdp::{ForwardContext, ParamStore};
use meshtune::distributed::{CpuBackend, DeviceMesh, MeshDim, MeshShape};
use meshtune::loader::{RankAuthoritativeLoader, SeededSource};
use meshtune::logging::LogContext;
use meshtune::model::ModelSpec;
use meshtune::optim::{AdamW, SchedulePhase};
use meshtune::tensor::{DType, Tensor};
use meshtune::trainer::{EmbeddingL2Objective, Objective, Schedule, TrainSummary, Trainer};
use meshtune::Error;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

const WORLD_SIZE: usize = 2;

fn dataset() -> Vec<Sample> {
    (0..16u32)
        .map(|i| Sample::text((0..6).map(|j| (i * 7 + j) % 64).collect()))
        .collect()
}

/// 16 samples over dp 2 with micro-batch 1: 8 micro-batches per rank, 2 per step,
/// 4 steps per epoch, 8 steps over 2 epochs, a checkpoint every 4.
fn config(work_dir: &Path) -> TrainConfig {
    TrainConfig {
        global_batch_size: 4,
        micro_batch_size: 1,
        epochs: 2,
        warmup_ratio: 0.25,
        checkpoint_interval: 4.0,
        lr: 1e-2,
        log_level: "warn".to_string(),
        work_dir: work_dir.to_path_buf(),
        ..TrainConfig::default()
    }
}

struct RankOutcome {
    rank: usize,
    start_step: usize,
    summary: meshtune::Result<TrainSummary>,
    state: BTreeMap<String, Tensor>,
    lr_phase_at_start: SchedulePhase,
}

fn train_world(config: TrainConfig, resume: Option<PathBuf>) -> Vec<RankOutcome> {
    let handles: Vec<_> = CpuBackend::spawn_world(WORLD_SIZE)
        .into_iter()
        .map(|world| {
            let (config, resume) = (config.clone(), resume.clone());
            thread::spawn(move || {
                let rank = world.global_rank();
                let shape = MeshShape::new(WORLD_SIZE, config.tp_size, config.pp_size).unwrap();
                let mesh = Arc::new(DeviceMesh::new(shape, world).unwrap());
                let spec = ModelSpec::tiny();
                let loader = RankAuthoritativeLoader::new(Arc::new(SeededSource::new(9)));
                let model = bootstrap::run(
                    Arc::clone(&mesh),
                    spec.clone(),
                    BootstrapOptions::default(),
                    &loader,
                )
                .unwrap();
                let data = DataLoader::packed(dataset(), config.micro_batch_size).with_sampler(
                    ParallelSampler::new(mesh.size(MeshDim::Data), mesh.coordinate(MeshDim::Data), 0),
                );
                let mut trainer = Trainer::new(
                    config.clone(),
                    model,
                    Box::new(AdamW::new(config.lr)),
                    Box::new(EmbeddingL2Objective::new(&spec)),
                    data,
                    LogContext::new(rank, &config.log_level).unwrap(),
                )
                .unwrap();
                if let Some(dir) = resume {
                    trainer.resume(&dir).unwrap();
                }
                let start_step = trainer.start_step();
                let lr_phase_at_start = trainer.lr_schedule().phase(start_step);
                let summary = trainer.run();
                RankOutcome {
                    rank,
                    start_step,
                    summary,
                    state: trainer.model().model_state(),
                    lr_phase_at_start,
                }
            })
        })
        .collect();
    let mut outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    outcomes.sort_by_key(|o| o.rank);
    outcomes
}

#[test]
fn test_schedule_for_the_reference_recipe() {
    // 8 ranks, tp 2: dp 4. 100 micro-batches per rank, gbs 16, mbs 1.
    let s = Schedule::compute(100, 16, 1, 4, 1, 0.0).unwrap();
    assert_eq!(s.per_step_iters, 4);
    assert_eq!(s.total_steps, 25);
}

#[test]
fn test_full_run_writes_periodic_checkpoints() {
    let work = tempfile::tempdir().unwrap();
    let outcomes = train_world(config(work.path()), None);

    for outcome in &outcomes {
        let summary = outcome.summary.as_ref().unwrap();
        assert_eq!(summary.steps_run, 8);
        assert_eq!(summary.final_step, Some(7));
        assert!(summary.last_loss > 0.0);
    }
    for step in [3, 7] {
        let dir = checkpoint_dir(work.path(), step, 8);
        assert!(dir.ends_with(format!("ckpt-{step}")));
        for rank in 0..WORLD_SIZE {
            let ckpt = load_checkpoint(&dir, rank).unwrap();
            assert_eq!(ckpt.state.step, step);
            assert_eq!(ckpt.state.total_steps, 8);
            assert!(ckpt.optimizer.is_some());
        }
    }
    assert!(!checkpoint_dir(work.path(), 5, 8).exists());

    // Both replicas end bit-identical.
    for (name, t) in &outcomes[0].state {
        assert!(t.bit_eq(&outcomes[1].state[name]), "{name} diverged");
    }
}

#[test]
fn test_resume_matches_uninterrupted_run() {
    let full_dir = tempfile::tempdir().unwrap();
    let full = train_world(config(full_dir.path()), None);

    let resumed_dir = tempfile::tempdir().unwrap();
    let resumed = train_world(
        config(resumed_dir.path()),
        Some(checkpoint_dir(full_dir.path(), 3, 8)),
    );

    for (a, b) in full.iter().zip(&resumed) {
        assert_eq!(b.start_step, 4);
        assert_eq!(b.lr_phase_at_start, SchedulePhase::MainSchedule);
        let (sa, sb) = (a.summary.as_ref().unwrap(), b.summary.as_ref().unwrap());
        assert_eq!(sb.steps_run, 4);
        assert_eq!(sa.final_step, sb.final_step);
        assert_eq!(sa.last_loss, sb.last_loss);
        for (name, t) in &a.state {
            assert!(t.bit_eq(&b.state[name]), "rank {}: {name} differs after resume", a.rank);
        }
    }

    // The resumed run's own final checkpoint carries the same scheduler position.
    let state_of = |dir: &Path| -> TrainingState { load_checkpoint(dir, 0).unwrap().state };
    assert_eq!(
        state_of(&checkpoint_dir(full_dir.path(), 7, 8)),
        state_of(&checkpoint_dir(resumed_dir.path(), 7, 8)),
    );
}

#[test]
fn test_mid_epoch_resume_matches_uninterrupted_run() {
    // Checkpoint every step; step 1 sits inside the first 4-step epoch.
    let every_step = |dir: &Path| TrainConfig {
        checkpoint_interval: 1.0,
        ..config(dir)
    };
    let full_dir = tempfile::tempdir().unwrap();
    let full = train_world(every_step(full_dir.path()), None);

    let resumed_dir = tempfile::tempdir().unwrap();
    let resumed = train_world(
        every_step(resumed_dir.path()),
        Some(checkpoint_dir(full_dir.path(), 1, 8)),
    );

    for (a, b) in full.iter().zip(&resumed) {
        assert_eq!(b.start_step, 2);
        assert_eq!(b.summary.as_ref().unwrap().steps_run, 6);
        assert_eq!(
            a.summary.as_ref().unwrap().last_loss,
            b.summary.as_ref().unwrap().last_loss
        );
        for (name, t) in &a.state {
            assert!(t.bit_eq(&b.state[name]), "rank {}: {name} differs after resume", a.rank);
        }
    }
}

/// Checks what the forward pass can see, then defers to the embedding objective.
struct PlanAwareObjective {
    inner: EmbeddingL2Objective,
    calls: Arc<AtomicUsize>,
}

impl Objective<CpuBackend> for PlanAwareObjective {
    fn forward_backward(
        &mut self,
        params: &mut ParamStore,
        batch: &Batch,
        loss_scale: f32,
        ctx: &ForwardContext<'_, CpuBackend>,
    ) -> meshtune::Result<f32> {
        assert_eq!(ctx.mesh.size(MeshDim::Tensor), 2);
        let recompute = ctx.plan.recompute_paths();
        assert_eq!(recompute.len(), 2);
        assert!(ctx.recomputes("model.layers.0"));
        assert!(ctx.recomputes("model.layers.1"));
        assert!(!ctx.recomputes("model.layers.2"));
        assert!(ctx.requires_all_reduce("model.layers.3.attention.wo"));
        assert!(ctx.requires_all_reduce("model.layers.3.feed_forward.w2"));
        assert!(!ctx.requires_all_reduce("model.layers.3.feed_forward.w1"));
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.forward_backward(params, batch, loss_scale, ctx)
    }
}

#[test]
fn test_objective_sees_recompute_and_reduction_plans() {
    let work = tempfile::tempdir().unwrap();
    let cfg = TrainConfig {
        tp_size: 2,
        selective_recompute: 0.5,
        epochs: 1,
        checkpoint_interval: 0.0,
        ..config(work.path())
    };

    let handles: Vec<_> = CpuBackend::spawn_world(2)
        .into_iter()
        .map(|world| {
            let config = cfg.clone();
            thread::spawn(move || {
                let rank = world.global_rank();
                let mesh = Arc::new(
                    DeviceMesh::new(MeshShape::new(2, config.tp_size, 1).unwrap(), world).unwrap(),
                );
                let spec = ModelSpec::tiny();
                let loader = RankAuthoritativeLoader::new(Arc::new(SeededSource::new(9)));
                let options = BootstrapOptions::from_config(&config, DType::F32);
                let model = bootstrap::run(Arc::clone(&mesh), spec.clone(), options, &loader).unwrap();
                let calls = Arc::new(AtomicUsize::new(0));
                let objective = PlanAwareObjective {
                    inner: EmbeddingL2Objective::new(&spec),
                    calls: Arc::clone(&calls),
                };
                let mut trainer = Trainer::new(
                    config.clone(),
                    model,
                    Box::new(AdamW::new(config.lr)),
                    Box::new(objective),
                    DataLoader::packed(dataset(), 1),
                    LogContext::new(rank, "warn").unwrap(),
                )
                .unwrap();
                let summary = trainer.run().unwrap();
                (summary.steps_run, calls.load(Ordering::SeqCst))
            })
        })
        .collect();

    for handle in handles {
        // dp 1: 16 micro-batches, 4 per step.
        let (steps, calls) = handle.join().unwrap();
        assert_eq!(steps, 4);
        assert_eq!(calls, 16);
    }
}

#[test]
fn test_resume_from_a_different_schedule_is_rejected() {
    let work = tempfile::tempdir().unwrap();
    train_world(config(work.path()), None);

    // Three epochs: 12 steps instead of 8.
    let other = tempfile::tempdir().unwrap();
    let mut longer = config(other.path());
    longer.epochs = 3;
    let ckpt = checkpoint_dir(work.path(), 3, 8);

    let handles: Vec<_> = CpuBackend::spawn_world(WORLD_SIZE)
        .into_iter()
        .map(|world| {
            let (config, ckpt) = (longer.clone(), ckpt.clone());
            thread::spawn(move || {
                let rank = world.global_rank();
                let mesh = Arc::new(
                    DeviceMesh::new(MeshShape::new(WORLD_SIZE, 1, 1).unwrap(), world).unwrap(),
                );
                let spec = ModelSpec::tiny();
                let loader = RankAuthoritativeLoader::new(Arc::new(SeededSource::new(9)));
                let model =
                    bootstrap::run(Arc::clone(&mesh), spec.clone(), BootstrapOptions::default(), &loader)
                        .unwrap();
                let data = DataLoader::packed(dataset(), 1).with_sampler(ParallelSampler::new(
                    mesh.size(MeshDim::Data),
                    mesh.coordinate(MeshDim::Data),
                    0,
                ));
                let mut trainer = Trainer::new(
                    config.clone(),
                    model,
                    Box::new(AdamW::new(config.lr)),
                    Box::new(EmbeddingL2Objective::new(&spec)),
                    data,
                    LogContext::new(rank, "warn").unwrap(),
                )
                .unwrap();
                trainer.resume(&ckpt)
            })
        })
        .collect();

    for handle in handles {
        match handle.join().unwrap() {
            Err(Error::ResumeMismatch { saved, expected }) => {
                assert_eq!(saved, 8);
                assert_eq!(expected, 12);
            }
            other => panic!("expected ResumeMismatch, got {other:?}"),
        }
    }
}

#[test]
fn test_model_only_checkpoint_cannot_resume() {
    let work = tempfile::tempdir().unwrap();
    let mut cfg = config(work.path());
    cfg.checkpoint_drop_optimizer = true;
    train_world(cfg, None);

    let ckpt = checkpoint_dir(work.path(), 3, 8);
    let loaded = load_checkpoint(&ckpt, 1).unwrap();
    assert!(loaded.optimizer.is_none());
    assert!(!loaded.model.is_empty());

    let other = tempfile::tempdir().unwrap();
    let handles: Vec<_> = CpuBackend::spawn_world(WORLD_SIZE)
        .into_iter()
        .map(|world| {
            let (config, ckpt) = (config(other.path()), ckpt.clone());
            thread::spawn(move || {
                let rank = world.global_rank();
                let mesh = Arc::new(
                    DeviceMesh::new(MeshShape::new(WORLD_SIZE, 1, 1).unwrap(), world).unwrap(),
                );
                let spec = ModelSpec::tiny();
                let loader = RankAuthoritativeLoader::new(Arc::new(SeededSource::new(9)));
                let model =
                    bootstrap::run(Arc::clone(&mesh), spec.clone(), BootstrapOptions::default(), &loader)
                        .unwrap();
                let data = DataLoader::packed(dataset(), 1).with_sampler(ParallelSampler::new(
                    mesh.size(MeshDim::Data),
                    mesh.coordinate(MeshDim::Data),
                    0,
                ));
                let mut trainer = Trainer::new(
                    config.clone(),
                    model,
                    Box::new(AdamW::new(config.lr)),
                    Box::new(EmbeddingL2Objective::new(&spec)),
                    data,
                    LogContext::new(rank, "warn").unwrap(),
                )
                .unwrap();
                trainer.resume(&ckpt).is_err()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }
}

#[test]
fn test_warmup_hands_over_to_cosine_without_a_jump() {
    let work = tempfile::tempdir().unwrap();
    let world = CpuBackend::spawn_world(1).pop().unwrap();
    let mesh = Arc::new(DeviceMesh::new(MeshShape::new(1, 1, 1).unwrap(), world).unwrap());
    let spec = ModelSpec::tiny();
    let loader = RankAuthoritativeLoader::new(Arc::new(SeededSource::new(9)));
    let model = bootstrap::run(mesh, spec.clone(), BootstrapOptions::default(), &loader).unwrap();
    let cfg = TrainConfig {
        global_batch_size: 1,
        warmup_ratio: 0.1,
        ..config(work.path())
    };
    let trainer = Trainer::new(
        cfg.clone(),
        model,
        Box::new(AdamW::new(cfg.lr)),
        Box::new(EmbeddingL2Objective::new(&spec)),
        DataLoader::packed(dataset(), 1),
        LogContext::new(0, "warn").unwrap(),
    )
    .unwrap();

    // 16 steps per epoch, 2 epochs, 3 warmup steps.
    let schedule = *trainer.schedule();
    assert_eq!(schedule.total_steps, 32);
    assert_eq!(schedule.warmup_steps, 3);

    let mut lr = trainer.lr_schedule().clone();
    let rates: Vec<f32> = (0..schedule.total_steps).map(|s| lr.advance(s)).collect();
    let peak = rates[schedule.warmup_steps - 1];
    assert!(rates[..schedule.warmup_steps].windows(2).all(|w| w[0] < w[1]));
    assert!((peak - cfg.lr).abs() < 1e-6);
    assert!((rates[schedule.warmup_steps] - cfg.lr).abs() <= cfg.lr * 0.01);
    assert!(rates[schedule.warmup_steps..].windows(2).all(|w| w[0] >= w[1]));
}
