//! Runs the full pipeline on simulated ranks: one thread per rank over the in-process
//! collective backend.
//!
//! ```text
//! cargo run --bin train -- --config demos/configs/tiny.toml --world-size 8
//! ```

use anyhow::{Context, Result, bail};
use clap::Parser;
use meshtune::bootstrap::{self, BootstrapOptions};
use meshtune::config::{DeviceCaps, TrainConfig};
use meshtune::data::{DataLoader, IGNORE_INDEX, ParallelSampler, Sample};
use meshtune::distributed::{CollectiveBackend, CpuBackend, DeviceMesh, MeshDim, MeshShape};
use meshtune::loader::{RankAuthoritativeLoader, SafetensorsSource, SeededSource, Surgery, WeightSource};
use meshtune::logging::{LogContext, run_timestamp};
use meshtune::model::ModelSpec;
use meshtune::optim::AdamW;
use meshtune::trainer::{EmbeddingL2Objective, TrainSummary, Trainer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Parser, Debug)]
#[command(name = "train", about = "Sharded fine-tuning on simulated ranks")]
struct Args {
    /// TOML file with `[train]` and `[model]` sections.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of simulated ranks.
    #[arg(long, default_value_t = 2)]
    world_size: usize,

    /// Authoritative weights; synthetic weights are used when absent.
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Checkpoint directory to resume from (overrides the config).
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Synthetic samples in the dataset.
    #[arg(long, default_value_t = 256)]
    samples: usize,
}

#[derive(Deserialize, Default)]
struct RecipeFile {
    #[serde(default)]
    train: TrainConfig,
    model: Option<ModelSpec>,
}

/// Random token sequences; multimodal models get an image-placeholder prefix.
fn synthetic_dataset(spec: &ModelSpec, n: usize, seed: u64) -> Vec<Sample> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let len = rng.random_range(8..32);
            let input_ids: Vec<u32> = (0..len)
                .map(|_| rng.random_range(0..spec.vocab_size as u32))
                .collect();
            let mut sample = Sample::text(input_ids);
            if spec.vision.is_some() {
                let image_tokens = 4;
                sample.num_image_tokens = image_tokens;
                sample.labels[..image_tokens].fill(IGNORE_INDEX);
                sample.pixel_values = Some(vec![0.0; 3 * 4 * 4]);
            }
            sample
        })
        .collect()
}

fn run_rank(
    backend: CpuBackend,
    config: TrainConfig,
    spec: ModelSpec,
    source: Arc<dyn WeightSource>,
    samples: Vec<Sample>,
    timestamp: String,
) -> meshtune::Result<TrainSummary> {
    let world_size = backend.world_size();
    let rank = backend.global_rank();
    let log = LogContext::with_file(rank, &config.log_level, &config.work_dir, &timestamp)?;
    let _guard = log.enter();

    let dtype = config.dtype.resolve(&DeviceCaps::default())?;
    let shape = MeshShape::new(world_size, config.tp_size, config.pp_size)?;
    let mesh = Arc::new(DeviceMesh::new(shape, backend)?);

    let mut loader = RankAuthoritativeLoader::new(source);
    if spec.vision.is_some() {
        loader = loader.with_surgery(Surgery::UniformFill {
            prefix: "multi_modal_projector".to_string(),
        });
    }
    let model = bootstrap::run(
        Arc::clone(&mesh),
        spec.clone(),
        BootstrapOptions::from_config(&config, dtype),
        &loader,
    )?;

    let data = DataLoader::packed(samples, config.micro_batch_size)
        .with_max_length(config.max_length)
        .with_sampler(ParallelSampler::new(
            mesh.size(MeshDim::Data),
            mesh.coordinate(MeshDim::Data),
            config.seed,
        ));
    let optimizer = AdamW::new(config.lr).with_weight_decay(config.weight_decay);
    let resume = config.resume.clone();
    let mut trainer = Trainer::new(
        config,
        model,
        Box::new(optimizer),
        Box::new(EmbeddingL2Objective::new(&spec)),
        data,
        log,
    )?;
    if let Some(dir) = resume {
        trainer.resume(&dir)?;
    }
    trainer.run()
}

fn main() -> Result<()> {
    let args = Args::parse();
    let recipe: RecipeFile = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => RecipeFile::default(),
    };
    let mut config = recipe.train;
    if args.resume.is_some() {
        config.resume = args.resume.clone();
    }
    let spec = recipe.model.unwrap_or_else(ModelSpec::tiny);
    config.validate(args.world_size)?;
    if args.samples == 0 {
        bail!("--samples must be positive");
    }

    let source: Arc<dyn WeightSource> = match &args.weights {
        Some(path) => Arc::new(SafetensorsSource::new(path)),
        None => Arc::new(SeededSource::new(config.seed)),
    };
    let samples = synthetic_dataset(&spec, args.samples, config.seed);
    let timestamp = run_timestamp();

    let handles: Vec<_> = CpuBackend::spawn_world(args.world_size)
        .into_iter()
        .enumerate()
        .map(|(rank, backend)| {
            let (config, spec, source, samples, timestamp) = (
                config.clone(),
                spec.clone(),
                Arc::clone(&source),
                samples.clone(),
                timestamp.clone(),
            );
            thread::Builder::new()
                .name(format!("rank{rank}"))
                .spawn(move || run_rank(backend, config, spec, source, samples, timestamp))
        })
        .collect::<std::io::Result<_>>()?;

    let mut failed = false;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(summary)) if rank == 0 => println!(
                "rank 0 finished: {} steps, last step {:?}, last loss {:.4}",
                summary.steps_run, summary.final_step, summary.last_loss
            ),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                eprintln!("rank {rank} failed: {e}");
                failed = true;
            }
            Err(_) => {
                eprintln!("rank {rank} panicked");
                failed = true;
            }
        }
    }
    if failed {
        bail!("training failed on at least one rank");
    }
    Ok(())
}
