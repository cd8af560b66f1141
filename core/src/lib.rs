//! # meshtune
//!
//! `meshtune` sets up sharded, multi-process fine-tuning of transformer models: it builds a
//! process mesh, loads weights on a single authoritative rank, materialises every other
//! rank's shards lazily, and drives the gradient-accumulation training loop with
//! checkpointing and resume.
//!
//! Processes are simulated as threads over an in-process collective backend, so the whole
//! pipeline runs (and is tested) on one machine.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: Minimal dtype-aware tensor used for weights and gradients.
//! - [`distributed`]: Device mesh, collectives, tensor-parallel planning, the sharded model.
//! - [`model`]: Structural model description and the storage-free skeleton.
//! - [`loader`]: Rank-authoritative weight loading and module correspondence.
//! - [`init`]: Lazy parameter initialization and state synchronisation.
//! - [`policy`]: Wrap and activation-recompute policies.
//! - [`bootstrap`]: The typestate phase pipeline tying the above together.
//! - [`optim`]: AdamW and learning-rate schedules.
//! - [`data`]: Datasets, samplers and packed batching.
//! - [`checkpoint`]: Per-rank checkpoint files.
//! - [`trainer`]: The training loop driver.
//!
//! ## Example
//!
//! ```rust
//! use meshtune::distributed::{CpuBackend, DeviceMesh, MeshDim, MeshShape};
//!
//! let shape = MeshShape::new(8, 2, 1).unwrap();
//! assert_eq!(shape.size(MeshDim::Data), 4);
//! assert_eq!(shape.group_ranks(2, MeshDim::Tensor), vec![2, 3]);
//!
//! let world = CpuBackend::spawn_world(1).pop().unwrap();
//! let mesh = DeviceMesh::new(MeshShape::new(1, 1, 1).unwrap(), world).unwrap();
//! assert!(mesh.is_authoritative());
//! ```

pub mod bootstrap;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod init;
pub mod loader;
pub mod logging;
pub mod model;
pub mod optim;
pub mod policy;
pub mod tensor;
pub mod trainer;

pub use error::{Error, Result};
pub use tensor::{DType, Tensor, TensorError};
