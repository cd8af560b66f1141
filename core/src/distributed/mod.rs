//! # Distributed Training
//!
//! Welcome to the Distributed module! This is where one model stops fitting on one device.
//!
//! ## 🎓 The "Why" of Distributed Computing
//!
//! Imagine you have a book that is too heavy for one person to carry. What do you do?
//! 1.  **Make copies** and give one to each friend, each reading different chapters (**Data Parallelism**).
//! 2.  **Cut the book in half** down the spine and carry the left half while your friend carries the right (**Tensor Parallelism**).
//! 3.  **Form a bucket brigade**, where you read chapter 1, pass it to a friend for chapter 2, and so on (**Pipeline Parallelism**).
//!
//! ## 🗺️ The Device Mesh
//!
//! Every process gets a coordinate on a `pp × dp × tp` grid. Tensor parallelism is the
//! innermost dimension, so TP peers are neighbouring ranks:
//!
//! ```text
//!   world = 8, dp = 4, tp = 2, pp = 1
//!
//!            tp=0   tp=1
//!   dp=0  [  r0  |  r1  ]
//!   dp=1  [  r2  |  r3  ]
//!   dp=2  [  r4  |  r5  ]
//!   dp=3  [  r6  |  r7  ]
//! ```
//!
//! A *group* along a dimension is every rank that agrees on all the other coordinates: the
//! TP group of `r2` is `{r2, r3}`, its DP group is `{r0, r2, r4, r6}`.
//! [`DeviceMesh`](mesh::DeviceMesh) creates those groups once; nothing else does.
//!
//! ## 🧩 Parallelism Strategies
//!
//! ### 1. Data Parallelism (DP)
//! *   **Concept**: Replicate the model on every DP rank. Split the *dataset*.
//! *   **Communication**: Gradients are averaged across the DP group using **All-Reduce**.
//!
//! ### 2. Tensor Parallelism (TP)
//! *   **Concept**: Split the *weights* of individual layers across the TP group.
//! *   **Column-parallel** layers split output features; **row-parallel** layers split input
//!     features and produce partial sums that must be all-reduced.
//!
//! ## 📦 Module Contents
//!
//! *   [`CollectiveBackend`](backend::CollectiveBackend): The interface for communication.
//! *   [`CpuBackend`](cpu_backend::CpuBackend): In-process channels with a pure Rust **Ring All-Reduce**.
//! *   [`mesh`]: Coordinates and per-dimension groups.
//! *   [`tp_plan`]: Which parameter is split along which axis.
//! *   [`linear`]: Column- and row-parallel linear layers.
//! *   [`fsdp`]: The sharded replica: parameters, gradient reduction, clipping.

pub mod backend;
pub mod cpu_backend;
pub mod fsdp;
pub mod linear;
pub mod mesh;
pub mod tp_plan;

pub use backend::CollectiveBackend;
pub use cpu_backend::CpuBackend;
pub use mesh::{DeviceMesh, MeshDim, MeshShape};
