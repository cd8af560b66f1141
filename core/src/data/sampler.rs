//! Strategies for sampling indices from a dataset.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// A trait for determining the order of data access.
pub trait Sampler: Send + Sync {
    /// Returns the indices this rank visits, in order.
    ///
    /// # Arguments
    ///
    /// * `len`: The length of the dataset.
    fn sample(&self, len: usize) -> Vec<usize>;

    /// Number of indices `sample(len)` yields.
    fn num_samples(&self, len: usize) -> usize {
        len
    }

    /// Moves to a new epoch. Samplers with a fixed order ignore it.
    fn set_epoch(&mut self, _epoch: usize) {}
}

/// Samples elements sequentially, always in the same order.
pub struct SequentialSampler;

impl Sampler for SequentialSampler {
    fn sample(&self, len: usize) -> Vec<usize> {
        (0..len).collect()
    }
}

/// Partitions indices across data-parallel replicas.
///
/// The index list is padded (by repeating its head) to a multiple of `num_replicas`, so
/// every replica sees the same number of samples and runs the same number of collectives.
/// Replica `r` takes positions `r, r + n, r + 2n, ...`. With shuffling on, the permutation
/// is drawn from `seed + epoch`, so all replicas agree on it without talking.
#[derive(Debug, Clone)]
pub struct ParallelSampler {
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: usize,
}

impl ParallelSampler {
    pub fn new(num_replicas: usize, rank: usize, seed: u64) -> Self {
        Self {
            num_replicas: num_replicas.max(1),
            rank,
            shuffle: true,
            seed,
            epoch: 0,
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl Sampler for ParallelSampler {
    fn sample(&self, len: usize) -> Vec<usize> {
        if len == 0 {
            return Vec::new();
        }
        let mut indices: Vec<usize> = (0..len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            indices.shuffle(&mut rng);
        }

        let total = self.num_samples(len) * self.num_replicas;
        let mut i = 0;
        while indices.len() < total {
            indices.push(indices[i % len]);
            i += 1;
        }

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }

    fn num_samples(&self, len: usize) -> usize {
        len.div_ceil(self.num_replicas)
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }
}
