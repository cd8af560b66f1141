//! DataLoader implementation.

use super::{Batch, Dataset, Sample, Sampler, SequentialSampler, collate};
use std::sync::Arc;

/// Trait for collating a list of items into a batch.
pub trait Collate<T> {
    /// The type of the batched output (e.g., `Batch`).
    type Output;

    /// Collates a vector of items into a single batch.
    fn collate(&self, batch: Vec<T>) -> Self::Output;
}

/// Packs [`Sample`]s into a [`Batch`], truncating each to `max_length` tokens first.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedCollate {
    pub max_length: Option<usize>,
}

impl Collate<Sample> for PackedCollate {
    type Output = Batch;

    fn collate(&self, mut batch: Vec<Sample>) -> Batch {
        if let Some(max_length) = self.max_length {
            for sample in &mut batch {
                sample.truncate(max_length);
            }
        }
        collate(batch)
    }
}

/// Data loader.
///
/// Combines a dataset and a sampler, and provides an iterable over the given dataset.
///
/// # Type Parameters
///
/// * `D`: The dataset type.
/// * `T`: The item type returned by the dataset.
/// * `C`: The collator type.
pub struct DataLoader<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    dataset: Arc<D>,
    batch_size: usize,
    sampler: Box<dyn Sampler>,
    collator: C,
    _marker: std::marker::PhantomData<T>,
}

impl<D> DataLoader<D, Sample, PackedCollate>
where
    D: Dataset<Sample> + 'static,
{
    /// Creates a DataLoader that yields packed micro-batches.
    pub fn packed(dataset: D, micro_batch_size: usize) -> Self {
        Self {
            dataset: Arc::new(dataset),
            batch_size: micro_batch_size.max(1),
            sampler: Box::new(SequentialSampler),
            collator: PackedCollate::default(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Truncates every sample to `max_length` tokens before packing.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.collator.max_length = Some(max_length);
        self
    }
}

impl<D, T, C> DataLoader<D, T, C>
where
    D: Dataset<T> + 'static,
    C: Collate<T> + Clone,
{
    /// Sets the sampler to use.
    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    /// Forwards the epoch to the sampler; takes effect on the next `iter()`.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.sampler.set_epoch(epoch);
    }

    /// Batches per pass over this rank's share of the dataset.
    pub fn len(&self) -> usize {
        self.sampler
            .num_samples(self.dataset.len())
            .div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns an iterator over the dataset.
    pub fn iter(&self) -> DataLoaderIter<D, T, C> {
        let indices = self.sampler.sample(self.dataset.len());
        DataLoaderIter {
            dataset: self.dataset.clone(),
            indices,
            batch_size: self.batch_size,
            current_idx: 0,
            collator: self.collator.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

/// Iterator for DataLoader.
pub struct DataLoaderIter<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    dataset: Arc<D>,
    indices: Vec<usize>,
    batch_size: usize,
    current_idx: usize,
    collator: C,
    _marker: std::marker::PhantomData<T>,
}

impl<D, T, C> DataLoaderIter<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    /// Moves past the next `n` batches without reading them.
    pub fn skip_batches(&mut self, n: usize) {
        self.current_idx = self
            .current_idx
            .saturating_add(n.saturating_mul(self.batch_size))
            .min(self.indices.len());
    }
}

impl<D, T, C> Iterator for DataLoaderIter<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    type Item = C::Output;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx >= self.indices.len() {
            return None;
        }

        let remaining = self.indices.len() - self.current_idx;
        let take = remaining.min(self.batch_size);
        let batch_indices = &self.indices[self.current_idx..self.current_idx + take];
        self.current_idx += take;

        let batch: Vec<T> = batch_indices
            .iter()
            .map(|&idx| self.dataset.get(idx))
            .collect();

        Some(self.collator.collate(batch))
    }
}
