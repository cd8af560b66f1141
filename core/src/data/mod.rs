//! Data loading and processing utilities.
//!
//! This module provides primitives for loading, sampling, and batching tokenised samples.
//! Tokenisation itself happens upstream; a [`Dataset`] only hands out ready [`Sample`]s.
//!
//! # Components
//!
//! - **Dataset**: A trait for accessing individual data items.
//! - **Sampler**: A trait for determining the order of data access, and which data-parallel
//!   rank sees which index.
//! - **DataLoader**: An iterator that batches and collates data from a Dataset.
//!
//! # Packed batches
//!
//! Micro-batches are packed: every sample's tokens are concatenated into one row, and the
//! attention structure is carried as cumulative sequence lengths (`cu_seqlens`), the layout
//! the packed variable-length attention kernel expects.
//!
//! ```text
//! samples:    [a a a] [b b] [c c c c]
//! input_ids:  [a a a b b c c c c]
//! cu_seqlens: [0, 3, 5, 9]
//! ```

pub mod loader;
pub mod sampler;

pub use loader::{Collate, DataLoader, DataLoaderIter, PackedCollate};
pub use sampler::{ParallelSampler, Sampler, SequentialSampler};

/// A trait for accessing data items.
///
/// A `Dataset` represents a collection of data items (e.g., tokenised conversations)
/// that can be accessed by index.
///
/// # Type Parameters
///
/// * `T`: The type of the data item returned by `get`.
pub trait Dataset<T>: Send + Sync {
    /// Returns the total number of items in the dataset.
    fn len(&self) -> usize;

    /// Returns `true` if the dataset is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the item at the given index.
    ///
    /// # Panics
    ///
    /// May panic if `index` is out of bounds.
    fn get(&self, index: usize) -> T;
}

// Implement Dataset for Vec<T>
impl<T: Clone + Send + Sync> Dataset<T> for Vec<T> {
    fn len(&self) -> usize {
        self.len()
    }

    fn get(&self, index: usize) -> T {
        self[index].clone()
    }
}

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// One tokenised training example.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sample {
    pub input_ids: Vec<u32>,
    pub labels: Vec<i64>,
    pub num_tokens: usize,
    /// Placeholder tokens standing in for image patches.
    pub num_image_tokens: usize,
    /// Preprocessed pixels, flattened.
    pub pixel_values: Option<Vec<f32>>,
}

impl Sample {
    /// A text-only sample that predicts every token.
    pub fn text(input_ids: Vec<u32>) -> Self {
        let labels = input_ids.iter().map(|&t| i64::from(t)).collect();
        Self {
            num_tokens: input_ids.len(),
            input_ids,
            labels,
            num_image_tokens: 0,
            pixel_values: None,
        }
    }

    /// Cuts the sample to its first `max_length` tokens. Image placeholders lead the
    /// sequence, so at most `max_length` of them survive.
    pub fn truncate(&mut self, max_length: usize) {
        if self.input_ids.len() <= max_length {
            return;
        }
        self.input_ids.truncate(max_length);
        self.labels.truncate(max_length);
        self.num_tokens = self.num_tokens.min(max_length);
        self.num_image_tokens = self.num_image_tokens.min(max_length);
    }
}

/// A packed micro-batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    pub input_ids: Vec<u32>,
    pub labels: Vec<i64>,
    /// `cu_seqlens[i]..cu_seqlens[i + 1]` is sample `i`'s span.
    pub cu_seqlens: Vec<usize>,
    pub num_tokens: Vec<usize>,
    pub num_image_tokens: Vec<usize>,
    /// Pixels of every sample that has them, concatenated.
    pub pixel_values: Option<Vec<f32>>,
}

impl Batch {
    /// Samples in the batch.
    pub fn len(&self) -> usize {
        self.cu_seqlens.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tokens that are not image placeholders.
    pub fn text_tokens(&self) -> usize {
        self.num_tokens.iter().sum::<usize>().saturating_sub(self.image_tokens())
    }

    pub fn image_tokens(&self) -> usize {
        self.num_image_tokens.iter().sum()
    }

    /// Span of sample `i`.
    pub fn sequence(&self, i: usize) -> &[u32] {
        &self.input_ids[self.cu_seqlens[i]..self.cu_seqlens[i + 1]]
    }
}

/// Packs samples into one row, recording sequence boundaries.
pub fn collate(samples: Vec<Sample>) -> Batch {
    let mut batch = Batch {
        cu_seqlens: vec![0],
        ..Batch::default()
    };
    for sample in samples {
        batch.input_ids.extend_from_slice(&sample.input_ids);
        batch.labels.extend_from_slice(&sample.labels);
        batch.cu_seqlens.push(batch.input_ids.len());
        batch.num_tokens.push(sample.num_tokens);
        batch.num_image_tokens.push(sample.num_image_tokens);
        if let Some(pixels) = sample.pixel_values {
            batch
                .pixel_values
                .get_or_insert_with(Vec::new)
                .extend_from_slice(&pixels);
        }
    }
    batch
}
