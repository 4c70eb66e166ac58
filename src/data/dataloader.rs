use log::debug;
use ndarray::{Array3, Array4, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};

use super::{
    ImageDataset,
    transforms::{Augment, Normalize, to_float},
};
use crate::error::{Result, RetrainErr};

/// A batch of normalized images in `(batch, channels, height, width)` layout with their labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Yields the batches of an `ImageDataset` for one epoch at a time.
///
/// Samples are decoded, augmented and normalized on a dedicated pool of `workers` threads, or
/// on the calling thread when `workers` is 0. Every sample draws its augmentation from its own
/// generator, seeded from the loader's, so batches don't depend on the amount of workers.
pub struct DataLoader {
    dataset: ImageDataset,
    batch_size: usize,
    shuffle: bool,
    augment: Option<Augment>,
    normalize: Normalize,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
    pool: Option<ThreadPool>,
}

impl DataLoader {
    /// Creates a new ordered, non augmented `DataLoader`.
    ///
    /// # Arguments
    /// * `dataset` - The dataset to iterate.
    /// * `batch_size` - The amount of samples per batch, the last one may be smaller.
    /// * `workers` - The amount of threads assembling batches.
    /// * `seed` - The seed for shuffling and augmentation.
    pub fn new(dataset: ImageDataset, batch_size: usize, workers: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(RetrainErr::InvalidConfig("batch size must be > 0".into()));
        }

        let pool = match workers {
            0 => None,
            n => Some(
                ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("loader-{i}"))
                    .build()
                    .map_err(|e| RetrainErr::Dataset(format!("cannot start loader workers: {e}")))?,
            ),
        };

        let order = (0..dataset.len()).collect();
        Ok(Self {
            dataset,
            batch_size,
            shuffle: false,
            augment: None,
            normalize: Normalize::default(),
            order,
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
            pool,
        })
    }

    /// Shuffles the samples at the start of every epoch.
    pub fn shuffled(mut self) -> Self {
        self.shuffle = true;
        self.reset();
        self
    }

    pub fn augmented(mut self, augment: Augment) -> Self {
        self.augment = Some(augment);
        self
    }

    pub fn normalized(mut self, normalize: Normalize) -> Self {
        self.normalize = normalize;
        self
    }

    /// The amount of batches per epoch.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn dataset(&self) -> &ImageDataset {
        &self.dataset
    }

    /// Starts a new epoch, reshuffling if needed.
    pub fn reset(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    /// Returns the next batch of the epoch, or None if exhausted.
    pub fn next_batch(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            return None;
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        let seeds: Vec<u64> = indices.iter().map(|_| self.rng.random()).collect();
        self.cursor = end;

        let dataset = &self.dataset;
        let augment = self.augment;
        let normalize = &self.normalize;
        let prepare = |(&idx, &seed): (&usize, &u64)| {
            let mut image = to_float(dataset.image(idx), dataset.dim());
            if let Some(augment) = augment {
                image = augment.apply(image.view(), &mut StdRng::seed_from_u64(seed));
            }
            normalize.apply(&mut image);
            image
        };

        let samples: Vec<Array3<f32>> = match &self.pool {
            Some(pool) => pool.install(|| indices.par_iter().zip(&seeds).map(prepare).collect()),
            None => indices.iter().zip(&seeds).map(prepare).collect(),
        };

        let (c, h, w) = dataset.dim();
        let mut images = Array4::zeros((samples.len(), c, h, w));
        for (mut slot, sample) in images.axis_iter_mut(Axis(0)).zip(&samples) {
            slot.assign(sample);
        }

        let labels = indices.iter().map(|&i| dataset.label(i)).collect();
        debug!("assembled a batch of {}", samples.len());

        Some(Batch { images, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CIFAR_MEAN, CIFAR_STD};

    fn dataset(n: usize) -> ImageDataset {
        let images = (0..n).flat_map(|i| vec![i as u8; 3 * 4 * 4]).collect();
        ImageDataset::new(images, (0..n).map(|i| i % 10).collect(), (3, 4, 4)).unwrap()
    }

    fn collect(loader: &mut DataLoader) -> Vec<Batch> {
        loader.reset();
        std::iter::from_fn(|| loader.next_batch()).collect()
    }

    #[test]
    fn ordered_batches_cover_the_dataset_once() {
        let mut loader = DataLoader::new(dataset(10), 4, 0, 0).unwrap();
        assert_eq!(loader.len(), 3);

        let batches = collect(&mut loader);
        let sizes: Vec<_> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, [4, 4, 2]);
        assert_eq!(batches[2].labels, [8, 9]);
        assert_eq!(batches[0].images.dim(), (4, 3, 4, 4));

        // normalized with the cifar statistics
        let expected = (1.0 / 255.0 - CIFAR_MEAN[0]) / CIFAR_STD[0];
        assert!((batches[0].images[[1, 0, 2, 2]] - expected).abs() < 1e-5);
    }

    #[test]
    fn shuffling_permutes_every_epoch() {
        let mut loader = DataLoader::new(dataset(20), 20, 0, 3).unwrap().shuffled();
        let first = collect(&mut loader).remove(0).labels;
        let second = collect(&mut loader).remove(0).labels;

        let mut sorted = first.clone();
        sorted.sort_unstable();
        let mut expected: Vec<_> = (0..20).map(|i| i % 10).collect();
        expected.sort_unstable();
        assert_eq!(sorted, expected);
        assert_ne!(first, second);
    }

    #[test]
    fn workers_dont_change_the_batches() {
        let make = |workers| {
            DataLoader::new(dataset(9), 4, workers, 11)
                .unwrap()
                .shuffled()
                .augmented(Augment::default())
        };

        let sequential = collect(&mut make(0));
        let parallel = collect(&mut make(3));
        for (a, b) in sequential.iter().zip(&parallel) {
            assert_eq!(a.labels, b.labels);
            assert_eq!(a.images, b.images);
        }
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(DataLoader::new(dataset(2), 0, 0, 0).is_err());
    }
}
