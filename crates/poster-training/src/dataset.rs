use crate::annotations::AnnotationTable;
use crate::augment::TransformPipeline;
use crate::error::TrainingResult;
use crate::layout::DataLayout;
use crate::prepare::read_subset;
use crate::splitter::Subset;
use poster_abstraction::{BackendError, ImageTensor, Sample, SampleSource};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;

/// Images named by a subset table, decoded and transformed on demand.
#[derive(Debug, Clone)]
pub struct PosterDataset {
    table: AnnotationTable,
    image_dir: PathBuf,
    transforms: TransformPipeline,
}

impl PosterDataset {
    #[must_use]
    pub fn new(table: AnnotationTable, image_dir: PathBuf, transforms: TransformPipeline) -> Self {
        Self { table, image_dir, transforms }
    }

    /// Dataset over the persisted `subset` of `layout`.
    pub fn from_layout(layout: &DataLayout, subset: Subset, transforms: TransformPipeline) -> TrainingResult<Self> {
        Ok(Self::new(read_subset(layout, subset)?, layout.image_dir(), transforms))
    }

    #[must_use]
    pub fn table(&self) -> &AnnotationTable {
        &self.table
    }

    #[must_use]
    pub fn tags(&self) -> &[String] {
        self.table.tags()
    }
}

impl SampleSource for PosterDataset {
    fn len(&self) -> usize {
        self.table.len()
    }

    fn get(&self, index: usize, epoch: usize) -> Result<Sample, BackendError> {
        let record = self
            .table
            .records()
            .get(index)
            .ok_or(BackendError::IndexOutOfRange { index, len: self.table.len() })?;
        let path = self.image_dir.join(format!("{}.jpg", record.image_name));
        let image = self
            .transforms
            .load_and_apply(&path, index, epoch)
            .map_err(|e| BackendError::SampleLoad(format!("{}: {e}", path.display())))?;
        Ok(Sample { image, labels: record.labels.iter().map(|&v| f32::from(v)).collect() })
    }
}

/// A loaded batch, images and targets in the same order.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub images: Vec<ImageTensor>,
    pub labels: Vec<Vec<f32>>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Batches sample indices and loads them from a [`SampleSource`].
#[derive(Debug, Clone)]
pub struct DataLoader {
    batch_size: usize,
    shuffle: Option<u64>,
    n_workers: usize,
}

impl DataLoader {
    /// Ordered batches, last partial batch kept.
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size: batch_size.max(1), shuffle: None, n_workers: 0 }
    }

    /// Reshuffle every epoch from `seed`.
    #[must_use]
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = Some(seed);
        self
    }

    /// Threads used to decode a batch; 0 loads on the calling thread.
    #[must_use]
    pub fn workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers;
        self
    }

    /// Index batches for one pass over `len` samples.
    #[must_use]
    pub fn batches(&self, len: usize, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..len).collect();
        if let Some(seed) = self.shuffle {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order.chunks(self.batch_size).map(<[usize]>::to_vec).collect()
    }

    pub fn load(&self, source: &dyn SampleSource, indices: &[usize], epoch: usize) -> Result<Batch, BackendError> {
        let samples = if self.n_workers <= 1 || indices.len() <= 1 {
            indices.iter().map(|&i| source.get(i, epoch)).collect::<Result<Vec<_>, _>>()?
        } else {
            let chunk = indices.len().div_ceil(self.n_workers);
            std::thread::scope(|scope| {
                let handles: Vec<_> = indices
                    .chunks(chunk)
                    .map(|part| {
                        scope.spawn(move || part.iter().map(|&i| source.get(i, epoch)).collect::<Result<Vec<_>, _>>())
                    })
                    .collect();
                let mut samples = Vec::with_capacity(indices.len());
                for handle in handles {
                    let part = handle
                        .join()
                        .map_err(|_| BackendError::SampleLoad("loader worker panicked".to_string()))??;
                    samples.extend(part);
                }
                Ok::<_, BackendError>(samples)
            })?
        };

        let mut batch = Batch { images: Vec::with_capacity(samples.len()), labels: Vec::with_capacity(samples.len()) };
        for sample in samples {
            batch.images.push(sample.image);
            batch.labels.push(sample.labels);
        }
        Ok(batch)
    }
}
