use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread,
};

use anyhow::{Context, Result};
use log::debug;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::prelude::*;
use tch::Tensor;
use thiserror::Error;
use walkdir::WalkDir;

use crate::transforms::Compose;

pub const IMG_EXTENSIONS: [&str; 9] = [
    "jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp",
];

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset directory {0} does not exist")]
    MissingRoot(PathBuf),
    #[error("couldn't find any class folder in {0}")]
    NoClasses(PathBuf),
    #[error("found no valid image file for class '{class}' in {dir}")]
    EmptyClass { class: String, dir: PathBuf },
    #[error("classes {found:?} do not match {expected:?}")]
    ClassMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMG_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Images laid out as `<root>/<class>/**/<image>`; label = index of the class
/// folder in sorted order.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    classes: Vec<String>,
    samples: Vec<(PathBuf, i64)>,
}

impl ImageFolder {
    pub fn open<T: AsRef<Path>>(root: T) -> Result<ImageFolder, DatasetError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(DatasetError::MissingRoot(root));
        }
        let mut classes: Vec<String> = std::fs::read_dir(&root)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        classes.sort();
        if classes.is_empty() {
            return Err(DatasetError::NoClasses(root));
        }

        let mut samples = vec![];
        for (label, class) in classes.iter().enumerate() {
            let class_dir = root.join(class);
            let mut files = vec![];
            for entry in WalkDir::new(&class_dir).follow_links(true) {
                let entry = entry?;
                if entry.file_type().is_file() && has_image_extension(entry.path()) {
                    files.push(entry.into_path());
                }
            }
            if files.is_empty() {
                return Err(DatasetError::EmptyClass {
                    class: class.clone(),
                    dir: class_dir,
                });
            }
            files.sort();
            debug!("class {}: {} ({} images)", label, class, files.len());
            samples.extend(files.into_iter().map(|f| (f, label as i64)));
        }

        Ok(ImageFolder {
            classes,
            samples,
        })
    }

    pub fn ensure_same_classes(&self, other: &ImageFolder) -> Result<(), DatasetError> {
        if self.classes != other.classes {
            return Err(DatasetError::ClassMismatch {
                expected: self.classes.clone(),
                found: other.classes.clone(),
            });
        }
        Ok(())
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn samples(&self) -> &[(PathBuf, i64)] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait ToDevice {
    fn to_device(&self, device: tch::Device) -> Self;
}

impl ToDevice for Batch {
    fn to_device(&self, device: tch::Device) -> Self {
        Self {
            images: self.images.to_device(device),
            labels: self.labels.to_device(device),
        }
    }
}

/// Anything that can hand out one epoch worth of batches.
pub trait BatchSource {
    fn num_samples(&self) -> usize;
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

/// Batches decoded ahead of the consumer.
pub const PREFETCH_BATCHES: usize = 2;

/// Decodes and transforms image folder samples on a worker pool, keeping up to
/// [`PREFETCH_BATCHES`] batches ready ahead of the training loop.
pub struct DataLoader {
    dataset: Arc<ImageFolder>,
    transform: Arc<Compose>,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    pool: Arc<rayon::ThreadPool>,
}

impl DataLoader {
    pub fn new(
        dataset: ImageFolder,
        transform: Compose,
        batch_size: usize,
        shuffle: bool,
        num_workers: usize,
        seed: u64,
    ) -> Result<DataLoader> {
        anyhow::ensure!(batch_size > 0, "batch size must be positive");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|i| format!("loader-{}", i))
            .build()
            .context("failed to start data loader workers")?;
        Ok(DataLoader {
            dataset: Arc::new(dataset),
            transform: Arc::new(transform),
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            pool: Arc::new(pool),
        })
    }
}

fn load_batch(
    pool: &rayon::ThreadPool,
    dataset: &ImageFolder,
    transform: &Compose,
    chunk: &[(usize, u64)],
) -> Result<Batch> {
    let samples = dataset.samples();
    let decoded: Vec<(Tensor, i64)> = pool.install(|| {
        chunk
            .par_iter()
            .map(|&(idx, seed)| {
                let (path, label) = &samples[idx];
                let img = image::open(path)
                    .with_context(|| format!("failed to decode {}", path.display()))?;
                let mut rng = StdRng::seed_from_u64(seed);
                Ok((transform.apply(img, &mut rng), *label))
            })
            .collect::<Result<Vec<_>>>()
    })?;
    let (images, labels): (Vec<Tensor>, Vec<i64>) = decoded.into_iter().unzip();
    Ok(Batch {
        images: Tensor::stack(&images, 0),
        labels: Tensor::of_slice(&labels),
    })
}

impl BatchSource for DataLoader {
    fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    /// Batches arrive in order. A decode error is yielded as an `Err` item and
    /// ends the epoch.
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        // one seed per sample keeps augmentation independent of worker scheduling
        let seeded: Vec<(usize, u64)> = order.into_iter().map(|i| (i, self.rng.gen())).collect();
        let chunks: Vec<Vec<(usize, u64)>> = seeded
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();

        let (tx, rx) = mpsc::sync_channel(PREFETCH_BATCHES);
        let dataset = Arc::clone(&self.dataset);
        let transform = Arc::clone(&self.transform);
        let pool = Arc::clone(&self.pool);
        let spawned = thread::Builder::new()
            .name("loader-prefetch".to_string())
            .spawn(move || {
                for chunk in chunks {
                    let batch = load_batch(&pool, &dataset, &transform, &chunk);
                    let failed = batch.is_err();
                    // a closed receiver means the consumer stopped early
                    if tx.send(batch).is_err() || failed {
                        break;
                    }
                }
            });
        match spawned {
            Ok(_) => Box::new(rx.into_iter()),
            Err(e) => Box::new(std::iter::once(Err(
                anyhow::Error::new(e).context("failed to start the prefetch thread")
            ))),
        }
    }
}

/// Sequential batches over tensors already in memory.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct TensorLoader {
    images: Tensor,
    labels: Tensor,
    batch_size: i64,
}

#[cfg(test)]
impl TensorLoader {
    pub(crate) fn new(images: Tensor, labels: Tensor, batch_size: usize) -> TensorLoader {
        TensorLoader {
            images,
            labels,
            batch_size: batch_size.max(1) as i64,
        }
    }
}

#[cfg(test)]
impl BatchSource for TensorLoader {
    fn num_samples(&self) -> usize {
        self.labels.size()[0] as usize
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let n = self.labels.size()[0];
        let bs = self.batch_size;
        Box::new((0..n).step_by(bs as usize).map(move |start| {
            let len = bs.min(n - start);
            Ok(Batch {
                images: self.images.narrow(0, start, len),
                labels: self.labels.narrow(0, start, len),
            })
        }))
    }
}
