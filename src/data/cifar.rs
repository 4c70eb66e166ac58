use std::{fs, path::Path};

use log::info;

use crate::error::{Result, RetrainErr};

pub const CIFAR_CLASSES: usize = 10;

const SIDE: usize = 32;
const CHANNELS: usize = 3;
const IMAGE_LEN: usize = CHANNELS * SIDE * SIDE;
const RECORD_LEN: usize = 1 + IMAGE_LEN;
const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";

/// Labeled images kept as raw `(channels, height, width)` bytes.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    images: Vec<u8>,
    labels: Vec<usize>,
    dim: (usize, usize, usize),
}

impl ImageDataset {
    /// Creates a new dataset from owned buffers.
    ///
    /// # Arguments
    /// * `images` - Every image's bytes, one after the other, in channel-major order.
    /// * `labels` - One label per image.
    /// * `dim` - The `(channels, height, width)` of every image.
    ///
    /// # Returns
    /// The dataset or an error if the buffers don't agree.
    pub fn new(images: Vec<u8>, labels: Vec<usize>, dim: (usize, usize, usize)) -> Result<Self> {
        let (c, h, w) = dim;
        if images.len() != labels.len() * c * h * w {
            return Err(RetrainErr::SizeMismatch {
                what: "image bytes",
                got: images.len(),
                expected: labels.len() * c * h * w,
            });
        }

        Ok(Self {
            images,
            labels,
            dim,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// The `(channels, height, width)` of every image.
    pub fn dim(&self) -> (usize, usize, usize) {
        self.dim
    }

    pub fn image(&self, idx: usize) -> &[u8] {
        let (c, h, w) = self.dim;
        let len = c * h * w;
        &self.images[idx * len..(idx + 1) * len]
    }

    pub fn label(&self, idx: usize) -> usize {
        self.labels[idx]
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }
}

/// Parses CIFAR-10 binary records, each a label byte followed by a 32x32 RGB image.
fn parse_records(bytes: &[u8], path: &Path, images: &mut Vec<u8>, labels: &mut Vec<usize>) -> Result<()> {
    if bytes.len() % RECORD_LEN != 0 {
        return Err(RetrainErr::Dataset(format!(
            "{} is {} bytes long, not a multiple of the {RECORD_LEN} bytes record",
            path.display(),
            bytes.len()
        )));
    }

    for record in bytes.chunks_exact(RECORD_LEN) {
        let label = record[0] as usize;
        if label >= CIFAR_CLASSES {
            return Err(RetrainErr::Dataset(format!(
                "{} has a record labeled {label}",
                path.display()
            )));
        }

        labels.push(label);
        images.extend_from_slice(&record[1..]);
    }

    Ok(())
}

fn load_files(dir: &Path, files: &[&str]) -> Result<ImageDataset> {
    let mut images = Vec::new();
    let mut labels = Vec::new();
    for file in files {
        let path = dir.join(file);
        let bytes = fs::read(&path).map_err(|e| RetrainErr::io(&path, e))?;
        parse_records(&bytes, &path, &mut images, &mut labels)?;
    }

    ImageDataset::new(images, labels, (CHANNELS, SIDE, SIDE))
}

/// Loads the CIFAR-10 binary version from `dir`.
///
/// # Returns
/// The training and the validation splits.
pub fn load_cifar10(dir: impl AsRef<Path>) -> Result<(ImageDataset, ImageDataset)> {
    let dir = dir.as_ref();
    let train = load_files(dir, &TRAIN_FILES)?;
    let valid = load_files(dir, &[TEST_FILE])?;
    info!(
        "loaded cifar10 from {}: {} train and {} valid images",
        dir.display(),
        train.len(),
        valid.len()
    );

    Ok((train, valid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(label: u8, fill: u8) -> Vec<u8> {
        let mut record = vec![label];
        record.extend(std::iter::repeat_n(fill, IMAGE_LEN));
        record
    }

    #[test]
    fn loads_both_splits() {
        let dir = tempfile::tempdir().unwrap();
        for (i, file) in TRAIN_FILES.iter().enumerate() {
            let mut bytes = record(i as u8, i as u8);
            bytes.extend(record(9, 200));
            fs::write(dir.path().join(file), bytes).unwrap();
        }
        fs::write(dir.path().join(TEST_FILE), record(3, 7)).unwrap();

        let (train, valid) = load_cifar10(dir.path()).unwrap();
        assert_eq!(train.len(), 10);
        assert_eq!(valid.len(), 1);
        assert_eq!(train.labels()[..4], [0, 9, 1, 9]);
        assert!(train.image(2).iter().all(|&b| b == 1));
        assert_eq!(valid.label(0), 3);
        assert_eq!(valid.dim(), (3, 32, 32));
    }

    #[test]
    fn rejects_truncated_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TEST_FILE);
        fs::write(&path, vec![0; RECORD_LEN + 5]).unwrap();

        let mut images = Vec::new();
        let mut labels = Vec::new();
        let bytes = fs::read(&path).unwrap();
        assert!(matches!(
            parse_records(&bytes, &path, &mut images, &mut labels),
            Err(RetrainErr::Dataset(_))
        ));
    }

    #[test]
    fn rejects_unknown_labels() {
        let mut images = Vec::new();
        let mut labels = Vec::new();
        let err = parse_records(&record(10, 0), Path::new("x.bin"), &mut images, &mut labels);
        assert!(err.is_err());
    }

    #[test]
    fn missing_directory_reports_the_file() {
        let err = load_cifar10("/no/such/cifar").unwrap_err();
        assert!(err.to_string().contains("data_batch_1.bin"));
    }

    #[test]
    fn new_checks_buffer_sizes() {
        assert!(ImageDataset::new(vec![0; 11], vec![0, 1], (1, 2, 3)).is_err());
        assert_eq!(ImageDataset::new(vec![0; 12], vec![0, 1], (1, 2, 3)).unwrap().len(), 2);
    }
}
