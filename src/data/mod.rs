mod cifar;
mod dataloader;
mod transforms;

pub use cifar::{CIFAR_CLASSES, ImageDataset, load_cifar10};
pub use dataloader::{Batch, DataLoader};
pub use transforms::{Augment, CIFAR_MEAN, CIFAR_STD, Normalize};
