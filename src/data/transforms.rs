use ndarray::{Array3, ArrayView3, s};
use rand::Rng;

pub const CIFAR_MEAN: [f32; 3] = [0.49139968, 0.48215827, 0.44653124];
pub const CIFAR_STD: [f32; 3] = [0.24703233, 0.24348505, 0.26158768];

/// Per channel normalization, `(x - mean) / std`.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalize {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Self {
        Self { mean, std }
    }

    pub fn cifar10() -> Self {
        Self::new(CIFAR_MEAN.to_vec(), CIFAR_STD.to_vec())
    }

    pub fn apply(&self, image: &mut Array3<f32>) {
        for (ch, mut plane) in image.outer_iter_mut().enumerate() {
            let mean = self.mean.get(ch).copied().unwrap_or(0.0);
            let std = self.std.get(ch).copied().unwrap_or(1.0);
            plane.mapv_inplace(|v| (v - mean) / std);
        }
    }
}

impl Default for Normalize {
    fn default() -> Self {
        Self::cifar10()
    }
}

/// Training augmentation: a random crop out of the zero padded image and a random horizontal
/// flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Augment {
    pub padding: usize,
    pub flip: bool,
}

impl Default for Augment {
    fn default() -> Self {
        Self {
            padding: 4,
            flip: true,
        }
    }
}

impl Augment {
    /// Crops an image of the same size out of `image` padded with zeros, then flips it
    /// horizontally half of the time.
    pub fn apply<R: Rng>(&self, image: ArrayView3<f32>, rng: &mut R) -> Array3<f32> {
        let (c, h, w) = image.dim();
        let p = self.padding;

        let mut padded = Array3::zeros((c, h + 2 * p, w + 2 * p));
        padded.slice_mut(s![.., p..p + h, p..p + w]).assign(&image);

        let top = rng.random_range(0..=2 * p);
        let left = rng.random_range(0..=2 * p);
        let mut out = padded.slice(s![.., top..top + h, left..left + w]).to_owned();

        if self.flip && rng.random_bool(0.5) {
            out.invert_axis(ndarray::Axis(2));
            out = out.as_standard_layout().into_owned();
        }

        out
    }
}

/// Turns raw `(channels, height, width)` bytes into `[0, 1]` floats.
pub fn to_float(bytes: &[u8], (c, h, w): (usize, usize, usize)) -> Array3<f32> {
    Array3::from_shape_fn((c, h, w), |(ch, y, x)| bytes[(ch * h + y) * w + x] as f32 / 255.0)
}

#[cfg(test)]
mod tests {
    use ndarray::Array;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn normalize_centers_the_mean() {
        let mut image = Array3::from_shape_fn((3, 2, 2), |(ch, _, _)| CIFAR_MEAN[ch]);
        Normalize::cifar10().apply(&mut image);
        assert!(image.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn unpadded_unflipped_augment_is_identity() {
        let image = Array::from_iter((0..12).map(|i| i as f32))
            .into_shape_with_order((1, 3, 4))
            .unwrap();
        let augment = Augment {
            padding: 0,
            flip: false,
        };

        assert_eq!(augment.apply(image.view(), &mut StdRng::seed_from_u64(0)), image);
    }

    #[test]
    fn augment_keeps_shape_and_content() {
        let image = Array3::ones((3, 8, 8));
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..20 {
            let out = Augment::default().apply(image.view(), &mut rng);
            assert_eq!(out.dim(), (3, 8, 8));
            // at least the 4x4 center survives any crop
            assert!(out.sum() >= 3.0 * 16.0);
            assert!(out.iter().all(|&v| v == 0.0 || v == 1.0));
        }
    }

    #[test]
    fn to_float_scales_bytes() {
        let image = to_float(&[0, 255, 51, 102], (1, 2, 2));
        assert_eq!(image[[0, 0, 1]], 1.0);
        assert!((image[[0, 1, 0]] - 0.2).abs() < 1e-6);
    }
}
