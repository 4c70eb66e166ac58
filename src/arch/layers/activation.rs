use ndarray::{Array, Array2, Dimension, Zip};
use rand::Rng;

use crate::arch::Mode;

/// Applies `max(0, x)` element-wise.
pub fn relu<D: Dimension>(x: &Array<f32, D>) -> Array<f32, D> {
    x.mapv(|v| v.max(0.0))
}

/// The backward pass of `relu`, given the forward pass' output `y`.
pub fn relu_backward<D: Dimension>(d: &Array<f32, D>, y: &Array<f32, D>) -> Array<f32, D> {
    let mut dx = d.clone();
    Zip::from(&mut dx).and(y).for_each(|dx, &y| {
        if y <= 0.0 {
            *dx = 0.0;
        }
    });

    dx
}

/// Inverted dropout over feature vectors.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self { rate }
    }

    /// Zeros each value with probability `rate` and rescales the rest, only in
    /// `Mode::Train`.
    ///
    /// # Returns
    /// The output and the scaled keep mask, if any value was dropped.
    pub fn forward<R: Rng>(
        &self,
        x: Array2<f32>,
        mode: Mode,
        rng: &mut R,
    ) -> (Array2<f32>, Option<Array2<f32>>) {
        if mode == Mode::Eval || self.rate <= 0.0 {
            return (x, None);
        }

        let keep = 1.0 - self.rate;
        let mask = Array2::from_shape_simple_fn(x.raw_dim(), || {
            if rng.random::<f32>() < keep { 1.0 / keep } else { 0.0 }
        });

        (x * &mask, Some(mask))
    }

    pub fn backward(&self, d: Array2<f32>, mask: Option<&Array2<f32>>) -> Array2<f32> {
        match mask {
            Some(mask) => d * mask,
            None => d,
        }
    }
}
