mod cross_entropy;

use ndarray::{Array2, ArrayView2};

pub use cross_entropy::CrossEntropy;

pub trait LossFn {
    /// Computes the mean loss of a batch of logits against their labels.
    fn loss(&self, logits: ArrayView2<f32>, labels: &[usize]) -> f32;

    /// Computes the gradient of `loss` with respect to the logits.
    fn loss_prime(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Array2<f32>;
}
