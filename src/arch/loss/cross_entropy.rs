use ndarray::{Array2, ArrayView2, Axis};

use super::LossFn;

/// Softmax cross entropy loss function, averaged over the batch.
#[derive(Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    /// Returns a new `CrossEntropy`.
    pub fn new() -> Self {
        Self
    }
}

/// Row-wise numerically stable softmax.
fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut probs = logits.to_owned();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }

    probs
}

impl LossFn for CrossEntropy {
    fn loss(&self, logits: ArrayView2<f32>, labels: &[usize]) -> f32 {
        let n = logits.nrows();
        if n == 0 {
            return 0.0;
        }

        let total: f32 = logits
            .axis_iter(Axis(0))
            .zip(labels)
            .map(|(row, &label)| {
                let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                let log_sum = row.fold(0.0, |acc, &v| acc + (v - max).exp()).ln() + max;
                log_sum - row[label]
            })
            .sum();

        total / n as f32
    }

    fn loss_prime(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Array2<f32> {
        let n = logits.nrows().max(1) as f32;
        let mut d = softmax(logits);
        for (mut row, &label) in d.axis_iter_mut(Axis(0)).zip(labels) {
            row[label] -= 1.0;
        }

        d / n
    }
}
