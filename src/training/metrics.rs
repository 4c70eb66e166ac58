use ndarray::{ArrayView2, Axis};

/// Computes the fraction of rows whose label is among the `k` highest scores.
///
/// A label is ranked by the amount of scores strictly greater than its own, so ties count in
/// its favor. A non finite label score is always wrong and NaN rivals rank above the label.
///
/// # Arguments
/// * `logits` - A `(batch, classes)` matrix of scores.
/// * `labels` - The true class of every row.
/// * `k` - The amount of top scores a label may be in.
pub fn accuracy(logits: ArrayView2<f32>, labels: &[usize], k: usize) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }

    let correct = logits
        .axis_iter(Axis(0))
        .zip(labels)
        .filter(|(row, label)| {
            let score = row[**label];
            score.is_finite() && row.iter().filter(|&&v| !(v <= score)).count() < k
        })
        .count();

    correct as f32 / labels.len() as f32
}
