/// Computes the global L2 norm of a gradient.
pub fn grad_norm(grad: &[f32]) -> f32 {
    grad.iter().map(|g| g * g).sum::<f32>().sqrt()
}

/// Rescales `grad` in place so its global L2 norm doesn't exceed `max_norm`.
///
/// # Returns
/// The norm of the gradient before clipping.
pub fn clip_grad_norm(grad: &mut [f32], max_norm: f32) -> f32 {
    let norm = grad_norm(grad);
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        grad.iter_mut().for_each(|g| *g *= coef);
    }

    norm
}
