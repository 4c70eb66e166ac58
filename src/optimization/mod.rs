mod clip;
mod cosine;
mod optimizer;
mod sgd;

pub use clip::{clip_grad_norm, grad_norm};
pub use cosine::CosineAnnealing;
pub use optimizer::Optimizer;
pub use sgd::Sgd;
