use ndarray::{Array2, Array4};

use crate::{arch::ParamStore, error::Result};

/// Whether a pass is part of training or of evaluation.
///
/// Batch norm uses batch statistics and updates its running ones only in `Train`, dropout
/// and auxiliary heads are only active in `Train`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// The output of a forward pass.
#[derive(Debug, Clone)]
pub struct Logits {
    pub main: Array2<f32>,
    /// The auxiliary head's logits, for models that have one and only in `Mode::Train`.
    pub aux: Option<Array2<f32>>,
}

pub trait Model {
    /// Computes the logits of a batch of images.
    ///
    /// In `Mode::Train` the model keeps what it needs for the following `backward` call.
    ///
    /// # Arguments
    /// * `store` - The model's values.
    /// * `x` - A `(batch, channels, height, width)` batch of images.
    /// * `mode` - Whether this is a training or an evaluation pass.
    fn forward(&mut self, store: &mut ParamStore, x: &Array4<f32>, mode: Mode) -> Result<Logits>;

    /// Backpropagates the gradient of the loss with respect to the logits of the last
    /// training `forward`, **accumulating** into `store`'s gradient.
    ///
    /// # Arguments
    /// * `store` - The model's values.
    /// * `d_main` - The gradient with respect to the main logits.
    /// * `d_aux` - The gradient with respect to the auxiliary logits, if any.
    fn backward(
        &mut self,
        store: &mut ParamStore,
        d_main: Array2<f32>,
        d_aux: Option<Array2<f32>>,
    ) -> Result<()>;
}
