use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;

use super::batch_norm::accumulate;
use crate::{
    arch::{Init, ParamStore, Slot, StoreBuilder},
    error::{Result, RetrainErr},
};

/// A fully connected layer, `y = x W^T + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    dim: (usize, usize),
    weight: Slot,
    bias: Option<Slot>,
}

impl Linear {
    /// Creates a new `Linear`.
    ///
    /// # Arguments
    /// * `builder` - The store builder its values are registered in.
    /// * `name` - The scope name of the layer.
    /// * `dim` - The `(input, output)` sizes.
    /// * `bias` - Whether the layer has a bias.
    pub fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        name: &str,
        dim: (usize, usize),
        bias: bool,
    ) -> Self {
        let (fan_in, fan_out) = dim;
        builder.scope(name, |b| Self {
            dim,
            weight: b.param("weight", &[fan_out, fan_in], Init::fan_in(fan_in)),
            bias: bias.then(|| b.param("bias", &[fan_out], Init::fan_in(fan_in))),
        })
    }

    pub fn forward(&self, store: &ParamStore, x: &Array2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.dim.0 {
            return Err(RetrainErr::SizeMismatch {
                what: "linear input features",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let w = self.view_weight(store)?;
        let mut out = x.dot(&w.t());
        if let Some(bias) = self.bias {
            out += &ArrayView2::from_shape((1, self.dim.1), store.param(bias))?;
        }

        Ok(out)
    }

    /// Backpropagates `d` given the input `x` of the matching forward pass.
    ///
    /// # Returns
    /// The gradient with respect to `x`.
    pub fn backward(
        &self,
        store: &mut ParamStore,
        x: &Array2<f32>,
        d: &Array2<f32>,
    ) -> Result<Array2<f32>> {
        let dx = d.dot(&self.view_weight(store)?);

        let dw = d.t().dot(x);
        let grad = store.grad_at(self.weight);
        grad.iter_mut().zip(dw.iter()).for_each(|(g, v)| *g += v);

        if let Some(bias) = self.bias {
            let db = d.sum_axis(Axis(0));
            accumulate(store.grad_at(bias), &db.to_vec());
        }

        Ok(dx)
    }

    fn view_weight<'a>(&self, store: &'a ParamStore) -> Result<ArrayView2<'a, f32>> {
        let (fan_in, fan_out) = self.dim;
        Ok(ArrayView2::from_shape((fan_out, fan_in), store.param(self.weight))?)
    }
}
