use ndarray::{Array4, Axis, Zip};
use rand::Rng;

use crate::{
    arch::{Init, Mode, ParamStore, Slot, StoreBuilder},
    error::{Result, RetrainErr},
};

const EPS: f32 = 1e-5;
const MOMENTUM: f32 = 0.1;

/// The forward metadata a `BatchNorm2d` needs for its backward pass.
#[derive(Debug, Clone)]
pub struct BnCache {
    x_hat: Array4<f32>,
    inv_std: Vec<f32>,
    mode: Mode,
}

/// Per channel batch normalization.
///
/// In `Mode::Train` the batch statistics are used and the running statistics are updated,
/// in `Mode::Eval` the running statistics are used.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    channels: usize,
    affine: Option<(Slot, Slot)>,
    running_mean: Slot,
    running_var: Slot,
}

impl BatchNorm2d {
    /// Creates a new `BatchNorm2d`.
    ///
    /// # Arguments
    /// * `builder` - The store builder its values are registered in.
    /// * `name` - The scope name of the layer.
    /// * `channels` - The amount of channels it normalizes.
    /// * `affine` - Whether it has a learnable scale and shift.
    pub fn new<R: Rng>(builder: &mut StoreBuilder<R>, name: &str, channels: usize, affine: bool) -> Self {
        builder.scope(name, |b| {
            let affine = affine.then(|| {
                let weight = b.param("weight", &[channels], Init::Ones);
                let bias = b.param("bias", &[channels], Init::Zeros);
                (weight, bias)
            });

            Self {
                channels,
                affine,
                running_mean: b.buffer("running_mean", &[channels], 0.0),
                running_var: b.buffer("running_var", &[channels], 1.0),
            }
        })
    }

    pub fn forward(
        &self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array4<f32>, BnCache)> {
        let (n, c, h, w) = x.dim();
        if c != self.channels {
            return Err(RetrainErr::SizeMismatch {
                what: "batch norm channels",
                got: c,
                expected: self.channels,
            });
        }

        let m = (n * h * w) as f32;
        let (mean, var) = match mode {
            Mode::Train => {
                let mut mean = Vec::with_capacity(c);
                let mut var = Vec::with_capacity(c);
                for xc in x.axis_iter(Axis(1)) {
                    let mu = xc.sum() / m;
                    mean.push(mu);
                    var.push(xc.fold(0.0, |acc, v| acc + (v - mu).powi(2)) / m);
                }

                self.update_running(store, &mean, &var, m);
                (mean, var)
            }
            Mode::Eval => (
                store.buffer(self.running_mean).to_vec(),
                store.buffer(self.running_var).to_vec(),
            ),
        };

        let inv_std: Vec<f32> = var.iter().map(|v| 1.0 / (v + EPS).sqrt()).collect();

        let mut x_hat = x.clone();
        for (ch, mut xc) in x_hat.axis_iter_mut(Axis(1)).enumerate() {
            let (mu, inv) = (mean[ch], inv_std[ch]);
            xc.mapv_inplace(|v| (v - mu) * inv);
        }

        let mut out = x_hat.clone();
        if let Some((weight, bias)) = self.affine {
            let gamma = store.param(weight);
            let beta = store.param(bias);
            for (ch, mut oc) in out.axis_iter_mut(Axis(1)).enumerate() {
                let (g, b) = (gamma[ch], beta[ch]);
                oc.mapv_inplace(|v| g * v + b);
            }
        }

        Ok((out, BnCache { x_hat, inv_std, mode }))
    }

    pub fn backward(
        &self,
        store: &mut ParamStore,
        cache: &BnCache,
        d: &Array4<f32>,
    ) -> Result<Array4<f32>> {
        let (n, _, h, w) = d.dim();
        let m = (n * h * w) as f32;

        let gamma = match self.affine {
            Some((weight, _)) => store.param(weight).to_vec(),
            None => vec![1.0; self.channels],
        };

        let mut dx = Array4::zeros(d.raw_dim());
        let mut d_gamma = vec![0.0; self.channels];
        let mut d_beta = vec![0.0; self.channels];

        for ch in 0..self.channels {
            let dc = d.index_axis(Axis(1), ch);
            let xh = cache.x_hat.index_axis(Axis(1), ch);
            let sum_d = dc.sum();
            let sum_dxh = Zip::from(&dc).and(&xh).fold(0.0, |acc, &d, &x| acc + d * x);
            d_gamma[ch] = sum_dxh;
            d_beta[ch] = sum_d;

            let scale = gamma[ch] * cache.inv_std[ch];
            let mut dxc = dx.index_axis_mut(Axis(1), ch);
            match cache.mode {
                Mode::Train => Zip::from(&mut dxc).and(&dc).and(&xh).for_each(|dx, &d, &x| {
                    *dx = scale / m * (m * d - sum_d - x * sum_dxh);
                }),
                Mode::Eval => Zip::from(&mut dxc).and(&dc).for_each(|dx, &d| *dx = scale * d),
            }
        }

        if let Some((weight, bias)) = self.affine {
            accumulate(store.grad_at(weight), &d_gamma);
            accumulate(store.grad_at(bias), &d_beta);
        }

        Ok(dx)
    }

    fn update_running(&self, store: &mut ParamStore, mean: &[f32], var: &[f32], m: f32) {
        let unbias = if m > 1.0 { m / (m - 1.0) } else { 1.0 };

        let running_mean = store.buffer_mut(self.running_mean);
        for (r, &mu) in running_mean.iter_mut().zip(mean) {
            *r = (1.0 - MOMENTUM) * *r + MOMENTUM * mu;
        }

        let running_var = store.buffer_mut(self.running_var);
        for (r, &v) in running_var.iter_mut().zip(var) {
            *r = (1.0 - MOMENTUM) * *r + MOMENTUM * v * unbias;
        }
    }
}

pub(crate) fn accumulate(grad: &mut [f32], values: &[f32]) {
    grad.iter_mut().zip(values).for_each(|(g, v)| *g += v);
}

#[cfg(test)]
mod tests {
    use ndarray::Array;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn input() -> Array4<f32> {
        Array::from_iter((0..48).map(|i| ((i * 5 % 11) as f32) * 0.3 + 1.0))
            .into_shape_with_order((2, 3, 2, 4))
            .unwrap()
    }

    #[test]
    fn train_mode_normalizes_each_channel() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let bn = BatchNorm2d::new(&mut builder, "bn", 3, false);
        let mut store = builder.finish();

        let (out, _) = bn.forward(&mut store, &input(), Mode::Train).unwrap();
        for oc in out.axis_iter(Axis(1)) {
            let mean = oc.mean().unwrap();
            let var = oc.mapv(|v| (v - mean).powi(2)).mean().unwrap();
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }

        // running stats moved 10% of the way towards the batch stats.
        assert!(store.buffers()[..3].iter().all(|&m| m > 0.1));
    }

    #[test]
    fn eval_mode_uses_running_stats() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let bn = BatchNorm2d::new(&mut builder, "bn", 3, true);
        let mut store = builder.finish();

        let x = input();
        let (out, _) = bn.forward(&mut store, &x, Mode::Eval).unwrap();
        let expected = x.mapv(|v| v / (1.0 + EPS).sqrt());
        assert!(Zip::from(&out).and(&expected).all(|a, b| (a - b).abs() < 1e-5));
        assert_eq!(store.buffers()[..3], [0.0; 3]);
    }

    #[test]
    fn train_gradient_is_orthogonal_to_shift_and_scale() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let bn = BatchNorm2d::new(&mut builder, "bn", 3, true);
        let mut store = builder.finish();

        let x = input();
        let (_, cache) = bn.forward(&mut store, &x, Mode::Train).unwrap();
        let d = x.mapv(|v| (v * 3.1).sin());
        let dx = bn.backward(&mut store, &cache, &d).unwrap();

        for (ch, dxc) in dx.axis_iter(Axis(1)).enumerate() {
            let xh = cache.x_hat.index_axis(Axis(1), ch);
            assert!(dxc.sum().abs() < 1e-4);
            let dot = Zip::from(&dxc).and(&xh).fold(0.0, |acc, &a, &b| acc + a * b);
            assert!(dot.abs() < 1e-4);
        }

        // d_beta is the per channel sum of d.
        let beta_grad = &store.grad()[3..6];
        for (ch, g) in beta_grad.iter().enumerate() {
            assert!((g - d.index_axis(Axis(1), ch).sum()).abs() < 1e-5);
        }
    }
}
