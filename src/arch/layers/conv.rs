use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, Axis, s, stack};
use rand::Rng;
use rayon::prelude::*;

use crate::{
    arch::{Init, ParamStore, Slot, StoreBuilder},
    error::{Result, RetrainErr},
};

/// The hyperparameters of a `Conv2d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
}

impl ConvSpec {
    /// A stride 1, unpadded and ungrouped convolution.
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride: 1,
            padding: 0,
            groups: 1,
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }
}

/// The forward metadata a `Conv2d` needs for its backward pass.
#[derive(Debug, Clone)]
pub struct ConvCache {
    x: Array4<f32>,
}

/// A bias-free 2D convolution over `(batch, channels, height, width)` tensors.
///
/// Implemented by lowering every sample to columns (im2col) and multiplying by the weight
/// matrix, one group at a time. Samples are processed in parallel.
#[derive(Debug, Clone)]
pub struct Conv2d {
    spec: ConvSpec,
    weight: Slot,
}

impl Conv2d {
    /// Creates a new `Conv2d`, registering its weight under `name`.
    ///
    /// # Arguments
    /// * `builder` - The store builder the weight is registered in.
    /// * `name` - The scope name of the layer.
    /// * `spec` - The convolution's hyperparameters.
    ///
    /// # Returns
    /// A new `Conv2d` or an error if the channels can't be split into `spec.groups`.
    pub fn new<R: Rng>(builder: &mut StoreBuilder<R>, name: &str, spec: ConvSpec) -> Result<Self> {
        let ConvSpec {
            in_channels,
            out_channels,
            kernel,
            groups,
            ..
        } = spec;

        if groups == 0 || in_channels % groups != 0 || out_channels % groups != 0 {
            return Err(RetrainErr::SizeMismatch {
                what: "convolution groups",
                got: groups,
                expected: in_channels,
            });
        }

        let fan_in = in_channels / groups * kernel * kernel;
        let shape = [out_channels, in_channels / groups, kernel, kernel];
        let weight = builder.scope(name, |b| b.param("weight", &shape, Init::fan_in(fan_in)));

        Ok(Self { spec, weight })
    }

    pub fn spec(&self) -> ConvSpec {
        self.spec
    }

    pub fn weight(&self) -> Slot {
        self.weight
    }

    /// Computes the spatial size of the output for an input of size `(h, w)`.
    pub fn out_dim(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        let ConvSpec {
            kernel,
            stride,
            padding,
            ..
        } = self.spec;

        let side = |len: usize| {
            let padded = len + 2 * padding;
            if padded < kernel {
                return Err(RetrainErr::SizeMismatch {
                    what: "convolution input side",
                    got: len,
                    expected: kernel,
                });
            }

            Ok((padded - kernel) / stride + 1)
        };

        Ok((side(h)?, side(w)?))
    }

    /// Convolves `x`.
    ///
    /// # Returns
    /// The output and the metadata needed by `backward`.
    pub fn forward(&self, store: &ParamStore, x: &Array4<f32>) -> Result<(Array4<f32>, ConvCache)> {
        let (n, c, h, w) = x.dim();
        self.check_channels(c)?;

        let (ho, wo) = self.out_dim(h, w)?;
        let weight = self.weight_matrix(store)?;
        let out_channels = self.spec.out_channels;

        let outs = (0..n)
            .into_par_iter()
            .map(|i| -> Result<Array3<f32>> {
                let cols = self.im2col(x.index_axis(Axis(0), i), ho, wo);
                let out = self.apply_groups(weight, cols.view());
                Ok(out.into_shape_with_order((out_channels, ho, wo))?)
            })
            .collect::<Result<Vec<Array3<f32>>>>()?;

        let views: Vec<_> = outs.iter().map(|o| o.view()).collect();
        let out = stack(Axis(0), &views)?;

        Ok((out, ConvCache { x: x.clone() }))
    }

    /// Backpropagates `d` through the convolution, accumulating the weight's gradient.
    ///
    /// # Returns
    /// The gradient with respect to the input.
    pub fn backward(
        &self,
        store: &mut ParamStore,
        cache: &ConvCache,
        d: &Array4<f32>,
    ) -> Result<Array4<f32>> {
        let x = &cache.x;
        let (n, c, h, w) = x.dim();
        let (ho, wo) = self.out_dim(h, w)?;
        let out_channels = self.spec.out_channels;

        let per_sample = {
            let weight = self.weight_matrix(store)?;
            (0..n)
                .into_par_iter()
                .map(|i| -> Result<(Array3<f32>, Array2<f32>)> {
                    let cols = self.im2col(x.index_axis(Axis(0), i), ho, wo);
                    let di = d.index_axis(Axis(0), i);
                    let di = di.to_shape((out_channels, ho * wo))?;
                    let (dw, dcols) = self.grad_groups(weight, cols.view(), di.view());
                    Ok((self.col2im(dcols.view(), (c, h, w), ho, wo), dw))
                })
                .collect::<Result<Vec<(Array3<f32>, Array2<f32>)>>>()?
        };

        let grad = store.grad_at(self.weight);
        for (_, dw) in &per_sample {
            grad.iter_mut().zip(dw.iter()).for_each(|(g, v)| *g += v);
        }

        let views: Vec<_> = per_sample.iter().map(|(dx, _)| dx.view()).collect();
        Ok(stack(Axis(0), &views)?)
    }

    fn check_channels(&self, got: usize) -> Result<()> {
        if got != self.spec.in_channels {
            return Err(RetrainErr::SizeMismatch {
                what: "convolution input channels",
                got,
                expected: self.spec.in_channels,
            });
        }

        Ok(())
    }

    fn weight_matrix<'a>(&self, store: &'a ParamStore) -> Result<ArrayView2<'a, f32>> {
        let ConvSpec {
            in_channels,
            out_channels,
            kernel,
            groups,
            ..
        } = self.spec;

        let cols = in_channels / groups * kernel * kernel;
        Ok(ArrayView2::from_shape((out_channels, cols), store.param(self.weight))?)
    }

    fn group_ranges(&self, g: usize) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        let ConvSpec {
            in_channels,
            out_channels,
            kernel,
            groups,
            ..
        } = self.spec;

        let rows = in_channels / groups * kernel * kernel;
        let opg = out_channels / groups;
        (g * opg..(g + 1) * opg, g * rows..(g + 1) * rows)
    }

    fn apply_groups(&self, weight: ArrayView2<f32>, cols: ArrayView2<f32>) -> Array2<f32> {
        if self.spec.groups == 1 {
            return weight.dot(&cols);
        }

        let mut out = Array2::zeros((self.spec.out_channels, cols.ncols()));
        for g in 0..self.spec.groups {
            let (outs, rows) = self.group_ranges(g);
            let wg = weight.slice(s![outs.clone(), ..]);
            let cg = cols.slice(s![rows, ..]);
            out.slice_mut(s![outs, ..]).assign(&wg.dot(&cg));
        }

        out
    }

    /// Returns the weight gradient and the columns gradient of a single sample.
    fn grad_groups(
        &self,
        weight: ArrayView2<f32>,
        cols: ArrayView2<f32>,
        d: ArrayView2<f32>,
    ) -> (Array2<f32>, Array2<f32>) {
        if self.spec.groups == 1 {
            return (d.dot(&cols.t()), weight.t().dot(&d));
        }

        let mut dw = Array2::zeros(weight.raw_dim());
        let mut dcols = Array2::zeros(cols.raw_dim());
        for g in 0..self.spec.groups {
            let (outs, rows) = self.group_ranges(g);
            let dg = d.slice(s![outs.clone(), ..]);
            let cg = cols.slice(s![rows.clone(), ..]);
            let wg = weight.slice(s![outs.clone(), ..]);

            dw.slice_mut(s![outs, ..]).assign(&dg.dot(&cg.t()));
            dcols.slice_mut(s![rows, ..]).assign(&wg.t().dot(&dg));
        }

        (dw, dcols)
    }

    /// Lowers a `(channels, height, width)` sample into a `(channels * k * k, ho * wo)`
    /// matrix whose columns are the receptive fields of each output position.
    fn im2col(&self, x: ArrayView3<f32>, ho: usize, wo: usize) -> Array2<f32> {
        let (c, h, w) = x.dim();
        let ConvSpec {
            kernel: k,
            stride,
            padding,
            ..
        } = self.spec;

        let mut cols = Array2::zeros((c * k * k, ho * wo));
        for ch in 0..c {
            for ki in 0..k {
                for kj in 0..k {
                    let row = (ch * k + ki) * k + kj;
                    for oy in 0..ho {
                        let Some(iy) = shifted(oy * stride + ki, padding, h) else {
                            continue;
                        };

                        for ox in 0..wo {
                            if let Some(ix) = shifted(ox * stride + kj, padding, w) {
                                cols[[row, oy * wo + ox]] = x[[ch, iy, ix]];
                            }
                        }
                    }
                }
            }
        }

        cols
    }

    /// The adjoint of `im2col`: scatters (and sums) columns back onto a sample.
    fn col2im(
        &self,
        cols: ArrayView2<f32>,
        (c, h, w): (usize, usize, usize),
        ho: usize,
        wo: usize,
    ) -> Array3<f32> {
        let ConvSpec {
            kernel: k,
            stride,
            padding,
            ..
        } = self.spec;

        let mut x = Array3::zeros((c, h, w));
        for ch in 0..c {
            for ki in 0..k {
                for kj in 0..k {
                    let row = (ch * k + ki) * k + kj;
                    for oy in 0..ho {
                        let Some(iy) = shifted(oy * stride + ki, padding, h) else {
                            continue;
                        };

                        for ox in 0..wo {
                            if let Some(ix) = shifted(ox * stride + kj, padding, w) {
                                x[[ch, iy, ix]] += cols[[row, oy * wo + ox]];
                            }
                        }
                    }
                }
            }
        }

        x
    }
}

/// Maps a position in padded coordinates back to the unpadded input, if it lands inside.
fn shifted(pos: usize, padding: usize, len: usize) -> Option<usize> {
    pos.checked_sub(padding).filter(|&i| i < len)
}

#[cfg(test)]
mod tests {
    use ndarray::Array;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        let len = shape.0 * shape.1 * shape.2 * shape.3;
        Array::from_iter((0..len).map(|i| ((i * 7 % 13) as f32 - 6.0) / 6.0))
            .into_shape_with_order(shape)
            .unwrap()
    }

    /// Checks the weight and input gradients against central differences of the linear
    /// functional `sum(out * r)`.
    fn gradient_check(spec: ConvSpec, in_shape: (usize, usize, usize, usize)) {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(3));
        let conv = Conv2d::new(&mut builder, "conv", spec).unwrap();
        let mut store = builder.finish();
        let x = ramp(in_shape);

        let (out, cache) = conv.forward(&store, &x).unwrap();
        let r = ramp(out.dim()).mapv(|v| v * 0.5 + 0.1);
        let dx = conv.backward(&mut store, &cache, &r).unwrap();

        let objective = |store: &ParamStore, x: &Array4<f32>| {
            let (out, _) = conv.forward(store, x).unwrap();
            (&out * &r).sum()
        };

        let eps = 1e-2;
        let range = conv.weight().range();
        for i in [range.start, range.start + range.len() / 2, range.end - 1] {
            let mut plus = store.clone();
            let mut minus = store.clone();
            plus.grad_and_params_mut().1[i] += eps;
            minus.grad_and_params_mut().1[i] -= eps;
            let numeric = (objective(&plus, &x) - objective(&minus, &x)) / (2.0 * eps);
            assert!((numeric - store.grad()[i]).abs() < 1e-2, "weight {i}: {numeric} vs {}", store.grad()[i]);
        }

        for idx in [(0, 0, 0, 0), (0, in_shape.1 - 1, 1, 2), (in_shape.0 - 1, 0, in_shape.2 - 1, 0)] {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus[idx] += eps;
            minus[idx] -= eps;
            let numeric = (objective(&store, &plus) - objective(&store, &minus)) / (2.0 * eps);
            assert!((numeric - dx[idx]).abs() < 1e-2, "input {idx:?}: {numeric} vs {}", dx[idx]);
        }
    }

    #[test]
    fn output_shape_with_stride_and_padding() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let conv = Conv2d::new(&mut builder, "c", ConvSpec::new(3, 5, 3).stride(2).padding(1)).unwrap();
        let store = builder.finish();

        let (out, _) = conv.forward(&store, &Array4::zeros((2, 3, 8, 7))).unwrap();
        assert_eq!(out.dim(), (2, 5, 4, 4));
    }

    #[test]
    fn identity_kernel_copies_input() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let conv = Conv2d::new(&mut builder, "c", ConvSpec::new(1, 1, 3).padding(1)).unwrap();
        let mut store = builder.finish();
        let w = store.grad_and_params_mut().1;
        w.fill(0.0);
        w[4] = 1.0;

        let x = ramp((1, 1, 4, 4));
        let (out, _) = conv.forward(&store, &x).unwrap();
        assert_eq!(out, x);
    }

    #[test]
    fn rejects_wrong_channels() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let conv = Conv2d::new(&mut builder, "c", ConvSpec::new(2, 2, 1)).unwrap();
        let store = builder.finish();

        assert!(conv.forward(&store, &Array4::zeros((1, 3, 2, 2))).is_err());
    }

    #[test]
    fn dense_gradients_match_finite_differences() {
        gradient_check(ConvSpec::new(2, 3, 3).padding(1), (2, 2, 5, 5));
    }

    #[test]
    fn strided_gradients_match_finite_differences() {
        gradient_check(ConvSpec::new(3, 2, 1).stride(2), (2, 3, 5, 5));
    }

    #[test]
    fn depthwise_gradients_match_finite_differences() {
        gradient_check(ConvSpec::new(3, 3, 5).padding(2).groups(3), (2, 3, 4, 4));
    }
}
