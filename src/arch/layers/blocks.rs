//! Composite blocks shared by the searched model families.

use ndarray::{Array4, Axis, concatenate, s};
use rand::Rng;

use super::{
    BatchNorm2d, BnCache, Conv2d, ConvCache, ConvSpec, Pool2d, PoolCache,
    activation::{relu, relu_backward},
};
use crate::{
    arch::{Mode, ParamStore, StoreBuilder},
    error::{Result, RetrainErr},
};

/// A differentiable building block over `(batch, channels, height, width)` tensors.
///
/// `forward` returns whatever `backward` needs as an explicit cache, so the same block can be
/// applied several times within a single pass.
pub trait Block {
    type Cache;

    fn forward(
        &self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array4<f32>, Self::Cache)>;

    /// Backpropagates `d`, accumulating parameter gradients into `store`.
    ///
    /// # Returns
    /// The gradient with respect to the block's input.
    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &Self::Cache,
        d: &Array4<f32>,
    ) -> Result<Array4<f32>>;
}

/// 1x1 convolution, batch norm without affine, ReLU.
#[derive(Debug, Clone)]
pub struct StdConv {
    conv: Conv2d,
    bn: BatchNorm2d,
}

#[derive(Debug, Clone)]
pub struct StdConvCache {
    conv: ConvCache,
    bn: BnCache,
    out: Array4<f32>,
}

impl StdConv {
    pub fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
    ) -> Result<Self> {
        builder.scope(name, |b| {
            Ok(Self {
                conv: Conv2d::new(b, "conv", ConvSpec::new(in_channels, out_channels, 1))?,
                bn: BatchNorm2d::new(b, "bn", out_channels, false),
            })
        })
    }
}

impl Block for StdConv {
    type Cache = StdConvCache;

    fn forward(
        &self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array4<f32>, StdConvCache)> {
        let (y, conv) = self.conv.forward(store, x)?;
        let (y, bn) = self.bn.forward(store, &y, mode)?;
        let out = relu(&y);

        Ok((out.clone(), StdConvCache { conv, bn, out }))
    }

    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &StdConvCache,
        d: &Array4<f32>,
    ) -> Result<Array4<f32>> {
        let d = relu_backward(d, &cache.out);
        let d = self.bn.backward(store, &cache.bn, &d)?;
        self.conv.backward(store, &cache.conv, &d)
    }
}

/// A `k x k` convolution, either plain or split into a depthwise convolution followed by
/// a pointwise one.
#[derive(Debug, Clone)]
pub struct BranchConv {
    depthwise: Option<Conv2d>,
    conv: Conv2d,
}

#[derive(Debug, Clone)]
pub struct BranchConvCache {
    depthwise: Option<ConvCache>,
    conv: ConvCache,
}

impl BranchConv {
    pub fn plain<R: Rng>(
        builder: &mut StoreBuilder<R>,
        name: &str,
        (in_channels, out_channels): (usize, usize),
        kernel: usize,
    ) -> Result<Self> {
        let spec = ConvSpec::new(in_channels, out_channels, kernel).padding(kernel / 2);
        Ok(Self {
            depthwise: None,
            conv: Conv2d::new(builder, name, spec)?,
        })
    }

    pub fn separable<R: Rng>(
        builder: &mut StoreBuilder<R>,
        name: &str,
        (in_channels, out_channels): (usize, usize),
        kernel: usize,
    ) -> Result<Self> {
        let depthwise = ConvSpec::new(in_channels, in_channels, kernel)
            .padding(kernel / 2)
            .groups(in_channels);
        let pointwise = ConvSpec::new(in_channels, out_channels, 1);

        builder.scope(name, |b| {
            Ok(Self {
                depthwise: Some(Conv2d::new(b, "depthwise", depthwise)?),
                conv: Conv2d::new(b, "pointwise", pointwise)?,
            })
        })
    }

    fn forward(&self, store: &ParamStore, x: &Array4<f32>) -> Result<(Array4<f32>, BranchConvCache)> {
        let (y, depthwise) = match &self.depthwise {
            Some(dw) => {
                let (y, cache) = dw.forward(store, x)?;
                (y, Some(cache))
            }
            None => (x.clone(), None),
        };

        let (y, conv) = self.conv.forward(store, &y)?;
        Ok((y, BranchConvCache { depthwise, conv }))
    }

    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &BranchConvCache,
        d: &Array4<f32>,
    ) -> Result<Array4<f32>> {
        let d = self.conv.backward(store, &cache.conv, d)?;
        match (&self.depthwise, &cache.depthwise) {
            (Some(dw), Some(dw_cache)) => dw.backward(store, dw_cache, &d),
            _ => Ok(d),
        }
    }
}

/// `StdConv`, then a (possibly separable) `k x k` convolution, batch norm and ReLU.
#[derive(Debug, Clone)]
pub struct ConvBranch {
    preproc: StdConv,
    conv: BranchConv,
    bn: BatchNorm2d,
}

#[derive(Debug, Clone)]
pub struct ConvBranchCache {
    preproc: StdConvCache,
    conv: BranchConvCache,
    bn: BnCache,
    out: Array4<f32>,
}

impl ConvBranch {
    pub fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        name: &str,
        (in_channels, out_channels): (usize, usize),
        kernel: usize,
        separable: bool,
    ) -> Result<Self> {
        builder.scope(name, |b| {
            let preproc = StdConv::new(b, "preproc", in_channels, out_channels)?;
            let channels = (out_channels, out_channels);
            let conv = if separable {
                BranchConv::separable(b, "conv", channels, kernel)?
            } else {
                BranchConv::plain(b, "conv", channels, kernel)?
            };

            Ok(Self {
                preproc,
                conv,
                bn: BatchNorm2d::new(b, "bn", out_channels, false),
            })
        })
    }
}

impl Block for ConvBranch {
    type Cache = ConvBranchCache;

    fn forward(
        &self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array4<f32>, ConvBranchCache)> {
        let (y, preproc) = self.preproc.forward(store, x, mode)?;
        let (y, conv) = self.conv.forward(store, &y)?;
        let (y, bn) = self.bn.forward(store, &y, mode)?;
        let out = relu(&y);

        let cache = ConvBranchCache {
            preproc,
            conv,
            bn,
            out: out.clone(),
        };

        Ok((out, cache))
    }

    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &ConvBranchCache,
        d: &Array4<f32>,
    ) -> Result<Array4<f32>> {
        let d = relu_backward(d, &cache.out);
        let d = self.bn.backward(store, &cache.bn, &d)?;
        let d = self.conv.backward(store, &cache.conv, &d)?;

        self.preproc.backward(store, &cache.preproc, &d)
    }
}

/// `StdConv`, then pooling and batch norm.
#[derive(Debug, Clone)]
pub struct PoolBranch {
    preproc: StdConv,
    pool: Pool2d,
    bn: BatchNorm2d,
}

#[derive(Debug, Clone)]
pub struct PoolBranchCache {
    preproc: StdConvCache,
    pool: PoolCache,
    bn: BnCache,
}

impl PoolBranch {
    pub fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        name: &str,
        (in_channels, out_channels): (usize, usize),
        pool: Pool2d,
    ) -> Result<Self> {
        builder.scope(name, |b| {
            Ok(Self {
                preproc: StdConv::new(b, "preproc", in_channels, out_channels)?,
                pool,
                bn: BatchNorm2d::new(b, "bn", out_channels, false),
            })
        })
    }
}

impl Block for PoolBranch {
    type Cache = PoolBranchCache;

    fn forward(
        &self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array4<f32>, PoolBranchCache)> {
        let (y, preproc) = self.preproc.forward(store, x, mode)?;
        let (y, pool) = self.pool.forward(&y)?;
        let (y, bn) = self.bn.forward(store, &y, mode)?;

        Ok((y, PoolBranchCache { preproc, pool, bn }))
    }

    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &PoolBranchCache,
        d: &Array4<f32>,
    ) -> Result<Array4<f32>> {
        let d = self.bn.backward(store, &cache.bn, d)?;
        let d = self.pool.backward(&cache.pool, &d)?;
        self.preproc.backward(store, &cache.preproc, &d)
    }
}

/// Halves the spatial size with two strided 1x1 convolutions, one of them shifted by a
/// pixel, whose outputs are concatenated and batch normalized.
#[derive(Debug, Clone)]
pub struct FactorizedReduce {
    conv1: Conv2d,
    conv2: Conv2d,
    bn: BatchNorm2d,
}

#[derive(Debug, Clone)]
pub struct FactorizedReduceCache {
    conv1: ConvCache,
    conv2: ConvCache,
    bn: BnCache,
    split: usize,
}

impl FactorizedReduce {
    pub fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        affine: bool,
    ) -> Result<Self> {
        let half = ConvSpec::new(in_channels, out_channels / 2, 1).stride(2);
        builder.scope(name, |b| {
            Ok(Self {
                conv1: Conv2d::new(b, "conv1", half)?,
                conv2: Conv2d::new(b, "conv2", half)?,
                bn: BatchNorm2d::new(b, "bn", out_channels / 2 * 2, affine),
            })
        })
    }
}

impl Block for FactorizedReduce {
    type Cache = FactorizedReduceCache;

    fn forward(
        &self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array4<f32>, FactorizedReduceCache)> {
        let (_, _, h, w) = x.dim();
        if h < 2 || w < 2 {
            return Err(RetrainErr::SizeMismatch {
                what: "factorized reduce input side",
                got: h.min(w),
                expected: 2,
            });
        }

        let (a, conv1) = self.conv1.forward(store, x)?;
        let shifted = x.slice(s![.., .., 1.., 1..]).to_owned();
        let (b, conv2) = self.conv2.forward(store, &shifted)?;
        let split = a.dim().1;

        let y = concatenate(Axis(1), &[a.view(), b.view()])?;
        let (y, bn) = self.bn.forward(store, &y, mode)?;

        Ok((
            y,
            FactorizedReduceCache {
                conv1,
                conv2,
                bn,
                split,
            },
        ))
    }

    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &FactorizedReduceCache,
        d: &Array4<f32>,
    ) -> Result<Array4<f32>> {
        let d = self.bn.backward(store, &cache.bn, d)?;
        let da = d.slice(s![.., ..cache.split, .., ..]).to_owned();
        let db = d.slice(s![.., cache.split.., .., ..]).to_owned();

        let mut dx = self.conv1.backward(store, &cache.conv1, &da)?;
        let dshifted = self.conv2.backward(store, &cache.conv2, &db)?;
        let mut tail = dx.slice_mut(s![.., .., 1.., 1..]);
        tail += &dshifted;

        Ok(dx)
    }
}

/// ReLU, separable convolution, affine batch norm.
#[derive(Debug, Clone)]
pub struct SepConvBN {
    sep: BranchConv,
    bn: BatchNorm2d,
}

#[derive(Debug, Clone)]
pub struct SepConvBNCache {
    relu: Array4<f32>,
    sep: BranchConvCache,
    bn: BnCache,
}

impl SepConvBN {
    pub fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        name: &str,
        channels: usize,
        kernel: usize,
    ) -> Result<Self> {
        builder.scope(name, |b| {
            Ok(Self {
                sep: BranchConv::separable(b, "conv", (channels, channels), kernel)?,
                bn: BatchNorm2d::new(b, "bn", channels, true),
            })
        })
    }
}

impl Block for SepConvBN {
    type Cache = SepConvBNCache;

    fn forward(
        &self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array4<f32>, SepConvBNCache)> {
        let r = relu(x);
        let (y, sep) = self.sep.forward(store, &r)?;
        let (y, bn) = self.bn.forward(store, &y, mode)?;

        Ok((y, SepConvBNCache { relu: r, sep, bn }))
    }

    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &SepConvBNCache,
        d: &Array4<f32>,
    ) -> Result<Array4<f32>> {
        let d = self.bn.backward(store, &cache.bn, d)?;
        let d = self.sep.backward(store, &cache.sep, &d)?;
        Ok(relu_backward(&d, &cache.relu))
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::arch::layers::PoolKind;

    fn input(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(11);
        Array4::from_shape_simple_fn(shape, || rng.random_range(-1.0..1.0))
    }

    /// Runs a forward and a backward pass and checks the shapes line up.
    fn round_shapes<B: Block>(block: &B, store: &mut ParamStore, x: &Array4<f32>) -> (usize, usize, usize, usize) {
        let (y, cache) = block.forward(store, x, Mode::Train).unwrap();
        let dx = block.backward(store, &cache, &Array4::ones(y.raw_dim())).unwrap();
        assert_eq!(dx.dim(), x.dim());
        y.dim()
    }

    #[test]
    fn branches_keep_spatial_size() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let conv = ConvBranch::new(&mut builder, "conv", (4, 6), 5, false).unwrap();
        let sep = ConvBranch::new(&mut builder, "sep", (4, 6), 3, true).unwrap();
        let pool = PoolBranch::new(&mut builder, "pool", (4, 6), Pool2d::max(3, 1, 1)).unwrap();
        let sep_bn = SepConvBN::new(&mut builder, "sep_bn", 4, 5).unwrap();
        let mut store = builder.finish();

        let x = input((2, 4, 6, 6));
        assert_eq!(round_shapes(&conv, &mut store, &x), (2, 6, 6, 6));
        assert_eq!(round_shapes(&sep, &mut store, &x), (2, 6, 6, 6));
        assert_eq!(round_shapes(&pool, &mut store, &x), (2, 6, 6, 6));
        assert_eq!(round_shapes(&sep_bn, &mut store, &x), (2, 4, 6, 6));
        assert!(store.grad().iter().any(|&g| g != 0.0));
    }

    #[test]
    fn factorized_reduce_halves_space() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let reduce = FactorizedReduce::new(&mut builder, "reduce", 3, 8, true).unwrap();
        let mut store = builder.finish();

        assert_eq!(round_shapes(&reduce, &mut store, &input((2, 3, 8, 8))), (2, 8, 4, 4));
    }

    #[test]
    fn avg_pool_branch_uses_padding_excluded_average() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let kind = PoolKind::Avg {
            count_include_pad: false,
        };
        let pool = PoolBranch::new(&mut builder, "pool", (2, 2), Pool2d::new(kind, 3, 1, 1)).unwrap();
        let mut store = builder.finish();

        assert_eq!(round_shapes(&pool, &mut store, &input((3, 2, 4, 4))), (3, 2, 4, 4));
    }
}
