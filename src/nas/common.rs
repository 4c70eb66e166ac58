//! Pieces shared by both model families.

use ndarray::{Array2, Array4};
use rand::Rng;

use crate::{
    arch::{
        Mode, ParamStore, StoreBuilder,
        layers::{
            BatchNorm2d, BnCache, Block, Conv2d, ConvCache, ConvSpec, Dropout, Linear,
            global_avg_pool, global_avg_pool_backward, relu, relu_backward,
        },
    },
    error::Result,
};

/// Adds `d` to the gradient accumulated so far in `slot`.
pub(crate) fn add_grad(slot: &mut Option<Array4<f32>>, d: Array4<f32>) {
    match slot {
        Some(acc) => *acc += &d,
        None => *slot = Some(d),
    }
}

/// A padded 3x3 convolution followed by an affine batch norm.
#[derive(Debug, Clone)]
pub struct Stem {
    conv: Conv2d,
    bn: BatchNorm2d,
}

#[derive(Debug, Clone)]
pub struct StemCache {
    conv: ConvCache,
    bn: BnCache,
}

impl Stem {
    pub fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        in_channels: usize,
        out_channels: usize,
    ) -> Result<Self> {
        builder.scope("stem", |b| {
            let spec = ConvSpec::new(in_channels, out_channels, 3).padding(1);
            Ok(Self {
                conv: Conv2d::new(b, "conv", spec)?,
                bn: BatchNorm2d::new(b, "bn", out_channels, true),
            })
        })
    }
}

impl Block for Stem {
    type Cache = StemCache;

    fn forward(
        &self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array4<f32>, StemCache)> {
        let (y, conv) = self.conv.forward(store, x)?;
        let (y, bn) = self.bn.forward(store, &y, mode)?;
        Ok((y, StemCache { conv, bn }))
    }

    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &StemCache,
        d: &Array4<f32>,
    ) -> Result<Array4<f32>> {
        let d = self.bn.backward(store, &cache.bn, d)?;
        self.conv.backward(store, &cache.conv, &d)
    }
}

/// Global average pooling, dropout and a dense layer, optionally preceded by a ReLU.
#[derive(Debug, Clone)]
pub struct Classifier {
    relu: bool,
    dropout: Dropout,
    dense: Linear,
}

#[derive(Debug, Clone)]
pub struct ClassifierCache {
    activated: Option<Array4<f32>>,
    spatial: (usize, usize),
    features: Array2<f32>,
    mask: Option<Array2<f32>>,
}

impl Classifier {
    /// Creates a new `Classifier`.
    ///
    /// # Arguments
    /// * `builder` - The store builder its values are registered in.
    /// * `channels` - The amount of channels of its input.
    /// * `num_classes` - The amount of logits it outputs.
    /// * `dropout_rate` - The dropout rate applied to the pooled features.
    /// * `relu` - Whether the input goes through a ReLU before pooling.
    pub fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        channels: usize,
        num_classes: usize,
        dropout_rate: f32,
        relu: bool,
    ) -> Self {
        Self {
            relu,
            dropout: Dropout::new(dropout_rate),
            dense: Linear::new(builder, "dense", (channels, num_classes), true),
        }
    }

    pub fn forward<R: Rng>(
        &self,
        store: &ParamStore,
        x: &Array4<f32>,
        mode: Mode,
        rng: &mut R,
    ) -> Result<(Array2<f32>, ClassifierCache)> {
        let (_, _, h, w) = x.dim();
        let activated = self.relu.then(|| relu(x));
        let pooled = global_avg_pool(activated.as_ref().unwrap_or(x));
        let (features, mask) = self.dropout.forward(pooled, mode, rng);
        let logits = self.dense.forward(store, &features)?;

        let cache = ClassifierCache {
            activated,
            spatial: (h, w),
            features,
            mask,
        };

        Ok((logits, cache))
    }

    pub fn backward(
        &self,
        store: &mut ParamStore,
        cache: &ClassifierCache,
        d: &Array2<f32>,
    ) -> Result<Array4<f32>> {
        let d = self.dense.backward(store, &cache.features, d)?;
        let d = self.dropout.backward(d, cache.mask.as_ref());
        let (h, w) = cache.spatial;
        let d = global_avg_pool_backward(&d, h, w);

        Ok(match &cache.activated {
            Some(y) => relu_backward(&d, y),
            None => d,
        })
    }
}
