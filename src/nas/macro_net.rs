use log::debug;
use ndarray::{Array2, Array4};
use rand::Rng;

use super::{
    FixedArchitecture,
    common::{Classifier, ClassifierCache, Stem, StemCache, add_grad},
};
use crate::{
    arch::{
        Mode, ParamStore, StoreBuilder,
        layers::{
            BatchNorm2d, BnCache, Block, ConvBranch, ConvBranchCache, FactorizedReduce,
            FactorizedReduceCache, Pool2d, PoolBranch, PoolBranchCache,
        },
    },
    error::{Result, RetrainErr},
};

/// The candidate operations of every macro layer, in choice order.
pub const MACRO_OPS: [&str; 6] = [
    "conv3x3",
    "sepconv3x3",
    "conv5x5",
    "sepconv5x5",
    "avgpool3x3",
    "maxpool3x3",
];

/// The hyperparameters of a `GeneralNetwork`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacroConfig {
    pub num_layers: usize,
    pub out_filters: usize,
    pub in_channels: usize,
    pub num_classes: usize,
    pub dropout_rate: f32,
}

impl Default for MacroConfig {
    fn default() -> Self {
        Self {
            num_layers: 12,
            out_filters: 24,
            in_channels: 3,
            num_classes: 10,
            dropout_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
enum MacroOp {
    Conv(ConvBranch),
    Pool(PoolBranch),
}

#[derive(Debug, Clone)]
enum MacroOpCache {
    Conv(ConvBranchCache),
    Pool(PoolBranchCache),
}

impl MacroOp {
    fn new<R: Rng>(builder: &mut StoreBuilder<R>, choice: usize, filters: usize) -> Result<Self> {
        let channels = (filters, filters);
        Ok(match choice {
            0 => MacroOp::Conv(ConvBranch::new(builder, "op", channels, 3, false)?),
            1 => MacroOp::Conv(ConvBranch::new(builder, "op", channels, 3, true)?),
            2 => MacroOp::Conv(ConvBranch::new(builder, "op", channels, 5, false)?),
            3 => MacroOp::Conv(ConvBranch::new(builder, "op", channels, 5, true)?),
            4 => MacroOp::Pool(PoolBranch::new(builder, "op", channels, Pool2d::avg(3, 1, 1))?),
            _ => MacroOp::Pool(PoolBranch::new(builder, "op", channels, Pool2d::max(3, 1, 1))?),
        })
    }
}

impl Block for MacroOp {
    type Cache = MacroOpCache;

    fn forward(
        &self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array4<f32>, MacroOpCache)> {
        Ok(match self {
            MacroOp::Conv(branch) => {
                let (y, cache) = branch.forward(store, x, mode)?;
                (y, MacroOpCache::Conv(cache))
            }
            MacroOp::Pool(branch) => {
                let (y, cache) = branch.forward(store, x, mode)?;
                (y, MacroOpCache::Pool(cache))
            }
        })
    }

    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &MacroOpCache,
        d: &Array4<f32>,
    ) -> Result<Array4<f32>> {
        match (self, cache) {
            (MacroOp::Conv(branch), MacroOpCache::Conv(cache)) => branch.backward(store, cache, d),
            (MacroOp::Pool(branch), MacroOpCache::Pool(cache)) => branch.backward(store, cache, d),
            _ => Err(RetrainErr::MissingForward("macro layer operation")),
        }
    }
}

/// One layer of the macro search space: its chosen operation over the previous output, plus
/// the chosen skip connections, batch normalized.
#[derive(Debug, Clone)]
struct MacroLayer {
    op: MacroOp,
    /// Indices into the outputs stored so far, the stem's output being the first.
    skips: Vec<usize>,
    bn: BatchNorm2d,
}

#[derive(Debug, Clone)]
struct MacroLayerCache {
    op: MacroOpCache,
    bn: BnCache,
}

impl MacroLayer {
    fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        layer_id: usize,
        filters: usize,
        arch: &mut FixedArchitecture,
    ) -> Result<Self> {
        let choice = arch.choose_one(&format!("layer_{layer_id}"), MACRO_OPS.len())?;
        let skips = match layer_id {
            0 => Vec::new(),
            _ => arch.choose_many(&format!("skip_{layer_id}"), layer_id)?,
        };

        debug!("layer {layer_id}: {} with skips {skips:?}", MACRO_OPS[choice]);

        builder.scope(format!("layers.{layer_id}"), |b| {
            Ok(Self {
                op: MacroOp::new(b, choice, filters)?,
                skips,
                bn: BatchNorm2d::new(b, "bn", filters, false),
            })
        })
    }

    /// Computes the layer's output given every output stored so far, the last one being its
    /// input.
    fn forward(
        &self,
        store: &mut ParamStore,
        outputs: &[Array4<f32>],
        mode: Mode,
    ) -> Result<(Array4<f32>, MacroLayerCache)> {
        let Some((input, earlier)) = outputs.split_last() else {
            return Err(RetrainErr::MissingForward("macro layer input"));
        };

        let (mut out, op) = self.op.forward(store, input, mode)?;
        for &j in &self.skips {
            out += &earlier[j];
        }

        let (y, bn) = self.bn.forward(store, &out, mode)?;
        Ok((y, MacroLayerCache { op, bn }))
    }

    /// # Returns
    /// The gradient with respect to the layer's input and the one every skip connection
    /// receives.
    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &MacroLayerCache,
        d: &Array4<f32>,
    ) -> Result<(Array4<f32>, Array4<f32>)> {
        let d_sum = self.bn.backward(store, &cache.bn, d)?;
        let d_input = self.op.backward(store, &cache.op, &d_sum)?;
        Ok((d_input, d_sum))
    }
}

#[derive(Debug, Clone)]
struct MacroCache {
    stem: StemCache,
    layers: Vec<MacroLayerCache>,
    /// Per reduction, the cache of every stored output it was applied to.
    reductions: Vec<Vec<FactorizedReduceCache>>,
    classifier: ClassifierCache,
}

/// The macro search space network: a chain of layers, each choosing one operation and any
/// set of skip connections to earlier layers.
#[derive(Debug, Clone)]
pub struct GeneralNetwork {
    stem: Stem,
    layers: Vec<MacroLayer>,
    pool_layers_idx: Vec<usize>,
    pool_layers: Vec<FactorizedReduce>,
    classifier: Classifier,
    cache: Option<MacroCache>,
}

impl GeneralNetwork {
    /// Creates a new `GeneralNetwork` with its choices fixed by `arch`.
    ///
    /// # Arguments
    /// * `builder` - The store builder its values are registered in.
    /// * `config` - The network's hyperparameters.
    /// * `arch` - The fixed architecture holding a `layer_{i}` and a `skip_{i}` choice per layer.
    pub fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        config: MacroConfig,
        arch: &mut FixedArchitecture,
    ) -> Result<Self> {
        let MacroConfig {
            num_layers,
            out_filters,
            in_channels,
            num_classes,
            dropout_rate,
        } = config;

        let pool_distance = num_layers / 3;
        let pool_layers_idx = match pool_distance {
            0 => Vec::new(),
            d => vec![d - 1, 2 * d - 1],
        };

        let stem = Stem::new(builder, in_channels, out_filters)?;
        let mut layers = Vec::with_capacity(num_layers);
        let mut pool_layers = Vec::with_capacity(pool_layers_idx.len());
        for layer_id in 0..num_layers {
            if pool_layers_idx.contains(&layer_id) {
                let name = format!("pool_layers.{}", pool_layers.len());
                pool_layers.push(FactorizedReduce::new(builder, &name, out_filters, out_filters, false)?);
            }

            layers.push(MacroLayer::new(builder, layer_id, out_filters, arch)?);
        }

        Ok(Self {
            stem,
            layers,
            pool_layers_idx,
            pool_layers,
            classifier: Classifier::new(builder, out_filters, num_classes, dropout_rate, false),
            cache: None,
        })
    }

    fn pool_position(&self, layer_id: usize) -> Option<usize> {
        self.pool_layers_idx.iter().position(|&i| i == layer_id)
    }

    pub fn forward<R: Rng>(
        &mut self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
        rng: &mut R,
    ) -> Result<Array2<f32>> {
        self.cache = None;

        let (cur, stem) = self.stem.forward(store, x, mode)?;
        let mut outputs = vec![cur];
        let mut layers = Vec::with_capacity(self.layers.len());
        let mut reductions = Vec::with_capacity(self.pool_layers.len());

        for (layer_id, layer) in self.layers.iter().enumerate() {
            let (out, cache) = layer.forward(store, &outputs, mode)?;
            outputs.push(out);
            layers.push(cache);

            if let Some(p) = self.pool_position(layer_id) {
                let reduce = &self.pool_layers[p];
                let mut caches = Vec::with_capacity(outputs.len());
                for out in outputs.iter_mut() {
                    let (reduced, cache) = reduce.forward(store, out, mode)?;
                    *out = reduced;
                    caches.push(cache);
                }

                reductions.push(caches);
            }
        }

        let cur = &outputs[outputs.len() - 1];
        let (logits, classifier) = self.classifier.forward(store, cur, mode, rng)?;

        if mode == Mode::Train {
            self.cache = Some(MacroCache {
                stem,
                layers,
                reductions,
                classifier,
            });
        }

        Ok(logits)
    }

    pub fn backward(&mut self, store: &mut ParamStore, d_logits: &Array2<f32>) -> Result<()> {
        let cache = self
            .cache
            .take()
            .ok_or(RetrainErr::MissingForward("macro network"))?;

        let num_layers = self.layers.len();
        let mut grads: Vec<Option<Array4<f32>>> = vec![None; num_layers + 1];
        grads[num_layers] = Some(self.classifier.backward(store, &cache.classifier, d_logits)?);

        for layer_id in (0..num_layers).rev() {
            if let Some(p) = self.pool_position(layer_id) {
                let reduce = &self.pool_layers[p];
                for (grad, reduce_cache) in grads.iter_mut().zip(&cache.reductions[p]) {
                    if let Some(d) = grad.take() {
                        *grad = Some(reduce.backward(store, reduce_cache, &d)?);
                    }
                }
            }

            let Some(d) = grads[layer_id + 1].take() else {
                continue;
            };

            let layer = &self.layers[layer_id];
            let (d_input, d_skip) = layer.backward(store, &cache.layers[layer_id], &d)?;
            for &j in &layer.skips {
                add_grad(&mut grads[j], d_skip.clone());
            }

            add_grad(&mut grads[layer_id], d_input);
        }

        if let Some(d) = grads[0].take() {
            self.stem.backward(store, &cache.stem, &d)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::nas::ChoiceValue;

    fn arch(num_layers: usize) -> FixedArchitecture {
        let mut choices = Vec::new();
        for i in 0..num_layers {
            choices.push((format!("layer_{i}"), ChoiceValue::Index(i % MACRO_OPS.len())));
            if i > 0 {
                choices.push((format!("skip_{i}"), ChoiceValue::Mask((0..i).map(|j| j % 2 == 0).collect())));
            }
        }

        FixedArchitecture::from_choices(choices)
    }

    fn tiny() -> MacroConfig {
        MacroConfig {
            num_layers: 6,
            out_filters: 4,
            num_classes: 3,
            ..MacroConfig::default()
        }
    }

    #[test]
    fn every_layer_consumes_its_choices() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let mut fixed = arch(6);
        let net = GeneralNetwork::new(&mut builder, tiny(), &mut fixed).unwrap();
        assert!(fixed.finish().is_empty());
        assert_eq!(net.pool_layers_idx, vec![1, 3]);
        assert_eq!(net.layers[3].skips, vec![0, 2]);

        let store = builder.finish();
        let names: Vec<_> = store.param_entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names[0], "stem.conv.weight");
        assert!(names.contains(&"pool_layers.1.conv2.weight"));
        assert!(names.contains(&"layers.5.op.preproc.conv.weight"));
        assert!(names.contains(&"dense.bias"));
    }

    #[test]
    fn missing_skip_choice_is_an_error() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let mut fixed = FixedArchitecture::from_choices([
            ("layer_0", ChoiceValue::Index(0)),
            ("layer_1", ChoiceValue::Index(0)),
        ]);
        let config = MacroConfig {
            num_layers: 2,
            ..tiny()
        };

        assert!(matches!(
            GeneralNetwork::new(&mut builder, config, &mut fixed),
            Err(RetrainErr::MissingChoice { key }) if key == "skip_1"
        ));
    }

    #[test]
    fn forward_reduces_and_backward_fills_every_gradient() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let mut net = GeneralNetwork::new(&mut builder, tiny(), &mut arch(6)).unwrap();
        let mut store = builder.finish();
        let mut rng = StdRng::seed_from_u64(1);

        let mut data_rng = StdRng::seed_from_u64(2);
        let x = Array4::from_shape_simple_fn((2, 3, 8, 8), || data_rng.random_range(-1.0..1.0));
        let logits = net.forward(&mut store, &x, Mode::Train, &mut rng).unwrap();
        assert_eq!(logits.dim(), (2, 3));

        net.backward(&mut store, &Array2::ones((2, 3))).unwrap();
        assert!(store.grad().iter().all(|g| g.is_finite()));
        assert!(store.grad().iter().any(|&g| g != 0.0));

        // the cache is consumed by the backward pass
        assert!(matches!(
            net.backward(&mut store, &Array2::ones((2, 3))),
            Err(RetrainErr::MissingForward(_))
        ));
    }

    #[test]
    fn eval_forward_keeps_no_cache() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        let mut net = GeneralNetwork::new(&mut builder, tiny(), &mut arch(6)).unwrap();
        let mut store = builder.finish();
        let mut rng = StdRng::seed_from_u64(1);

        let logits = net
            .forward(&mut store, &Array4::zeros((1, 3, 8, 8)), Mode::Eval, &mut rng)
            .unwrap();
        assert_eq!(logits.dim(), (1, 3));
        assert!(net.backward(&mut store, &logits).is_err());
    }
}
