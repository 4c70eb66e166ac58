use log::debug;
use ndarray::{Array2, Array3, Array4, ArrayView3, Axis, concatenate, s, stack};
use rand::Rng;
use rayon::prelude::*;

use super::{
    FixedArchitecture,
    common::{Classifier, ClassifierCache, Stem, StemCache, add_grad},
};
use crate::{
    arch::{
        Init, Logits, Mode, ParamStore, Slot, StoreBuilder,
        layers::{
            BatchNorm2d, BnCache, Block, FactorizedReduce, FactorizedReduceCache, Linear,
            Pool2d, PoolCache, PoolKind, SepConvBN, SepConvBNCache, StdConv, StdConvCache,
            accumulate, global_avg_pool, global_avg_pool_backward, relu, relu_backward,
        },
    },
    error::{Result, RetrainErr},
};

/// The candidate operations of every node input, in choice order.
pub const MICRO_OPS: [&str; 5] = ["sepconv3x3", "sepconv5x5", "avgpool3x3", "maxpool3x3", "identity"];

/// The hyperparameters of a `MicroNetwork`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MicroConfig {
    pub num_layers: usize,
    pub num_nodes: usize,
    pub out_channels: usize,
    pub in_channels: usize,
    pub num_classes: usize,
    pub dropout_rate: f32,
    pub use_aux_heads: bool,
}

impl Default for MicroConfig {
    fn default() -> Self {
        Self {
            num_layers: 2,
            num_nodes: 5,
            out_channels: 24,
            in_channels: 3,
            num_classes: 10,
            dropout_rate: 0.0,
            use_aux_heads: false,
        }
    }
}

#[derive(Debug, Clone)]
enum MicroOp {
    SepConv(SepConvBN),
    Pool(Pool2d),
    Identity,
}

#[derive(Debug, Clone)]
enum MicroOpCache {
    SepConv(SepConvBNCache),
    Pool(PoolCache),
    Identity,
}

impl MicroOp {
    fn new<R: Rng>(builder: &mut StoreBuilder<R>, name: &str, choice: usize, channels: usize) -> Result<Self> {
        Ok(match choice {
            0 => MicroOp::SepConv(SepConvBN::new(builder, name, channels, 3)?),
            1 => MicroOp::SepConv(SepConvBN::new(builder, name, channels, 5)?),
            2 => MicroOp::Pool(Pool2d::avg(3, 1, 1)),
            3 => MicroOp::Pool(Pool2d::max(3, 1, 1)),
            _ => MicroOp::Identity,
        })
    }
}

impl Block for MicroOp {
    type Cache = MicroOpCache;

    fn forward(
        &self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array4<f32>, MicroOpCache)> {
        Ok(match self {
            MicroOp::SepConv(op) => {
                let (y, cache) = op.forward(store, x, mode)?;
                (y, MicroOpCache::SepConv(cache))
            }
            MicroOp::Pool(pool) => {
                let (y, cache) = pool.forward(x)?;
                (y, MicroOpCache::Pool(cache))
            }
            MicroOp::Identity => (x.clone(), MicroOpCache::Identity),
        })
    }

    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &MicroOpCache,
        d: &Array4<f32>,
    ) -> Result<Array4<f32>> {
        match (self, cache) {
            (MicroOp::SepConv(op), MicroOpCache::SepConv(cache)) => op.backward(store, cache, d),
            (MicroOp::Pool(pool), MicroOpCache::Pool(cache)) => pool.backward(cache, d),
            (MicroOp::Identity, MicroOpCache::Identity) => Ok(d.clone()),
            _ => Err(RetrainErr::MissingForward("micro node operation")),
        }
    }
}

/// One input of a node: an earlier state and the operation applied to it.
#[derive(Debug, Clone)]
struct Cell {
    input: usize,
    op: MicroOp,
}

impl Cell {
    fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        key: &str,
        candidates: usize,
        channels: usize,
        arch: &mut FixedArchitecture,
    ) -> Result<Self> {
        let input = arch.choose_one(&format!("{key}_input"), candidates)?;
        let choice = arch.choose_one(&format!("{key}_op"), MICRO_OPS.len())?;
        debug!("{key}: {} over state {input}", MICRO_OPS[choice]);

        Ok(Self {
            input,
            op: MicroOp::new(builder, key, choice, channels)?,
        })
    }
}

/// A `StdConv` when the channels of a layer input don't match the layer's, the identity
/// otherwise.
#[derive(Debug, Clone)]
struct Calibration(Option<StdConv>);

impl Calibration {
    fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
    ) -> Result<Self> {
        let process = match in_channels == out_channels {
            true => None,
            false => Some(StdConv::new(builder, name, in_channels, out_channels)?),
        };

        Ok(Self(process))
    }

    fn forward(
        &self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array4<f32>, Option<StdConvCache>)> {
        match &self.0 {
            Some(conv) => {
                let (y, cache) = conv.forward(store, x, mode)?;
                Ok((y, Some(cache)))
            }
            None => Ok((x.clone(), None)),
        }
    }

    fn backward(
        &self,
        store: &mut ParamStore,
        cache: Option<&StdConvCache>,
        d: Array4<f32>,
    ) -> Result<Array4<f32>> {
        match (&self.0, cache) {
            (Some(conv), Some(cache)) => conv.backward(store, cache, &d),
            _ => Ok(d),
        }
    }
}

/// Combines the states no node consumed with a 1x1 convolution whose weight is sliced out of a
/// `(channels, nodes + 2, channels)` parameter.
#[derive(Debug, Clone)]
struct Combine {
    channels: usize,
    states: usize,
    weight: Slot,
    unused: Vec<usize>,
}

#[derive(Debug, Clone)]
struct CombineCache {
    x: Array4<f32>,
}

impl Combine {
    fn weight_matrix(&self, store: &ParamStore) -> Result<Array2<f32>> {
        let c = self.channels;
        let w = ArrayView3::from_shape((c, self.states, c), store.param(self.weight))?;
        // selecting more than one state leaves a non standard layout
        let selected = w.select(Axis(1), &self.unused);
        Ok(selected.to_shape((c, self.unused.len() * c))?.into_owned())
    }

    fn forward(&self, store: &ParamStore, states: &[Array4<f32>]) -> Result<(Array4<f32>, CombineCache)> {
        let views: Vec<_> = self.unused.iter().map(|&i| states[i].view()).collect();
        let x = relu(&concatenate(Axis(1), &views)?);
        let w = self.weight_matrix(store)?;
        let (n, kc, h, wd) = x.dim();

        let outs = (0..n)
            .into_par_iter()
            .map(|i| -> Result<Array3<f32>> {
                let xi = x.index_axis(Axis(0), i);
                let xi = xi.to_shape((kc, h * wd))?;
                Ok(w.dot(&xi).into_shape_with_order((self.channels, h, wd))?)
            })
            .collect::<Result<Vec<Array3<f32>>>>()?;

        let views: Vec<_> = outs.iter().map(|o| o.view()).collect();
        Ok((stack(Axis(0), &views)?, CombineCache { x }))
    }

    /// # Returns
    /// The gradient of every unused state, in the order of `self.unused`.
    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &CombineCache,
        d: &Array4<f32>,
    ) -> Result<Vec<Array4<f32>>> {
        let c = self.channels;
        let w = self.weight_matrix(store)?;
        let (n, kc, h, wd) = cache.x.dim();

        let per_sample = (0..n)
            .into_par_iter()
            .map(|i| -> Result<(Array3<f32>, Array2<f32>)> {
                let xi = cache.x.index_axis(Axis(0), i);
                let xi = xi.to_shape((kc, h * wd))?;
                let di = d.index_axis(Axis(0), i);
                let di = di.to_shape((c, h * wd))?;
                let dw = di.dot(&xi.t());
                let dx = w.t().dot(&di).into_shape_with_order((kc, h, wd))?;
                Ok((dx, dw))
            })
            .collect::<Result<Vec<(Array3<f32>, Array2<f32>)>>>()?;

        let mut dw = Array2::<f32>::zeros((c, kc));
        for (_, dwi) in &per_sample {
            dw += dwi;
        }

        let grad = store.grad_at(self.weight);
        for o in 0..c {
            for (u, &state) in self.unused.iter().enumerate() {
                let offset = (o * self.states + state) * c;
                let row = dw.slice(s![o, u * c..(u + 1) * c]);
                accumulate(&mut grad[offset..offset + c], &row.to_vec());
            }
        }

        let views: Vec<_> = per_sample.iter().map(|(dx, _)| dx.view()).collect();
        let dx = relu_backward(&stack(Axis(0), &views)?, &cache.x);

        Ok((0..self.unused.len())
            .map(|u| dx.slice(s![.., u * c..(u + 1) * c, .., ..]).to_owned())
            .collect())
    }
}

/// A cell of the micro search space: calibrates its two inputs, evaluates its nodes and
/// combines the unused states.
#[derive(Debug, Clone)]
struct CellLayer {
    preproc0: Calibration,
    preproc1: Calibration,
    nodes: Vec<(Cell, Cell)>,
    combine: Combine,
    bn: BatchNorm2d,
}

#[derive(Debug, Clone)]
struct CellLayerCache {
    preproc0: Option<StdConvCache>,
    preproc1: Option<StdConvCache>,
    nodes: Vec<(MicroOpCache, MicroOpCache)>,
    combine: CombineCache,
    bn: BnCache,
}

impl CellLayer {
    fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        num_nodes: usize,
        (in_channels_pp, in_channels_p): (usize, usize),
        channels: usize,
        reduction: bool,
        arch: &mut FixedArchitecture,
    ) -> Result<Self> {
        let prefix = if reduction { "reduce" } else { "normal" };
        let states = num_nodes + 2;

        let preproc0 = Calibration::new(builder, "preproc0", in_channels_pp, channels)?;
        let preproc1 = Calibration::new(builder, "preproc1", in_channels_p, channels)?;

        let mut used = vec![false; states];
        let mut nodes = Vec::with_capacity(num_nodes);
        for n in 0..num_nodes {
            let key = format!("{prefix}_node_{n}");
            let node = builder.scope(format!("nodes.{n}"), |b| {
                let x = Cell::new(b, &format!("{key}_x"), n + 2, channels, arch)?;
                let y = Cell::new(b, &format!("{key}_y"), n + 2, channels, arch)?;
                Ok::<_, RetrainErr>((x, y))
            })?;

            used[node.0.input] = true;
            used[node.1.input] = true;
            nodes.push(node);
        }

        let unused = (0..states).filter(|&i| !used[i]).collect();
        let weight = builder.param(
            "final_conv_w",
            &[channels, states, channels, 1, 1],
            Init::KaimingNormal {
                fan_in: states * channels,
            },
        );

        Ok(Self {
            preproc0,
            preproc1,
            nodes,
            combine: Combine {
                channels,
                states,
                weight,
                unused,
            },
            bn: BatchNorm2d::new(builder, "bn", channels, false),
        })
    }

    fn forward(
        &self,
        store: &mut ParamStore,
        pprev: &Array4<f32>,
        prev: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array4<f32>, CellLayerCache)> {
        let (s0, preproc0) = self.preproc0.forward(store, pprev, mode)?;
        let (s1, preproc1) = self.preproc1.forward(store, prev, mode)?;

        let mut states = vec![s0, s1];
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (x, y) in &self.nodes {
            let (out_x, cache_x) = x.op.forward(store, &states[x.input], mode)?;
            let (out_y, cache_y) = y.op.forward(store, &states[y.input], mode)?;
            states.push(out_x + out_y);
            nodes.push((cache_x, cache_y));
        }

        let (out, combine) = self.combine.forward(store, &states)?;
        let (out, bn) = self.bn.forward(store, &out, mode)?;

        let cache = CellLayerCache {
            preproc0,
            preproc1,
            nodes,
            combine,
            bn,
        };

        Ok((out, cache))
    }

    /// # Returns
    /// The gradients with respect to `pprev` and `prev`.
    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &CellLayerCache,
        d: &Array4<f32>,
    ) -> Result<(Array4<f32>, Array4<f32>)> {
        let d = self.bn.backward(store, &cache.bn, d)?;

        let mut grads: Vec<Option<Array4<f32>>> = vec![None; self.combine.states];
        let d_unused = self.combine.backward(store, &cache.combine, &d)?;
        for (&state, d) in self.combine.unused.iter().zip(d_unused) {
            add_grad(&mut grads[state], d);
        }

        for (n, ((x, y), (cache_x, cache_y))) in self.nodes.iter().zip(&cache.nodes).enumerate().rev() {
            let Some(d) = grads[n + 2].take() else {
                continue;
            };

            let dx = x.op.backward(store, cache_x, &d)?;
            add_grad(&mut grads[x.input], dx);
            let dy = y.op.backward(store, cache_y, &d)?;
            add_grad(&mut grads[y.input], dy);
        }

        let mut inputs = grads.into_iter().take(2);
        let (Some(Some(d0)), Some(Some(d1))) = (inputs.next(), inputs.next()) else {
            return Err(RetrainErr::MissingForward("micro cell inputs"));
        };

        let d_pprev = self.preproc0.backward(store, cache.preproc0.as_ref(), d0)?;
        let d_prev = self.preproc1.backward(store, cache.preproc1.as_ref(), d1)?;
        Ok((d_pprev, d_prev))
    }
}

/// Reduces both layer inputs to the doubled channel count and half the spatial size.
#[derive(Debug, Clone)]
struct ReductionLayer {
    reduce0: FactorizedReduce,
    reduce1: FactorizedReduce,
}

/// ReLU, a 5x5 stride 3 average pool, two `StdConv`s, global pooling and a bias-free dense
/// layer, giving the auxiliary logits.
#[derive(Debug, Clone)]
struct AuxiliaryHead {
    pool: Pool2d,
    proj0: StdConv,
    proj1: StdConv,
    fc: Linear,
}

#[derive(Debug, Clone)]
struct AuxiliaryHeadCache {
    activated: Array4<f32>,
    pool: PoolCache,
    proj0: StdConvCache,
    proj1: StdConvCache,
    spatial: (usize, usize),
    features: Array2<f32>,
}

impl AuxiliaryHead {
    fn new<R: Rng>(builder: &mut StoreBuilder<R>, in_channels: usize, num_classes: usize) -> Result<Self> {
        let kind = PoolKind::Avg {
            count_include_pad: true,
        };

        Ok(Self {
            pool: Pool2d::new(kind, 5, 3, 2),
            proj0: StdConv::new(builder, "proj.0", in_channels, 128)?,
            proj1: StdConv::new(builder, "proj.1", 128, 768)?,
            fc: Linear::new(builder, "fc", (768, num_classes), false),
        })
    }

    fn forward(
        &self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<(Array2<f32>, AuxiliaryHeadCache)> {
        let activated = relu(x);
        let (y, pool) = self.pool.forward(&activated)?;
        let (y, proj0) = self.proj0.forward(store, &y, mode)?;
        let (y, proj1) = self.proj1.forward(store, &y, mode)?;
        let (_, _, h, w) = y.dim();
        let features = global_avg_pool(&y);
        let logits = self.fc.forward(store, &features)?;

        let cache = AuxiliaryHeadCache {
            activated,
            pool,
            proj0,
            proj1,
            spatial: (h, w),
            features,
        };

        Ok((logits, cache))
    }

    fn backward(
        &self,
        store: &mut ParamStore,
        cache: &AuxiliaryHeadCache,
        d: &Array2<f32>,
    ) -> Result<Array4<f32>> {
        let d = self.fc.backward(store, &cache.features, d)?;
        let (h, w) = cache.spatial;
        let d = global_avg_pool_backward(&d, h, w);
        let d = self.proj1.backward(store, &cache.proj1, &d)?;
        let d = self.proj0.backward(store, &cache.proj0, &d)?;
        let d = self.pool.backward(&cache.pool, &d)?;
        Ok(relu_backward(&d, &cache.activated))
    }
}

#[derive(Debug, Clone)]
enum MicroLayer {
    Cell(CellLayer),
    Reduction(ReductionLayer),
    Aux(AuxiliaryHead),
}

#[derive(Debug, Clone)]
enum MicroLayerCache {
    Cell(CellLayerCache),
    Reduction(FactorizedReduceCache, FactorizedReduceCache),
    Aux(AuxiliaryHeadCache),
}

#[derive(Debug, Clone)]
struct MicroCache {
    stem: StemCache,
    layers: Vec<MicroLayerCache>,
    classifier: ClassifierCache,
}

/// The micro search space network: a stack of cells sharing one fixed cell structure per
/// kind, with two reduction layers and an optional auxiliary head.
#[derive(Debug, Clone)]
pub struct MicroNetwork {
    stem: Stem,
    layers: Vec<MicroLayer>,
    classifier: Classifier,
    cache: Option<MicroCache>,
}

impl MicroNetwork {
    /// Creates a new `MicroNetwork` with its cells fixed by `arch`.
    ///
    /// Every convolution weight is initialized with Kaiming normal.
    ///
    /// # Arguments
    /// * `builder` - The store builder its values are registered in.
    /// * `config` - The network's hyperparameters.
    /// * `arch` - The fixed architecture holding the `{normal|reduce}_node_{n}_{x|y}_{input|op}`
    ///   choices.
    pub fn new<R: Rng>(
        builder: &mut StoreBuilder<R>,
        config: MicroConfig,
        arch: &mut FixedArchitecture,
    ) -> Result<Self> {
        let MicroConfig {
            num_layers,
            num_nodes,
            out_channels,
            in_channels,
            num_classes,
            dropout_rate,
            use_aux_heads,
        } = config;

        let stem = Stem::new(builder, in_channels, out_channels * 3)?;

        let pool_distance = num_layers / 3;
        let pool_layers = [pool_distance, 2 * pool_distance + 1];
        let aux_after = pool_layers[1] + 1;

        let mut layers = Vec::new();
        let (mut c_pp, mut c_p) = (out_channels * 3, out_channels * 3);
        let mut c_cur = out_channels;
        for layer_id in 0..num_layers + 2 {
            let reduction = pool_layers.contains(&layer_id);
            if reduction {
                c_cur = c_p * 2;
                let reduce = builder.scope(format!("layers.{}", layers.len()), |b| {
                    Ok::<_, RetrainErr>(ReductionLayer {
                        reduce0: FactorizedReduce::new(b, "reduce0", c_pp, c_cur, false)?,
                        reduce1: FactorizedReduce::new(b, "reduce1", c_p, c_cur, false)?,
                    })
                })?;
                layers.push(MicroLayer::Reduction(reduce));
                (c_pp, c_p) = (c_cur, c_cur);
            }

            let cell = builder.scope(format!("layers.{}", layers.len()), |b| {
                CellLayer::new(b, num_nodes, (c_pp, c_p), c_cur, reduction, arch)
            })?;
            layers.push(MicroLayer::Cell(cell));

            if use_aux_heads && layer_id == aux_after {
                let aux = builder.scope(format!("layers.{}", layers.len()), |b| {
                    AuxiliaryHead::new(b, c_cur, num_classes)
                })?;
                layers.push(MicroLayer::Aux(aux));
            }

            (c_pp, c_p) = (c_p, c_cur);
        }

        let classifier = Classifier::new(builder, c_cur, num_classes, dropout_rate, true);

        builder.reinit(|e| match e.shape.as_slice() {
            [_, fan_in, kh, kw] => Some(Init::KaimingNormal {
                fan_in: fan_in * kh * kw,
            }),
            _ => None,
        });

        Ok(Self {
            stem,
            layers,
            classifier,
            cache: None,
        })
    }
}

impl MicroNetwork {
    pub fn forward<R: Rng>(
        &mut self,
        store: &mut ParamStore,
        x: &Array4<f32>,
        mode: Mode,
        rng: &mut R,
    ) -> Result<Logits> {
        self.cache = None;

        let (stem_out, stem) = self.stem.forward(store, x, mode)?;
        let mut prev = stem_out.clone();
        let mut cur = stem_out;
        let mut layers = Vec::with_capacity(self.layers.len());
        let mut aux = None;

        for layer in &self.layers {
            match layer {
                MicroLayer::Cell(cell) => {
                    let (out, cache) = cell.forward(store, &prev, &cur, mode)?;
                    prev = std::mem::replace(&mut cur, out);
                    layers.push(MicroLayerCache::Cell(cache));
                }
                MicroLayer::Reduction(reduction) => {
                    let (p, cache0) = reduction.reduce0.forward(store, &prev, mode)?;
                    let (c, cache1) = reduction.reduce1.forward(store, &cur, mode)?;
                    (prev, cur) = (p, c);
                    layers.push(MicroLayerCache::Reduction(cache0, cache1));
                }
                MicroLayer::Aux(head) if mode == Mode::Train => {
                    let (logits, cache) = head.forward(store, &cur, mode)?;
                    aux = Some(logits);
                    layers.push(MicroLayerCache::Aux(cache));
                }
                MicroLayer::Aux(_) => {}
            }
        }

        let (main, classifier) = self.classifier.forward(store, &cur, mode, rng)?;

        if mode == Mode::Train {
            self.cache = Some(MicroCache {
                stem,
                layers,
                classifier,
            });
        }

        Ok(Logits { main, aux })
    }

    pub fn backward(
        &mut self,
        store: &mut ParamStore,
        d_main: &Array2<f32>,
        d_aux: Option<&Array2<f32>>,
    ) -> Result<()> {
        let cache = self
            .cache
            .take()
            .ok_or(RetrainErr::MissingForward("micro network"))?;

        let mut d_cur = Some(self.classifier.backward(store, &cache.classifier, d_main)?);
        let mut d_prev: Option<Array4<f32>> = None;

        for (layer, layer_cache) in self.layers.iter().zip(&cache.layers).rev() {
            match (layer, layer_cache) {
                (MicroLayer::Cell(cell), MicroLayerCache::Cell(cell_cache)) => {
                    // the layer passed its `cur` input through as its `prev` output
                    let mut d_cur_in = d_prev.take();
                    let mut d_prev_in = None;
                    if let Some(d) = d_cur.take() {
                        let (d_pprev, d_p) = cell.backward(store, cell_cache, &d)?;
                        d_prev_in = Some(d_pprev);
                        add_grad(&mut d_cur_in, d_p);
                    }

                    (d_prev, d_cur) = (d_prev_in, d_cur_in);
                }
                (MicroLayer::Reduction(reduction), MicroLayerCache::Reduction(cache0, cache1)) => {
                    d_prev = d_prev
                        .map(|d| reduction.reduce0.backward(store, cache0, &d))
                        .transpose()?;
                    d_cur = d_cur
                        .map(|d| reduction.reduce1.backward(store, cache1, &d))
                        .transpose()?;
                }
                (MicroLayer::Aux(head), MicroLayerCache::Aux(aux_cache)) => {
                    if let Some(d_aux) = d_aux {
                        let d = head.backward(store, aux_cache, d_aux)?;
                        add_grad(&mut d_cur, d);
                    }
                }
                _ => return Err(RetrainErr::MissingForward("micro layer")),
            }
        }

        let mut d_stem = d_prev;
        if let Some(d) = d_cur {
            add_grad(&mut d_stem, d);
        }

        if let Some(d) = d_stem {
            self.stem.backward(store, &cache.stem, &d)?;
        }

        Ok(())
    }
}
