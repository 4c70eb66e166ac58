use log::info;
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    arch::{ParamStore, StoreBuilder, loss::CrossEntropy},
    config::{RetrainConfig, SearchFor},
    data::{Augment, DataLoader, ImageDataset, load_cifar10},
    error::Result,
    nas::{FixedArchitecture, GeneralNetwork, MacroConfig, MicroConfig, MicroNetwork, Network, NetworkKind},
    optimization::{CosineAnnealing, Sgd},
    training::{CheckpointSink, RetrainSummary, Retrainer, SafetensorsCheckpoint},
};

const LEARNING_RATE: f32 = 0.05;
const MOMENTUM: f32 = 0.9;
const WEIGHT_DECAY: f32 = 1e-4;
const ETA_MIN: f32 = 0.001;

const MICRO_CHANNELS: usize = 20;
const MICRO_NODES: usize = 5;
const MICRO_DROPOUT: f32 = 0.1;

/// Builds the network of the given family with its choices fixed by `arch`.
///
/// # Arguments
/// * `search_for` - The model family.
/// * `num_layers` - The amount of cell layers, only used by the micro family.
/// * `arch` - The fixed architecture.
/// * `seed` - The seed for initialization and dropout.
///
/// # Returns
/// The network and its freshly initialized values.
pub fn build_network(
    search_for: SearchFor,
    num_layers: usize,
    arch: &mut FixedArchitecture,
    seed: u64,
) -> Result<(Network, ParamStore)> {
    let mut builder = StoreBuilder::new(StdRng::seed_from_u64(seed));
    let kind = match search_for {
        SearchFor::Macro => {
            NetworkKind::Macro(GeneralNetwork::new(&mut builder, MacroConfig::default(), arch)?)
        }
        SearchFor::Micro => {
            let config = MicroConfig {
                num_layers,
                num_nodes: MICRO_NODES,
                out_channels: MICRO_CHANNELS,
                dropout_rate: MICRO_DROPOUT,
                use_aux_heads: true,
                ..MicroConfig::default()
            };
            NetworkKind::Micro(MicroNetwork::new(&mut builder, config, arch)?)
        }
    };

    let network = Network::new(kind, StdRng::seed_from_u64(seed.wrapping_add(1)));
    Ok((network, builder.finish()))
}

/// Retrains `network` on the given splits, saving into `sink` on every new best.
///
/// The training split is shuffled and augmented, the validation one is neither.
pub fn retrain<S: CheckpointSink>(
    config: &RetrainConfig,
    network: Network,
    store: ParamStore,
    (train_set, valid_set): (ImageDataset, ImageDataset),
    sink: &mut S,
) -> Result<RetrainSummary> {
    let mut train_loader = DataLoader::new(
        train_set,
        config.batch_size,
        config.workers,
        config.seed.wrapping_add(2),
    )?
    .shuffled()
    .augmented(Augment::default());
    let mut valid_loader = DataLoader::new(
        valid_set,
        config.batch_size,
        config.workers,
        config.seed.wrapping_add(3),
    )?;

    let optimizer = Sgd::new(store.len(), LEARNING_RATE, MOMENTUM, WEIGHT_DECAY);
    let schedule = CosineAnnealing::new(LEARNING_RATE, config.retrain_epochs, ETA_MIN);
    let mut trainer = Retrainer::new(
        network,
        store,
        optimizer,
        CrossEntropy::new(),
        schedule,
        config.train_options(),
    );

    trainer.run(&mut train_loader, &mut valid_loader, sink)
}

/// Loads CIFAR-10 and the fixed architecture, then retrains and checkpoints the network.
pub fn run(config: &RetrainConfig) -> Result<RetrainSummary> {
    info!(
        "device: cpu, {} compute threads, {} loader workers, seed {}",
        rayon::current_num_threads(),
        config.workers,
        config.seed
    );

    let splits = load_cifar10(&config.data_dir)?;

    let mut arch = FixedArchitecture::load(&config.nas_result)?;
    let (network, store) = build_network(config.search_for, config.num_layers, &mut arch, config.seed)?;
    arch.finish();
    info!(
        "built the {:?} network with {} parameters",
        config.search_for,
        store.len()
    );

    let mut sink = SafetensorsCheckpoint::new(&config.result_file);
    retrain(config, network, store, splits, &mut sink)
}
