use std::{fs, path::Path};

use enas_retrain::{
    arch::{ParamStore, StoreBuilder, loss::CrossEntropy},
    config::{RetrainConfig, SearchFor},
    data::{DataLoader, ImageDataset},
    error::Result,
    nas::{ChoiceValue, FixedArchitecture, GeneralNetwork, MICRO_OPS, MacroConfig, Network, NetworkKind},
    optimization::{CosineAnnealing, Optimizer, Sgd, grad_norm},
    training::{CheckpointSink, Retrainer, TrainOptions, read_checkpoint},
};
use rand::{Rng, SeedableRng, rngs::StdRng};

const CLASSES: usize = 3;

/// Remembers the largest gradient norm it was asked to apply.
struct Recording {
    inner: Sgd,
    max_norm: f32,
    steps: usize,
}

impl Optimizer for Recording {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        self.max_norm = self.max_norm.max(grad_norm(grad));
        self.steps += 1;
        self.inner.update_params(grad, params)
    }

    fn learning_rate(&self) -> f32 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.inner.set_learning_rate(learning_rate);
    }
}

#[derive(Default)]
struct MemorySink {
    saves: Vec<(usize, f32, usize)>,
}

impl CheckpointSink for MemorySink {
    fn save(&mut self, store: &ParamStore, epoch: usize, top1: f32) -> Result<()> {
        self.saves.push((epoch, top1, store.len()));
        Ok(())
    }
}

fn dataset(n: usize, seed: u64) -> ImageDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let labels: Vec<usize> = (0..n).map(|i| i % CLASSES).collect();
    let images = labels
        .iter()
        .flat_map(|&label| {
            let base = 60 * label as u8;
            (0..3 * 8 * 8).map(|_| base + rng.random_range(0..40)).collect::<Vec<u8>>()
        })
        .collect();

    ImageDataset::new(images, labels, (3, 8, 8)).unwrap()
}

fn macro_arch(num_layers: usize) -> FixedArchitecture {
    let mut choices = Vec::new();
    for i in 0..num_layers {
        choices.push((format!("layer_{i}"), ChoiceValue::Index(i % 6)));
        if i > 0 {
            choices.push((format!("skip_{i}"), ChoiceValue::Mask((0..i).map(|j| j % 2 == 0).collect())));
        }
    }

    FixedArchitecture::from_choices(choices)
}

fn macro_network(seed: u64) -> (Network, ParamStore) {
    let config = MacroConfig {
        num_layers: 6,
        out_filters: 4,
        num_classes: CLASSES,
        ..MacroConfig::default()
    };

    let mut arch = macro_arch(config.num_layers);
    let mut builder = StoreBuilder::new(StdRng::seed_from_u64(seed));
    let net = GeneralNetwork::new(&mut builder, config, &mut arch).unwrap();
    assert!(arch.finish().is_empty());

    let network = Network::new(NetworkKind::Macro(net), StdRng::seed_from_u64(seed + 1));
    (network, builder.finish())
}

#[test]
fn best_only_grows_and_saves_follow_it() {
    let (network, store) = macro_network(0);
    let optimizer = Recording {
        inner: Sgd::new(store.len(), 0.05, 0.9, 1e-4),
        max_norm: 0.0,
        steps: 0,
    };
    let options = TrainOptions {
        epochs: 4,
        aux_weight: 0.4,
        grad_clip: 0.5,
        log_frequency: 2,
    };
    let mut trainer = Retrainer::new(
        network,
        store,
        optimizer,
        CrossEntropy::new(),
        CosineAnnealing::new(0.05, options.epochs, 0.001),
        options,
    );

    let mut train = DataLoader::new(dataset(12, 1), 4, 0, 2).unwrap().shuffled();
    let mut valid = DataLoader::new(dataset(6, 3), 4, 0, 4).unwrap();
    let mut sink = MemorySink::default();
    let summary = trainer.run(&mut train, &mut valid, &mut sink).unwrap();

    assert_eq!(summary.history.len(), 4);
    let mut previous = 0.0;
    for record in &summary.history {
        assert!(record.best >= previous);
        assert_eq!(record.saved, record.top1 >= previous);
        previous = record.best;
    }
    assert_eq!(summary.best_top1, previous);

    let saved: Vec<_> = summary.history.iter().filter(|r| r.saved).map(|r| r.epoch).collect();
    let sunk: Vec<_> = sink.saves.iter().map(|&(epoch, _, _)| epoch).collect();
    assert_eq!(saved, sunk);
    assert_eq!(saved.first(), Some(&0));
    assert!(sink.saves.iter().all(|&(_, _, len)| len == trainer.store().len()));

    let optimizer = trainer.optimizer();
    assert_eq!(optimizer.steps, 4 * 3);
    assert!(optimizer.max_norm > 0.0);
    assert!(optimizer.max_norm <= 0.5 + 1e-4);
    assert!(trainer.store().params().iter().all(|p| p.is_finite()));
}

#[test]
fn learning_rate_follows_the_cosine_schedule() {
    let (network, store) = macro_network(5);
    let options = TrainOptions {
        epochs: 2,
        aux_weight: 0.0,
        grad_clip: 5.0,
        log_frequency: 10,
    };
    let mut trainer = Retrainer::new(
        network,
        store.clone(),
        Sgd::new(store.len(), 0.05, 0.9, 1e-4),
        CrossEntropy::new(),
        CosineAnnealing::new(0.05, options.epochs, 0.001),
        options,
    );
    assert!((trainer.optimizer().learning_rate() - 0.05).abs() < 1e-6);

    let mut train = DataLoader::new(dataset(4, 6), 4, 0, 7).unwrap();
    let mut valid = DataLoader::new(dataset(3, 8), 4, 0, 9).unwrap();
    trainer.run(&mut train, &mut valid, &mut MemorySink::default()).unwrap();

    // two steps of a two epochs schedule end at the minimum
    assert!((trainer.optimizer().learning_rate() - 0.001).abs() < 1e-6);
    assert_ne!(trainer.store().params(), store.params());
}

fn cifar_record(label: u8, fill: u8) -> Vec<u8> {
    let mut record = vec![label];
    record.extend(std::iter::repeat_n(fill, 3 * 32 * 32));
    record
}

/// Every node input `j` of node `n` reads state `input(n, j)`.
fn micro_arch_json(num_nodes: usize, input: impl Fn(usize, usize) -> usize) -> String {
    let mut choices = serde_json::Map::new();
    for kind in ["normal", "reduce"] {
        for n in 0..num_nodes {
            for (j, branch) in ["x", "y"].into_iter().enumerate() {
                let key = format!("{kind}_node_{n}_{branch}");
                choices.insert(format!("{key}_input"), input(n, j).into());
                choices.insert(format!("{key}_op"), ((n + 2 * j) % MICRO_OPS.len()).into());
            }
        }
    }

    serde_json::Value::Object(choices).to_string()
}

fn write_cifar(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    for i in 1..=5u8 {
        fs::write(dir.join(format!("data_batch_{i}.bin")), cifar_record(i, 40 * i)).unwrap();
    }
    fs::write(dir.join("test_batch.bin"), cifar_record(2, 80)).unwrap();
}

fn micro_config(dir: &Path, arch: String) -> RetrainConfig {
    let data_dir = dir.join("cifar");
    write_cifar(&data_dir);

    let nas_result = dir.join("arch.json");
    fs::write(&nas_result, arch).unwrap();

    RetrainConfig {
        search_for: SearchFor::Micro,
        retrain_epochs: 1,
        batch_size: 2,
        workers: 2,
        aux_weight: 0.4,
        grad_clip: 5.0,
        log_frequency: 1,
        num_layers: 1,
        data_dir,
        seed: 11,
        nas_result,
        result_file: dir.join("best.safetensors"),
    }
}

#[test]
fn run_writes_the_best_micro_weights() {
    let dir = tempfile::tempdir().unwrap();
    let config = micro_config(dir.path(), micro_arch_json(5, |n, j| n + j));

    let summary = enas_retrain::run(&config).unwrap();
    assert_eq!(summary.history.len(), 1);
    assert!(summary.history[0].saved);

    let tensors = read_checkpoint(&config.result_file).unwrap();
    let (shape, values) = &tensors["stem.conv.weight"];
    assert_eq!(shape, &vec![60, 3, 3, 3]);
    assert_eq!(values.len(), 60 * 3 * 3 * 3);
    assert!(values.iter().all(|v| v.is_finite()));
    assert!(tensors.contains_key("stem.bn.running_mean"));
    assert!(tensors.keys().any(|k| k.ends_with("fc.weight")));
}

#[test]
fn run_handles_cells_whose_nodes_all_read_the_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let config = micro_config(dir.path(), micro_arch_json(5, |_, j| j));

    let summary = enas_retrain::run(&config).unwrap();
    assert_eq!(summary.history.len(), 1);

    // the first cell follows a reduction to 120 channels and keeps a slice per state
    let tensors = read_checkpoint(&config.result_file).unwrap();
    let (shape, values) = &tensors["layers.1.final_conv_w"];
    assert_eq!(shape, &vec![120, 7, 120, 1, 1]);
    assert!(values.iter().all(|v| v.is_finite()));
}

#[test]
fn run_reports_a_missing_choice() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_path_buf();
    for i in 1..=5u8 {
        fs::write(data_dir.join(format!("data_batch_{i}.bin")), cifar_record(0, 0)).unwrap();
    }
    fs::write(data_dir.join("test_batch.bin"), cifar_record(0, 0)).unwrap();

    let nas_result = dir.path().join("arch.json");
    fs::write(&nas_result, r#"{"layer_0": 1}"#).unwrap();

    let config = RetrainConfig {
        search_for: SearchFor::Macro,
        retrain_epochs: 1,
        batch_size: 2,
        workers: 0,
        aux_weight: 0.0,
        grad_clip: 5.0,
        log_frequency: 1,
        num_layers: 6,
        data_dir,
        seed: 0,
        nas_result,
        result_file: dir.path().join("best.safetensors"),
    };

    let err = enas_retrain::run(&config).unwrap_err();
    assert!(err.to_string().contains("layer_1"), "{err}");
    assert!(!config.result_file.exists());
}
