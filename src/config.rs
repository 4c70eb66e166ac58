use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::{
    error::{Result, RetrainErr},
    training::TrainOptions,
};

/// The model family a search result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SearchFor {
    Macro,
    Micro,
}

/// Retrains a fixed ENAS architecture on CIFAR-10 and keeps the best weights.
#[derive(Parser, Debug, Clone)]
#[command(name = "retrain", version, about)]
pub struct RetrainArgs {
    /// The model family of the search result.
    #[arg(long, value_enum, default_value_t = SearchFor::Macro)]
    pub search_for: SearchFor,

    #[arg(long, default_value_t = 600)]
    pub retrain_epochs: usize,

    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    /// Threads assembling batches, 0 assembles them on the training thread.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    #[arg(long, default_value_t = 0.4)]
    pub aux_weight: f32,

    #[arg(long, default_value_t = 5.0)]
    pub grad_clip: f32,

    /// Log every this many steps.
    #[arg(long, default_value_t = 10)]
    pub log_frequency: usize,

    /// Cell layers of the micro family.
    #[arg(long, default_value_t = 6)]
    pub num_layers: usize,

    /// Directory holding the CIFAR-10 binary batches.
    #[arg(long, default_value = "data/cifar-10-batches-bin")]
    pub data_dir: PathBuf,

    /// Seed for initialization, shuffling, augmentation and dropout. Random if not given.
    #[arg(long)]
    pub seed: Option<u64>,

    /// The fixed architecture found by the search, as JSON.
    pub nas_result: PathBuf,

    /// Where the best weights are written, as safetensors.
    pub result_file: PathBuf,
}

/// The validated, immutable configuration of a retraining run.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrainConfig {
    pub search_for: SearchFor,
    pub retrain_epochs: usize,
    pub batch_size: usize,
    pub workers: usize,
    pub aux_weight: f32,
    pub grad_clip: f32,
    pub log_frequency: usize,
    pub num_layers: usize,
    pub data_dir: PathBuf,
    pub seed: u64,
    pub nas_result: PathBuf,
    pub result_file: PathBuf,
}

impl TryFrom<RetrainArgs> for RetrainConfig {
    type Error = RetrainErr;

    fn try_from(args: RetrainArgs) -> Result<Self> {
        let invalid = |msg: &str| Err(RetrainErr::InvalidConfig(msg.to_string()));

        if args.retrain_epochs == 0 {
            return invalid("retrain epochs must be > 0");
        }
        if args.batch_size == 0 {
            return invalid("batch size must be > 0");
        }
        if args.log_frequency == 0 {
            return invalid("log frequency must be > 0");
        }
        if !(args.aux_weight >= 0.0) {
            return invalid("aux weight must be >= 0");
        }
        if !(args.grad_clip >= 0.0) {
            return invalid("grad clip must be >= 0");
        }
        if args.search_for == SearchFor::Micro && args.num_layers == 0 {
            return invalid("the micro family needs at least one layer");
        }

        Ok(Self {
            search_for: args.search_for,
            retrain_epochs: args.retrain_epochs,
            batch_size: args.batch_size,
            workers: args.workers,
            aux_weight: args.aux_weight,
            grad_clip: args.grad_clip,
            log_frequency: args.log_frequency,
            num_layers: args.num_layers,
            data_dir: args.data_dir,
            seed: args.seed.unwrap_or_else(rand::random),
            nas_result: args.nas_result,
            result_file: args.result_file,
        })
    }
}

impl RetrainConfig {
    pub fn train_options(&self) -> TrainOptions {
        TrainOptions {
            epochs: self.retrain_epochs,
            aux_weight: self.aux_weight,
            grad_clip: self.grad_clip,
            log_frequency: self.log_frequency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RetrainArgs {
        RetrainArgs::try_parse_from(std::iter::once("retrain").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let config = RetrainConfig::try_from(parse(&["arch.json", "best.safetensors"])).unwrap();
        assert_eq!(config.search_for, SearchFor::Macro);
        assert_eq!(config.retrain_epochs, 600);
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.workers, 4);
        assert_eq!(config.aux_weight, 0.4);
        assert_eq!(config.grad_clip, 5.0);
        assert_eq!(config.log_frequency, 10);
        assert_eq!(config.num_layers, 6);
        assert_eq!(config.data_dir, PathBuf::from("data/cifar-10-batches-bin"));
        assert_eq!(config.nas_result, PathBuf::from("arch.json"));
        assert_eq!(config.result_file, PathBuf::from("best.safetensors"));
    }

    #[test]
    fn flags() {
        let args = parse(&[
            "--search-for",
            "micro",
            "--retrain-epochs",
            "3",
            "--workers",
            "0",
            "--seed",
            "9",
            "a.json",
            "b.safetensors",
        ]);
        let config = RetrainConfig::try_from(args).unwrap();
        assert_eq!(config.search_for, SearchFor::Micro);
        assert_eq!(config.retrain_epochs, 3);
        assert_eq!(config.workers, 0);
        assert_eq!(config.seed, 9);
        assert_eq!(config.train_options().epochs, 3);
    }

    #[test]
    fn rejects_invalid_values() {
        for args in [
            &["--batch-size", "0", "a", "b"][..],
            &["--log-frequency", "0", "a", "b"],
            &["--grad-clip=-1", "a", "b"],
            &["--aux-weight=-1", "a", "b"],
            &["--retrain-epochs", "0", "a", "b"],
        ] {
            assert!(matches!(
                RetrainConfig::try_from(parse(args)),
                Err(RetrainErr::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn zero_grad_clip_is_accepted() {
        let config = RetrainConfig::try_from(parse(&["--grad-clip", "0", "a", "b"])).unwrap();
        assert_eq!(config.train_options().grad_clip, 0.0);
    }

    #[test]
    fn positional_paths_are_required() {
        assert!(RetrainArgs::try_parse_from(["retrain", "only-one.json"]).is_err());
    }
}
