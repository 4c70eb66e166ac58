use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::info;

use enas_retrain::config::{RetrainArgs, RetrainConfig};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = RetrainConfig::try_from(RetrainArgs::parse()).context("invalid arguments")?;
    let summary = enas_retrain::run(&config)
        .with_context(|| format!("retraining {}", config.nas_result.display()))?;

    let saves = summary.history.iter().filter(|r| r.saved).count();
    info!(
        "wrote {} checkpoints to {}",
        saves,
        config.result_file.display()
    );

    Ok(())
}
