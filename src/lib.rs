//! Retraining of fixed ENAS architectures on CIFAR-10.

pub mod arch;
pub mod config;
pub mod data;
mod driver;
pub mod error;
pub mod nas;
pub mod optimization;
pub mod training;

pub use driver::{build_network, retrain, run};
