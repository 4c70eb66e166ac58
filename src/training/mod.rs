mod checkpoint;
mod meter;
mod metrics;
mod trainer;

pub use checkpoint::{BestTracker, CheckpointSink, SafetensorsCheckpoint, read_checkpoint};
pub use meter::AverageMeter;
pub use metrics::accuracy;
pub use trainer::{EpochRecord, EpochStats, RetrainSummary, Retrainer, TrainOptions};
