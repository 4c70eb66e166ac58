use log::info;

use super::{AverageMeter, BestTracker, CheckpointSink, accuracy};
use crate::{
    arch::{Mode, Model, ParamStore, loss::LossFn},
    data::DataLoader,
    error::Result,
    optimization::{CosineAnnealing, Optimizer, clip_grad_norm},
};

/// The knobs of the training loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOptions {
    pub epochs: usize,
    /// The weight of the auxiliary loss, 0 disables it.
    pub aux_weight: f32,
    /// The maximum global L2 norm of the gradient.
    pub grad_clip: f32,
    /// Log every this many steps.
    pub log_frequency: usize,
}

/// The averages of one pass over a loader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub loss: f32,
    pub top1: f32,
    pub top5: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub top1: f32,
    /// The best validation accuracy after this epoch.
    pub best: f32,
    /// Whether a checkpoint was written after this epoch.
    pub saved: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrainSummary {
    pub history: Vec<EpochRecord>,
    pub best_top1: f32,
}

struct Meters {
    losses: AverageMeter,
    top1: AverageMeter,
    top5: AverageMeter,
}

impl Meters {
    fn new() -> Self {
        Self {
            losses: AverageMeter::new("losses"),
            top1: AverageMeter::new("top1"),
            top5: AverageMeter::new("top5"),
        }
    }

    fn stats(&self) -> EpochStats {
        EpochStats {
            loss: self.losses.avg(),
            top1: self.top1.avg(),
            top5: self.top5.avg(),
        }
    }
}

/// Retrains a fixed model: owns it together with its values, the optimizer, the loss function
/// and the learning rate schedule.
pub struct Retrainer<M, O, L>
where
    M: Model,
    O: Optimizer,
    L: LossFn,
{
    model: M,
    store: ParamStore,
    optimizer: O,
    loss_fn: L,
    schedule: CosineAnnealing,
    best: BestTracker,
    options: TrainOptions,
}

impl<M, O, L> Retrainer<M, O, L>
where
    M: Model,
    O: Optimizer,
    L: LossFn,
{
    /// Returns a new `Retrainer`.
    ///
    /// # Arguments
    /// * `model` - The model that will be trained.
    /// * `store` - The model's values.
    /// * `optimizer` - The optimizer updating the parameters after every batch.
    /// * `loss_fn` - The loss function used to measure the difference between the model's output and the labels.
    /// * `schedule` - The learning rate schedule, stepped after every epoch.
    /// * `options` - The training loop's knobs.
    pub fn new(
        model: M,
        store: ParamStore,
        mut optimizer: O,
        loss_fn: L,
        schedule: CosineAnnealing,
        options: TrainOptions,
    ) -> Self {
        optimizer.set_learning_rate(schedule.learning_rate());
        Self {
            model,
            store,
            optimizer,
            loss_fn,
            schedule,
            best: BestTracker::new(),
            options,
        }
    }

    pub fn store(&self) -> &ParamStore {
        &self.store
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Runs one training pass over `loader`.
    ///
    /// # Arguments
    /// * `epoch` - The zero based epoch.
    /// * `loader` - The training batches.
    pub fn train_epoch(&mut self, epoch: usize, loader: &mut DataLoader) -> Result<EpochStats> {
        let TrainOptions {
            epochs,
            aux_weight,
            grad_clip,
            log_frequency,
        } = self.options;

        info!("Epoch {epoch} LR {:.6}", self.optimizer.learning_rate());

        let mut meters = Meters::new();
        let last_step = loader.len().saturating_sub(1);
        loader.reset();

        let mut step = 0;
        while let Some(batch) = loader.next_batch() {
            let bs = batch.len();

            self.store.zero_grad();
            let logits = self.model.forward(&mut self.store, &batch.images, Mode::Train)?;

            let mut loss = self.loss_fn.loss(logits.main.view(), &batch.labels);
            let d_main = self.loss_fn.loss_prime(logits.main.view(), &batch.labels);
            let d_aux = match &logits.aux {
                Some(aux) if aux_weight > 0.0 => {
                    loss += aux_weight * self.loss_fn.loss(aux.view(), &batch.labels);
                    Some(self.loss_fn.loss_prime(aux.view(), &batch.labels) * aux_weight)
                }
                _ => None,
            };

            self.model.backward(&mut self.store, d_main, d_aux)?;
            clip_grad_norm(self.store.grad_mut(), grad_clip);
            let (grad, params) = self.store.grad_and_params_mut();
            self.optimizer.update_params(grad, params)?;

            meters.losses.update(loss, bs);
            meters.top1.update(accuracy(logits.main.view(), &batch.labels, 1), bs);
            meters.top5.update(accuracy(logits.main.view(), &batch.labels, 5), bs);

            if step % log_frequency == 0 || step == last_step {
                log_step("Train", epoch, epochs, step, last_step, &meters);
            }

            step += 1;
        }

        info!(
            "Train: [{:3}/{epochs}] Final Prec@1 {:.4}%",
            epoch + 1,
            meters.top1.avg() * 100.0
        );

        Ok(meters.stats())
    }

    /// Runs one evaluation pass over `loader`.
    ///
    /// # Returns
    /// The pass' statistics, its `top1` being the epoch's validation accuracy.
    pub fn validate(&mut self, epoch: usize, loader: &mut DataLoader) -> Result<EpochStats> {
        let TrainOptions {
            epochs,
            log_frequency,
            ..
        } = self.options;

        let mut meters = Meters::new();
        let last_step = loader.len().saturating_sub(1);
        loader.reset();

        let mut step = 0;
        while let Some(batch) = loader.next_batch() {
            let bs = batch.len();
            let logits = self.model.forward(&mut self.store, &batch.images, Mode::Eval)?;
            let loss = self.loss_fn.loss(logits.main.view(), &batch.labels);

            meters.losses.update(loss, bs);
            meters.top1.update(accuracy(logits.main.view(), &batch.labels, 1), bs);
            meters.top5.update(accuracy(logits.main.view(), &batch.labels, 5), bs);

            if step % log_frequency == 0 || step == last_step {
                log_step("Valid", epoch, epochs, step, last_step, &meters);
            }

            step += 1;
        }

        info!(
            "Valid: [{:3}/{epochs}] Final Prec@1 {:.4}%",
            epoch + 1,
            meters.top1.avg() * 100.0
        );

        Ok(meters.stats())
    }

    /// Trains and validates for every epoch, saving the model into `sink` whenever the
    /// validation accuracy ties or beats the best so far.
    ///
    /// # Returns
    /// What happened on every epoch and the best validation accuracy.
    pub fn run<S: CheckpointSink>(
        &mut self,
        train: &mut DataLoader,
        valid: &mut DataLoader,
        sink: &mut S,
    ) -> Result<RetrainSummary> {
        let mut history = Vec::with_capacity(self.options.epochs);

        for epoch in 0..self.options.epochs {
            self.train_epoch(epoch, train)?;
            let top1 = self.validate(epoch, valid)?.top1;

            let saved = self.best.observe(top1);
            if saved {
                sink.save(&self.store, epoch, top1)?;
            }

            history.push(EpochRecord {
                epoch,
                top1,
                best: self.best.best(),
                saved,
            });

            let lr = self.schedule.step();
            self.optimizer.set_learning_rate(lr);
        }

        let best_top1 = self.best.best();
        info!("Final best Prec@1 = {:.4}%", best_top1 * 100.0);

        Ok(RetrainSummary { history, best_top1 })
    }
}

fn log_step(phase: &str, epoch: usize, epochs: usize, step: usize, last_step: usize, meters: &Meters) {
    info!(
        "{phase}: [{:3}/{epochs}] Step {step:03}/{last_step:03} Loss {:.3} Prec@(1,5) ({:.1}%, {:.1}%)",
        epoch + 1,
        meters.losses.avg(),
        meters.top1.avg() * 100.0,
        meters.top5.avg() * 100.0
    );
}
