use std::f32::consts::PI;

/// Anneals a learning rate from `base_lr` down to `eta_min` following half a cosine period
/// over `t_max` epochs.
#[derive(Debug, Clone)]
pub struct CosineAnnealing {
    base_lr: f32,
    eta_min: f32,
    t_max: usize,
    epoch: usize,
}

impl CosineAnnealing {
    pub fn new(base_lr: f32, t_max: usize, eta_min: f32) -> Self {
        Self {
            base_lr,
            eta_min,
            t_max,
            epoch: 0,
        }
    }

    /// The learning rate for the current epoch.
    pub fn learning_rate(&self) -> f32 {
        if self.t_max == 0 {
            return self.base_lr;
        }

        let progress = self.epoch as f32 / self.t_max as f32;
        self.eta_min + (self.base_lr - self.eta_min) * (1.0 + (PI * progress).cos()) / 2.0
    }

    /// Moves to the next epoch.
    ///
    /// # Returns
    /// The new learning rate.
    pub fn step(&mut self) -> f32 {
        self.epoch += 1;
        self.learning_rate()
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}
