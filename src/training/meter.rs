/// Keeps the running, sample weighted average of a metric.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    name: &'static str,
    val: f32,
    sum: f32,
    count: usize,
    avg: f32,
}

impl AverageMeter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.name);
    }

    /// Records `val`, measured over `n` samples.
    pub fn update(&mut self, val: f32, n: usize) {
        self.val = val;
        self.sum += val * n as f32;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f32;
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The last recorded value.
    pub fn val(&self) -> f32 {
        self.val
    }

    pub fn avg(&self) -> f32 {
        self.avg
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_by_sample_count() {
        let mut meter = AverageMeter::new("top1");
        meter.update(1.0, 3);
        meter.update(0.0, 1);
        assert_eq!(meter.avg(), 0.75);
        assert_eq!(meter.val(), 0.0);
        assert_eq!(meter.count(), 4);

        meter.reset();
        assert_eq!(meter.avg(), 0.0);
        assert_eq!(meter.count(), 0);
        assert_eq!(meter.name(), "top1");
    }
}
