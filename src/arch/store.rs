use std::ops::Range;

use rand::Rng;
use rand_distr::{Distribution, Normal};

/// A contiguous region inside one of the flat buffers of a `ParamStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    offset: usize,
    len: usize,
}

impl Slot {
    /// Returns the amount of values this slot spans.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the range of this slot within its buffer.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// How a parameter is initialized when it's registered.
#[derive(Debug, Clone, Copy)]
pub enum Init {
    Zeros,
    Ones,
    /// Uniform in `[-bound, bound]`.
    Uniform { bound: f32 },
    /// Normal with `std = sqrt(2 / fan_in)`.
    KaimingNormal { fan_in: usize },
}

impl Init {
    /// The default initialization for a weight with the given fan in.
    pub fn fan_in(fan_in: usize) -> Self {
        Self::Uniform {
            bound: 1.0 / (fan_in.max(1) as f32).sqrt(),
        }
    }

    fn fill<R: Rng>(self, values: &mut [f32], rng: &mut R) {
        match self {
            Init::Zeros => values.fill(0.0),
            Init::Ones => values.fill(1.0),
            Init::Uniform { bound } => values
                .iter_mut()
                .for_each(|v| *v = rng.random_range(-bound..=bound)),
            Init::KaimingNormal { fan_in } => {
                let std = (2.0 / fan_in.max(1) as f32).sqrt();
                let Ok(normal) = Normal::new(0.0, std) else {
                    values.fill(0.0);
                    return;
                };

                values.iter_mut().for_each(|v| *v = normal.sample(rng));
            }
        }
    }
}

/// A named and shaped region of a flat buffer.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub shape: Vec<usize>,
    pub slot: Slot,
}

/// Owns every value of a model: the trainable parameters, their gradient and the
/// non-trainable buffers (batch norm running statistics).
///
/// Layers never own their values, they only keep `Slot`s into these buffers, which lets the
/// optimizer, the gradient clipping and the checkpointing work over plain slices.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    params: Vec<f32>,
    grad: Vec<f32>,
    buffers: Vec<f32>,
    param_entries: Vec<Entry>,
    buffer_entries: Vec<Entry>,
}

impl ParamStore {
    /// Returns the amount of trainable parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut [f32] {
        &mut self.grad
    }

    pub fn buffers(&self) -> &[f32] {
        &self.buffers
    }

    /// Gives the gradient and the parameters at the same time, as needed by optimizers.
    pub fn grad_and_params_mut(&mut self) -> (&[f32], &mut [f32]) {
        (&self.grad, &mut self.params)
    }

    pub fn param(&self, slot: Slot) -> &[f32] {
        &self.params[slot.range()]
    }

    /// Gives the parameters of a slot together with its gradient.
    pub fn param_and_grad(&mut self, slot: Slot) -> (&[f32], &mut [f32]) {
        (&self.params[slot.range()], &mut self.grad[slot.range()])
    }

    pub fn grad_at(&mut self, slot: Slot) -> &mut [f32] {
        &mut self.grad[slot.range()]
    }

    pub fn buffer(&self, slot: Slot) -> &[f32] {
        &self.buffers[slot.range()]
    }

    pub fn buffer_mut(&mut self, slot: Slot) -> &mut [f32] {
        &mut self.buffers[slot.range()]
    }

    /// Zeros out the whole gradient.
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// The named trainable parameters, in registration order.
    pub fn param_entries(&self) -> &[Entry] {
        &self.param_entries
    }

    /// The named non-trainable buffers, in registration order.
    pub fn buffer_entries(&self) -> &[Entry] {
        &self.buffer_entries
    }
}

/// Registers the values of a model while it's being constructed.
///
/// Names are built from a stack of scopes, so `scope("stem", ..)` followed by
/// `param("weight", ..)` registers `stem.weight`.
pub struct StoreBuilder<R: Rng> {
    store: ParamStore,
    scopes: Vec<String>,
    rng: R,
}

impl<R: Rng> StoreBuilder<R> {
    /// Creates a new `StoreBuilder`.
    ///
    /// # Arguments
    /// * `rng` - The random number generator used for initializing parameters.
    pub fn new(rng: R) -> Self {
        Self {
            store: ParamStore::default(),
            scopes: Vec::new(),
            rng,
        }
    }

    /// Runs `f` with `name` pushed onto the naming scope.
    pub fn scope<T, F>(&mut self, name: impl Into<String>, f: F) -> T
    where
        F: FnOnce(&mut Self) -> T,
    {
        self.scopes.push(name.into());
        let ret = f(self);
        self.scopes.pop();
        ret
    }

    /// Registers a trainable parameter.
    ///
    /// # Arguments
    /// * `name` - The parameter's name within the current scope.
    /// * `shape` - The parameter's shape.
    /// * `init` - How the values are initialized.
    ///
    /// # Returns
    /// The slot of the parameter within the store.
    pub fn param(&mut self, name: &str, shape: &[usize], init: Init) -> Slot {
        let len = shape.iter().product();
        let slot = Slot {
            offset: self.store.params.len(),
            len,
        };

        let mut values = vec![0.0; len];
        init.fill(&mut values, &mut self.rng);
        self.store.params.extend(values);
        self.store.grad.resize(self.store.params.len(), 0.0);

        let entry = self.entry(name, shape, slot);
        self.store.param_entries.push(entry);
        slot
    }

    /// Registers a non-trainable buffer filled with `value`.
    pub fn buffer(&mut self, name: &str, shape: &[usize], value: f32) -> Slot {
        let len = shape.iter().product();
        let slot = Slot {
            offset: self.store.buffers.len(),
            len,
        };

        self.store.buffers.resize(slot.offset + len, value);
        let entry = self.entry(name, shape, slot);
        self.store.buffer_entries.push(entry);
        slot
    }

    /// Re-initializes every parameter registered so far for which `select` returns an `Init`.
    pub fn reinit<F>(&mut self, select: F)
    where
        F: Fn(&Entry) -> Option<Init>,
    {
        for entry in &self.store.param_entries {
            if let Some(init) = select(entry) {
                init.fill(&mut self.store.params[entry.slot.range()], &mut self.rng);
            }
        }
    }

    /// Gives access to the builder's random number generator.
    pub fn rng(&mut self) -> &mut R {
        &mut self.rng
    }

    /// Returns the built store.
    pub fn finish(self) -> ParamStore {
        self.store
    }

    fn entry(&self, name: &str, shape: &[usize], slot: Slot) -> Entry {
        let mut full = self.scopes.join(".");
        if !full.is_empty() {
            full.push('.');
        }
        full.push_str(name);

        Entry {
            name: full,
            shape: shape.to_vec(),
            slot,
        }
    }
}
