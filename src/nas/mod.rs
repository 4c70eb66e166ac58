//! The two ENAS model families and the fixed architectures that pin down their choices.

mod common;
mod fixed;
mod macro_net;
mod micro_net;

use ndarray::{Array2, Array4};
use rand::rngs::StdRng;

pub use fixed::{ChoiceValue, FixedArchitecture};
pub use macro_net::{GeneralNetwork, MACRO_OPS, MacroConfig};
pub use micro_net::{MICRO_OPS, MicroConfig, MicroNetwork};

use crate::{
    arch::{Logits, Mode, Model, ParamStore},
    error::Result,
};

#[derive(Debug, Clone)]
pub enum NetworkKind {
    Macro(GeneralNetwork),
    Micro(MicroNetwork),
}

/// A fixed network of either family, together with the random number generator its dropout
/// draws from.
#[derive(Debug, Clone)]
pub struct Network {
    kind: NetworkKind,
    rng: StdRng,
}

impl Network {
    pub fn new(kind: NetworkKind, rng: StdRng) -> Self {
        Self { kind, rng }
    }

    pub fn kind(&self) -> &NetworkKind {
        &self.kind
    }
}

impl Model for Network {
    fn forward(&mut self, store: &mut ParamStore, x: &Array4<f32>, mode: Mode) -> Result<Logits> {
        match &mut self.kind {
            NetworkKind::Macro(net) => {
                let main = net.forward(store, x, mode, &mut self.rng)?;
                Ok(Logits { main, aux: None })
            }
            NetworkKind::Micro(net) => net.forward(store, x, mode, &mut self.rng),
        }
    }

    fn backward(
        &mut self,
        store: &mut ParamStore,
        d_main: Array2<f32>,
        d_aux: Option<Array2<f32>>,
    ) -> Result<()> {
        match &mut self.kind {
            NetworkKind::Macro(net) => net.backward(store, &d_main),
            NetworkKind::Micro(net) => net.backward(store, &d_main, d_aux.as_ref()),
        }
    }
}
