pub mod layers;
pub mod loss;
mod model;
pub mod store;

pub use model::{Logits, Mode, Model};
pub use store::{Init, ParamStore, Slot, StoreBuilder};
