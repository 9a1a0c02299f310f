pub(crate) mod encoder;
pub(crate) mod layers;
pub mod masked_lm;

pub use masked_lm::{MaskedLm, MaskedLmOutput};
