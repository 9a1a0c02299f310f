pub mod mas;
pub mod mask;

pub use mas::monotonic_alignment_path;
pub use mask::{alignment_mask, fit_token_axis};
