pub mod builder;
pub mod criterion;
pub mod defaults;
pub mod embedder;
pub mod traits;
