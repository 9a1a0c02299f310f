pub mod dictionary;
pub mod edit_distance;
pub mod post_process;

pub use dictionary::Dictionary;
pub use edit_distance::{levenshtein, EditDistanceMode, EditDistanceScorer};
pub use post_process::PostProcess;
