pub mod ctc;
pub mod discriminative;
pub mod scoring;
pub mod soft_label;

pub use ctc::CtcLoss;
pub use discriminative::{kl_divergence, DiscriminativeLossAggregator};
pub use scoring::{BatchNegativeScorer, CandidateScorer, EncoderFrames, ProjectionAxis, ScoreOutput};
pub use soft_label::{SoftLabelBuilder, SoftLabelPolicy};
