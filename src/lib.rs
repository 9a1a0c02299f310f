pub mod alignment;
pub mod config;
pub mod corruption;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod text;
pub mod types;

pub use config::{CriterionConfig, KdConfig, WerDecoderConfig};
pub use corruption::{Corruption, SequenceCorruptor};
pub use error::CriterionError;
pub use loss::{CtcLoss, ProjectionAxis, SoftLabelBuilder, SoftLabelPolicy};
pub use metrics::{logging_outputs_can_be_summed, reduce_metrics, LoggingRecord, ReducedMetrics};
pub use pipeline::builder::CriterionBuilder;
pub use pipeline::criterion::CtcSdtKdCriterion;
pub use pipeline::traits::{
    AlignmentSearch, EmbedderKind, LanguageModelEmbedder, LmEmbedding, WordDecoder,
};
pub use text::{Dictionary, EditDistanceMode, EditDistanceScorer, PostProcess};
pub use types::{
    CandidateSet, CriterionOutput, LabelBatch, NetOutput, Sample, StepContext,
};
