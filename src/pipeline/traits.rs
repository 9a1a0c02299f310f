use candle_core::Tensor;
use serde::Deserialize;

use crate::error::CriterionError;
use crate::types::LabelBatch;

/// Which language-model backend embeds candidate sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderKind {
    /// The LM reads acoustic token indices directly.
    #[default]
    SharedVocab,
    /// Candidates are re-tokenized into the LM's subword vocabulary.
    Subword,
}

/// Output of a frozen LM pass over one candidate batch.
#[derive(Debug, Clone)]
pub struct LmEmbedding {
    /// `(batch, tokens, vocab)` output-layer logits.
    pub logits: Tensor,
    /// `(batch, tokens, features)` states of the selected hidden layer.
    pub hidden: Tensor,
    /// `(batch, tokens)` f32 mask, 1.0 on real tokens.
    pub token_mask: Tensor,
    pub token_lens: Vec<usize>,
}

pub trait LanguageModelEmbedder: Send + Sync {
    fn embed(&self, batch: &LabelBatch) -> Result<LmEmbedding, CriterionError>;

    /// True when `logits` range over the acoustic vocabulary.
    fn shares_vocabulary(&self) -> bool;

    fn label(&self) -> &'static str;
}

pub trait AlignmentSearch: Send + Sync {
    /// `(token, frame)` cells of the best monotonic path through a `tokens x frames` matrix.
    fn align_path(&self, scores: &[Vec<f32>]) -> Vec<(usize, usize)>;
}

/// Word-level beam decoder used only for evaluation-time word errors.
pub trait WordDecoder: Send + Sync {
    /// Best word hypothesis for one utterance's `(frames, vocab)` log-probabilities.
    fn decode(&self, log_probs: &[Vec<f32>]) -> Option<Vec<String>>;
}
