use std::sync::Arc;

use candle_core::{DType, Tensor, D};
use serde::Deserialize;

use crate::alignment::mask::{alignment_mask, fit_token_axis};
use crate::error::CriterionError;
use crate::pipeline::traits::{AlignmentSearch, LmEmbedding};

/// Masked-out cells before a max reduction.
const NEG: f32 = -1e30;

/// How a `(tokens, frames)` compatibility matrix collapses to one score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionAxis {
    /// Weight by the numerator's monotonic alignment, sum frames, mean over tokens.
    #[default]
    Mas,
    /// Best token per frame, mean over valid frames.
    Speech,
    /// Best frame per token, mean over valid tokens.
    Text,
}

/// Encoder states shared by every candidate of one batch.
#[derive(Debug, Clone)]
pub struct EncoderFrames {
    /// `(batch, frames, features)`, zeroed on padded frames.
    pub states: Tensor,
    /// `(batch, frames)` f32, 1.0 on valid frames.
    pub mask: Tensor,
    pub lengths: Vec<usize>,
}

impl EncoderFrames {
    /// Wraps `(frames, batch, features)` encoder output and its validity mask.
    pub fn from_time_major(
        encoder_out: &Tensor,
        mask: Tensor,
        lengths: Vec<usize>,
    ) -> Result<Self, CriterionError> {
        let (frames, batch, _) = encoder_out
            .dims3()
            .map_err(|e| CriterionError::runtime("encoder_out dims3", e))?;
        let mask_dims = mask
            .dims2()
            .map_err(|e| CriterionError::runtime("frame mask dims2", e))?;
        if mask_dims != (batch, frames) || lengths.len() != batch {
            return Err(CriterionError::invalid_input(format!(
                "encoder output is {frames} frames x {batch} items but frame mask is {mask_dims:?} with {} lengths",
                lengths.len()
            )));
        }
        let states = encoder_out
            .to_dtype(DType::F32)
            .and_then(|t| t.transpose(0, 1))
            .and_then(|t| t.contiguous())
            .and_then(|t| t.broadcast_mul(&mask.unsqueeze(2)?))
            .map_err(|e| CriterionError::runtime("encoder_out to batch-major", e))?;
        Ok(Self {
            states,
            mask,
            lengths,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }
}

/// Per-candidate scores and the numerator alignment they were weighted with.
#[derive(Debug, Clone)]
pub struct ScoreOutput {
    /// `(batch, candidates)`.
    pub scores: Tensor,
    /// `(batch, numerator tokens, frames)`, present for [`ProjectionAxis::Mas`].
    pub alignment: Option<Tensor>,
}

pub struct CandidateScorer {
    axis: ProjectionAxis,
    aligner: Arc<dyn AlignmentSearch>,
}

impl CandidateScorer {
    pub fn new(axis: ProjectionAxis, aligner: Arc<dyn AlignmentSearch>) -> Self {
        Self { axis, aligner }
    }

    pub fn axis(&self) -> ProjectionAxis {
        self.axis
    }

    /// Scores every candidate embedding against the encoder frames.
    /// `embeddings[0]` must be the numerator.
    pub fn score(
        &self,
        frames: &EncoderFrames,
        embeddings: &[LmEmbedding],
    ) -> Result<ScoreOutput, CriterionError> {
        let Some(numerator) = embeddings.first() else {
            return Err(CriterionError::invalid_input("no candidate embeddings to score"));
        };

        let alignment = match self.axis {
            ProjectionAxis::Mas => {
                let compat = compatibility(numerator, frames)
                    .map_err(|e| CriterionError::runtime("numerator compatibility", e))?;
                Some(alignment_mask(
                    self.aligner.as_ref(),
                    &compat,
                    &numerator.token_lens,
                    &frames.lengths,
                )?)
            }
            ProjectionAxis::Speech | ProjectionAxis::Text => None,
        };

        let mut columns = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            if embedding.token_lens.len() != frames.batch_size() {
                return Err(CriterionError::invalid_input(format!(
                    "candidate embedding has {} items, encoder output has {}",
                    embedding.token_lens.len(),
                    frames.batch_size()
                )));
            }
            let column = compatibility(embedding, frames)
                .and_then(|compat| {
                    project(self.axis, &compat, embedding, frames, alignment.as_ref())
                })
                .map_err(|e| CriterionError::runtime("candidate score", e))?;
            columns.push(column);
        }
        let scores = Tensor::stack(&columns, 1)
            .map_err(|e| CriterionError::runtime("stack candidate scores", e))?;
        Ok(ScoreOutput { scores, alignment })
    }
}

/// Scores each item against the other items' references as extra negatives.
#[derive(Debug, Clone, Copy)]
pub struct BatchNegativeScorer {
    axis: ProjectionAxis,
}

impl BatchNegativeScorer {
    /// Alignment weighting needs a matching reference, so `Mas` falls back to `Text`.
    pub fn new(axis: ProjectionAxis) -> Self {
        let axis = match axis {
            ProjectionAxis::Speech => ProjectionAxis::Speech,
            ProjectionAxis::Mas | ProjectionAxis::Text => ProjectionAxis::Text,
        };
        Self { axis }
    }

    pub fn axis(&self) -> ProjectionAxis {
        self.axis
    }

    /// Index of the reference item `j` is scored against at `shift`.
    fn source(j: usize, shift: usize, batch: usize) -> usize {
        (j + batch - shift % batch) % batch
    }

    /// `(batch, batch - 1)` scores; `None` for batches of one.
    pub fn score(
        &self,
        frames: &EncoderFrames,
        numerator: &LmEmbedding,
    ) -> Result<Option<Tensor>, CriterionError> {
        let batch = frames.batch_size();
        if batch < 2 {
            return Ok(None);
        }
        let device = frames.states.device();
        let mut columns = Vec::with_capacity(batch - 1);
        for shift in 1..batch {
            let order = (0..batch)
                .map(|j| Self::source(j, shift, batch) as u32)
                .collect::<Vec<_>>();
            let column = Tensor::from_vec(order.clone(), batch, device)
                .and_then(|idx| {
                    let rolled = LmEmbedding {
                        logits: numerator.logits.index_select(&idx, 0)?,
                        hidden: numerator.hidden.index_select(&idx, 0)?,
                        token_mask: numerator.token_mask.index_select(&idx, 0)?,
                        token_lens: order.iter().map(|&i| numerator.token_lens[i as usize]).collect(),
                    };
                    let compat = compatibility(&rolled, frames)?;
                    project(self.axis, &compat, &rolled, frames, None)
                })
                .map_err(|e| CriterionError::runtime("batch negative score", e))?;
            columns.push(column);
        }
        Tensor::stack(&columns, 1)
            .map(Some)
            .map_err(|e| CriterionError::runtime("stack batch negative scores", e))
    }

    /// `(batch, batch - 1)` distances between each reference and the rolled ones.
    pub fn distances<F>(&self, references: &[String], distance: F) -> Vec<Vec<f32>>
    where
        F: Fn(&str, &str) -> f32,
    {
        let batch = references.len();
        (0..batch)
            .map(|j| {
                (1..batch)
                    .map(|shift| distance(&references[j], &references[Self::source(j, shift, batch)]))
                    .collect()
            })
            .collect()
    }
}

/// `(batch, tokens, frames)` dot products of token embeddings with encoder frames,
/// zero on padded tokens and padded frames.
pub(crate) fn compatibility(
    embedding: &LmEmbedding,
    frames: &EncoderFrames,
) -> candle_core::Result<Tensor> {
    let hidden = embedding.hidden.to_dtype(DType::F32)?;
    let compat = hidden.matmul(&frames.states.transpose(1, 2)?.contiguous()?)?;
    compat.broadcast_mul(&embedding.token_mask.to_dtype(DType::F32)?.unsqueeze(2)?)
}

fn project(
    axis: ProjectionAxis,
    compat: &Tensor,
    embedding: &LmEmbedding,
    frames: &EncoderFrames,
    alignment: Option<&Tensor>,
) -> candle_core::Result<Tensor> {
    let device = compat.device();
    let (batch, tokens, _) = compat.dims3()?;
    let token_mask = embedding.token_mask.to_dtype(DType::F32)?;
    let token_norm = reciprocal_counts(&embedding.token_lens, device)?;
    let frame_norm = reciprocal_counts(&frames.lengths, device)?;

    match (axis, alignment) {
        (ProjectionAxis::Mas, Some(alignment)) => {
            let weights = fit_token_axis(alignment, tokens)?;
            (compat * weights)?
                .sum(D::Minus1)?
                .mul(&token_mask)?
                .sum(1)?
                .mul(&token_norm)
        }
        (ProjectionAxis::Mas, None) => Err(candle_core::Error::Msg(
            "alignment projection needs the numerator alignment".to_string(),
        )),
        (ProjectionAxis::Speech, _) => {
            let token_fill = token_mask.affine(-(NEG as f64), NEG as f64)?.unsqueeze(2)?;
            let has_tokens = presence(&embedding.token_lens, device)?;
            compat
                .broadcast_add(&token_fill)?
                .max(1)?
                .mul(&frames.mask)?
                .broadcast_mul(&has_tokens.reshape((batch, 1))?)?
                .sum(1)?
                .mul(&frame_norm)
        }
        (ProjectionAxis::Text, _) => {
            let frame_fill = frames.mask.affine(-(NEG as f64), NEG as f64)?.unsqueeze(1)?;
            let has_frames = presence(&frames.lengths, device)?;
            compat
                .broadcast_add(&frame_fill)?
                .max(2)?
                .mul(&token_mask)?
                .broadcast_mul(&has_frames.reshape((batch, 1))?)?
                .sum(1)?
                .mul(&token_norm)
        }
    }
}

/// `1 / max(n, 1)` per item; zero-length items divide by one.
fn reciprocal_counts(counts: &[usize], device: &candle_core::Device) -> candle_core::Result<Tensor> {
    let values = counts
        .iter()
        .map(|&n| 1.0 / n.max(1) as f32)
        .collect::<Vec<_>>();
    Tensor::from_vec(values, counts.len(), device)
}

fn presence(counts: &[usize], device: &candle_core::Device) -> candle_core::Result<Tensor> {
    let values = counts
        .iter()
        .map(|&n| if n > 0 { 1f32 } else { 0f32 })
        .collect::<Vec<_>>();
    Tensor::from_vec(values, counts.len(), device)
}
