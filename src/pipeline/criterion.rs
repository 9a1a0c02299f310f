use std::borrow::Cow;
use std::sync::Arc;

use candle_core::{DType, Tensor, D};
use rand::Rng;

use crate::config::CriterionConfig;
use crate::corruption::SequenceCorruptor;
use crate::error::CriterionError;
use crate::loss::scoring::compatibility;
use crate::loss::{
    kl_divergence, BatchNegativeScorer, CandidateScorer, CtcLoss, DiscriminativeLossAggregator,
    EncoderFrames, SoftLabelBuilder,
};
use crate::metrics::{greedy_ctc_decode, LoggingRecord};
use crate::pipeline::traits::{LanguageModelEmbedder, LmEmbedding, WordDecoder};
use crate::text::{levenshtein, Dictionary, EditDistanceScorer, PostProcess};
use crate::types::{
    frame_validity, CandidateSet, CriterionOutput, LabelBatch, NetOutput, Sample, StepContext,
};

/// Everything the sequence-discriminative KD term needs besides the batch.
pub(crate) struct DistillationStage {
    pub embedder: Arc<dyn LanguageModelEmbedder>,
    pub corruptor: SequenceCorruptor,
    pub scorer: CandidateScorer,
    pub negatives: Option<BatchNegativeScorer>,
    pub edit_distance: EditDistanceScorer,
    pub soft_labels: SoftLabelBuilder,
    pub aggregator: DiscriminativeLossAggregator,
    pub lm_resample: bool,
    pub diagnostics_interval: u64,
}

pub(crate) struct CriterionParts {
    pub config: CriterionConfig,
    pub dictionary: Arc<Dictionary>,
    pub post_process: PostProcess,
    pub distillation: Option<DistillationStage>,
    pub word_decoder: Option<Box<dyn WordDecoder>>,
}

/// CTC loss plus a sequence-discriminative distillation term from a frozen LM.
pub struct CtcSdtKdCriterion {
    config: CriterionConfig,
    dictionary: Arc<Dictionary>,
    ctc: CtcLoss,
    post_process: PostProcess,
    distillation: Option<DistillationStage>,
    word_decoder: Option<Box<dyn WordDecoder>>,
}

/// KD term of one step and what the diagnostics side channel reports.
struct DistillationOutput {
    divergence: Tensor,
    scores: Tensor,
    soft_labels: Vec<Vec<f32>>,
    alignment: Option<Tensor>,
    numerator: LmEmbedding,
    frames: EncoderFrames,
}

impl CtcSdtKdCriterion {
    pub(crate) fn from_parts(parts: CriterionParts) -> Self {
        let ctc = CtcLoss::new(parts.dictionary.blank(), parts.config.zero_infinity);
        Self {
            config: parts.config,
            dictionary: parts.dictionary,
            ctc,
            post_process: parts.post_process,
            distillation: parts.distillation,
            word_decoder: parts.word_decoder,
        }
    }

    pub fn config(&self) -> &CriterionConfig {
        &self.config
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    pub fn has_distillation(&self) -> bool {
        self.distillation.is_some()
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        sample: &Sample,
        net_output: &NetOutput,
        ctx: StepContext,
        rng: &mut R,
    ) -> Result<CriterionOutput, CriterionError> {
        let (frames, batch, _) = net_output
            .log_probs
            .dims3()
            .map_err(|e| CriterionError::runtime("log_probs dims3", e))?;

        let (target, src_lengths) = self.duplicate_for_rdrop(sample, batch);
        let target: &LabelBatch = &target;
        if target.batch_size() != batch {
            return Err(CriterionError::invalid_input(format!(
                "{} targets for a batch of {batch}",
                target.batch_size()
            )));
        }
        let input_lengths = input_lengths(src_lengths, net_output.padding_mask.as_ref(), frames, batch)?;

        let per_item = self
            .ctc
            .forward(&net_output.log_probs, target, &input_lengths)?;
        let mut loss = per_item
            .sum_all()
            .map_err(|e| CriterionError::runtime("sum ctc loss", e))?;

        if ctx.training {
            if let Some(stage) = &self.distillation {
                let kd = self.distill(stage, target, net_output, rng)?;
                loss = stage
                    .aggregator
                    .combine(&loss, &kd.divergence, batch, ctx.num_updates)?;
                if stage.diagnostics_interval > 0
                    && ctx.num_updates % stage.diagnostics_interval == 0
                {
                    log_diagnostics(&kd, stage, ctx.num_updates);
                }
            }
        }

        let ntokens = sample.ntokens.unwrap_or_else(|| target.total_tokens());
        let sample_size = if self.config.sentence_avg {
            target.batch_size()
        } else {
            ntokens
        };
        let loss_value = loss
            .to_dtype(DType::F32)
            .and_then(|t| t.to_scalar::<f32>())
            .map_err(|e| CriterionError::runtime("loss to_scalar", e))?;

        let mut logging = LoggingRecord {
            loss: f64::from(loss_value),
            ntokens: ntokens as u64,
            nsentences: sample.nsentences.unwrap_or(target.batch_size()) as u64,
            sample_size: sample_size as u64,
            ..Default::default()
        };
        if !ctx.training {
            let references = sample
                .target_label
                .as_ref()
                .filter(|label| label.batch_size() == batch)
                .unwrap_or(target);
            self.count_errors(&net_output.log_probs, references, &input_lengths, &mut logging)?;
        }

        Ok(CriterionOutput {
            loss,
            sample_size,
            logging,
        })
    }

    /// Targets and explicit source lengths, doubled when R-Drop doubled the batch.
    fn duplicate_for_rdrop<'a>(
        &self,
        sample: &'a Sample,
        batch: usize,
    ) -> (Cow<'a, LabelBatch>, Option<Vec<usize>>) {
        let src_lengths = sample.src_lengths.clone();
        if self.config.rdrop_alpha <= 0.0 {
            return (Cow::Borrowed(&sample.target), src_lengths);
        }
        let src_lengths = src_lengths.map(|lens| {
            if lens.len() * 2 == batch {
                let mut doubled = lens.clone();
                doubled.extend_from_slice(&lens);
                doubled
            } else {
                lens
            }
        });
        (Cow::Owned(sample.target.repeated()), src_lengths)
    }

    fn distill<R: Rng + ?Sized>(
        &self,
        stage: &DistillationStage,
        target: &LabelBatch,
        net_output: &NetOutput,
        rng: &mut R,
    ) -> Result<DistillationOutput, CriterionError> {
        let encoder_out = net_output.encoder_out_kd.as_ref().ok_or_else(|| {
            CriterionError::invalid_input("distillation needs encoder_out_kd in the model output")
        })?;
        let frames = encoder_frames(encoder_out, net_output.padding_mask.as_ref())?;

        let mut candidates = stage.corruptor.candidates(target, rng)?;
        if stage.lm_resample {
            let resampled = self.lm_resampled_candidate(stage, &candidates, rng)?;
            candidates.push(resampled)?;
        }

        let embeddings = candidates
            .iter()
            .map(|candidate| stage.embedder.embed(candidate))
            .collect::<Result<Vec<_>, _>>()?;
        let scored = stage.scorer.score(&frames, &embeddings)?;

        let references = target
            .valid_rows()
            .map(|row| self.dictionary.string(row))
            .collect::<Vec<_>>();
        let detokenized = candidates
            .iter()
            .map(|candidate| {
                candidate
                    .valid_rows()
                    .map(|row| self.dictionary.string(row))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let mut distances = stage.edit_distance.matrix(&references, &detokenized);

        let mut scores = scored.scores;
        if let Some(negatives) = &stage.negatives {
            if let Some(extra) = negatives.score(&frames, &embeddings[0])? {
                scores = Tensor::cat(&[&scores, &extra], 1)
                    .map_err(|e| CriterionError::runtime("append batch negatives", e))?;
                let extra_distances = negatives
                    .distances(&references, |a, b| stage.edit_distance.distance(a, b));
                for (row, extra) in distances.iter_mut().zip(extra_distances) {
                    row.extend(extra);
                }
            }
        }

        let soft_labels = stage.soft_labels.build(&distances);
        let divergence = kl_divergence(&scores, &soft_labels)?;
        let numerator = embeddings.into_iter().next().ok_or_else(|| {
            CriterionError::runtime("distillation", "candidate set without numerator")
        })?;
        Ok(DistillationOutput {
            divergence,
            scores,
            soft_labels,
            alignment: scored.alignment,
            numerator,
            frames,
        })
    }

    /// Arg-max LM reconstruction of a randomly chosen candidate.
    fn lm_resampled_candidate<R: Rng + ?Sized>(
        &self,
        stage: &DistillationStage,
        candidates: &CandidateSet,
        rng: &mut R,
    ) -> Result<LabelBatch, CriterionError> {
        let index = rng.gen_range(0..candidates.len());
        let source = candidates
            .get(index)
            .ok_or_else(|| CriterionError::runtime("lm resample", "candidate index out of range"))?;
        let embedded = stage.embedder.embed(source)?;
        let predicted = embedded
            .logits
            .argmax(D::Minus1)
            .and_then(|t| t.to_dtype(DType::U32))
            .and_then(|t| t.to_vec2::<u32>())
            .map_err(|e| CriterionError::runtime("lm resample argmax", e))?;
        let rows = predicted
            .iter()
            .zip(source.lengths())
            .map(|(row, &len)| row[..len.min(row.len())].to_vec())
            .collect::<Vec<_>>();
        Ok(LabelBatch::from_rows_with_width(&rows, source.pad(), source.width()))
    }

    fn count_errors(
        &self,
        log_probs: &Tensor,
        references: &LabelBatch,
        input_lengths: &[usize],
        logging: &mut LoggingRecord,
    ) -> Result<(), CriterionError> {
        let host = log_probs
            .to_dtype(DType::F32)
            .and_then(|t| t.transpose(0, 1))
            .and_then(|t| t.contiguous())
            .and_then(|t| t.to_vec3::<f32>())
            .map_err(|e| CriterionError::runtime("log_probs to host", e))?;

        let eos = self.dictionary.eos();
        for ((item, reference), &len) in host.iter().zip(references.valid_rows()).zip(input_lengths) {
            let frames = &item[..len.min(item.len())];
            let reference = reference
                .iter()
                .copied()
                .filter(|&t| t != eos)
                .collect::<Vec<_>>();
            let hypothesis = greedy_ctc_decode(frames, self.dictionary.blank());

            logging.c_errors += levenshtein(&hypothesis, &reference) as u64;
            logging.c_total += reference.len() as u64;

            let reference_words = self.post_process.words(&self.dictionary.string(&reference));
            let raw_words = self.post_process.words(&self.dictionary.string(&hypothesis));
            let raw_errors = levenshtein(&raw_words, &reference_words) as u64;
            let decoded = self
                .word_decoder
                .as_ref()
                .and_then(|decoder| decoder.decode(frames))
                .filter(|words| !words.is_empty());
            logging.w_errors += match decoded {
                Some(words) => levenshtein(&words, &reference_words) as u64,
                None => raw_errors,
            };
            logging.wv_errors += raw_errors;
            logging.w_total += reference_words.len() as u64;
        }
        Ok(())
    }
}

/// Explicit source lengths, else unpadded frame counts, else every frame.
fn input_lengths(
    src_lengths: Option<Vec<usize>>,
    padding_mask: Option<&Tensor>,
    frames: usize,
    batch: usize,
) -> Result<Vec<usize>, CriterionError> {
    let lengths = match (src_lengths, padding_mask) {
        (Some(lengths), _) => lengths,
        (None, Some(mask)) => valid_frame_counts(mask)?,
        (None, None) => vec![frames; batch],
    };
    if lengths.len() != batch {
        return Err(CriterionError::invalid_input(format!(
            "{} input lengths for a batch of {batch}",
            lengths.len()
        )));
    }
    Ok(lengths)
}

fn valid_frame_counts(padding_mask: &Tensor) -> Result<Vec<usize>, CriterionError> {
    let rows = padding_mask
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(|e| CriterionError::runtime("padding mask to host", e))?;
    Ok(rows
        .iter()
        .map(|row| row.iter().filter(|&&pad| pad == 0.0).count())
        .collect())
}

fn encoder_frames(
    encoder_out: &Tensor,
    padding_mask: Option<&Tensor>,
) -> Result<EncoderFrames, CriterionError> {
    let (frames, batch, _) = encoder_out
        .dims3()
        .map_err(|e| CriterionError::runtime("encoder_out dims3", e))?;
    let (mask, lengths) = match padding_mask {
        Some(padding) => (
            frame_validity(padding).map_err(|e| CriterionError::runtime("frame validity", e))?,
            valid_frame_counts(padding)?,
        ),
        None => (
            Tensor::ones((batch, frames), DType::F32, encoder_out.device())
                .map_err(|e| CriterionError::runtime("frame validity", e))?,
            vec![frames; batch],
        ),
    };
    EncoderFrames::from_time_major(encoder_out, mask, lengths)
}

/// Side channel only: logs, never alters the step.
fn log_diagnostics(kd: &DistillationOutput, stage: &DistillationStage, num_updates: u64) {
    let summary = || -> candle_core::Result<(Vec<f32>, Vec<u32>, Vec<f32>)> {
        let scores = candle_nn::ops::softmax(&kd.scores.get(0)?, D::Minus1)?.to_vec1::<f32>()?;
        let compat = compatibility(&kd.numerator, &kd.frames)?.get(0)?;
        let (alignment, salience) = match &kd.alignment {
            Some(mask) => {
                let mask = mask.get(0)?;
                (
                    mask.argmax(D::Minus1)?.to_vec1::<u32>()?,
                    (compat * mask)?.sum(D::Minus1)?.to_vec1::<f32>()?,
                )
            }
            None => (
                compat.argmax(D::Minus1)?.to_vec1::<u32>()?,
                compat.max(D::Minus1)?.to_vec1::<f32>()?,
            ),
        };
        Ok((scores, alignment, salience))
    };

    let corruptions = stage
        .corruptor
        .corruptions()
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>();
    match summary() {
        Ok((scores, alignment, salience)) => tracing::debug!(
            num_updates,
            ?corruptions,
            projection = ?stage.scorer.axis(),
            embedder = stage.embedder.label(),
            score_shape = ?kd.scores.dims(),
            score_softmax = ?scores,
            soft_labels = ?kd.soft_labels.first(),
            alignment = ?alignment,
            salience = ?salience,
            divergence = ?kd.divergence.to_scalar::<f32>().ok(),
            "kd diagnostics"
        ),
        Err(err) => tracing::warn!(num_updates, error = %err, "kd diagnostics unavailable"),
    }
}
