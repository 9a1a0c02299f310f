use candle_core::{DType, Device, Tensor};

use crate::error::CriterionError;
use crate::metrics::LoggingRecord;

/// Padded batch of label sequences over the acoustic vocabulary.
///
/// Rows are stored row-major with a common width; `lengths[i]` tokens of row
/// `i` are valid and the remainder is filled with the pad index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelBatch {
    tokens: Vec<u32>,
    lengths: Vec<usize>,
    width: usize,
    pad: u32,
}

impl LabelBatch {
    /// Pads unpadded rows to the longest row.
    pub fn from_rows(rows: &[Vec<u32>], pad: u32) -> Self {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        Self::from_rows_with_width(rows, pad, width)
    }

    /// Pads unpadded rows to `width`; rows longer than `width` are truncated.
    pub fn from_rows_with_width(rows: &[Vec<u32>], pad: u32, width: usize) -> Self {
        let mut tokens = vec![pad; rows.len() * width];
        let mut lengths = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let len = row.len().min(width);
            tokens[i * width..i * width + len].copy_from_slice(&row[..len]);
            lengths.push(len);
        }
        Self {
            tokens,
            lengths,
            width,
            pad,
        }
    }

    /// Wraps rows that are already padded, with explicit valid lengths.
    pub fn from_padded(
        rows: &[Vec<u32>],
        lengths: &[usize],
        pad: u32,
    ) -> Result<Self, CriterionError> {
        if rows.len() != lengths.len() {
            return Err(CriterionError::invalid_input(format!(
                "{} target rows but {} target lengths",
                rows.len(),
                lengths.len()
            )));
        }
        let width = rows.first().map(Vec::len).unwrap_or(0);
        let mut tokens = Vec::with_capacity(rows.len() * width);
        for (row, &len) in rows.iter().zip(lengths) {
            if row.len() != width {
                return Err(CriterionError::invalid_input(format!(
                    "ragged padded targets: expected width {width}, got {}",
                    row.len()
                )));
            }
            if len > width {
                return Err(CriterionError::invalid_input(format!(
                    "target length {len} exceeds padded width {width}"
                )));
            }
            tokens.extend_from_slice(row);
        }
        Ok(Self {
            tokens,
            lengths: lengths.to_vec(),
            width,
            pad,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn pad(&self) -> u32 {
        self.pad
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn total_tokens(&self) -> usize {
        self.lengths.iter().sum()
    }

    /// Full padded row `i`.
    pub fn row(&self, i: usize) -> &[u32] {
        &self.tokens[i * self.width..(i + 1) * self.width]
    }

    /// Valid (unpadded) prefix of row `i`.
    pub fn valid(&self, i: usize) -> &[u32] {
        &self.row(i)[..self.lengths[i]]
    }

    pub fn valid_rows(&self) -> impl Iterator<Item = &[u32]> + '_ {
        (0..self.batch_size()).map(move |i| self.valid(i))
    }

    /// Concatenates the batch with a copy of itself along the batch axis.
    pub fn repeated(&self) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.extend_from_slice(&self.tokens);
        let mut lengths = self.lengths.clone();
        lengths.extend_from_slice(&self.lengths);
        Self {
            tokens,
            lengths,
            width: self.width,
            pad: self.pad,
        }
    }

    /// `(batch, width)` u32 tensor of token indices.
    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_vec(
            self.tokens.clone(),
            (self.batch_size(), self.width),
            device,
        )
    }

    /// `(batch, width)` f32 tensor with 1.0 on valid positions.
    pub fn token_mask(&self, device: &Device) -> candle_core::Result<Tensor> {
        let mask = self
            .lengths
            .iter()
            .flat_map(|&len| (0..self.width).map(move |j| if j < len { 1f32 } else { 0f32 }))
            .collect::<Vec<_>>();
        Tensor::from_vec(mask, (self.batch_size(), self.width), device)
    }
}

/// Ground truth plus its corruptions. Index 0 is always the numerator.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    entries: Vec<LabelBatch>,
}

impl CandidateSet {
    pub fn new(numerator: LabelBatch) -> Self {
        Self {
            entries: vec![numerator],
        }
    }

    pub fn push(&mut self, candidate: LabelBatch) -> Result<(), CriterionError> {
        let expected = self.numerator().batch_size();
        if candidate.batch_size() != expected {
            return Err(CriterionError::invalid_input(format!(
                "candidate batch size {} does not match numerator batch size {expected}",
                candidate.batch_size()
            )));
        }
        self.entries.push(candidate);
        Ok(())
    }

    pub fn numerator(&self) -> &LabelBatch {
        &self.entries[0]
    }

    pub fn denominators(&self) -> &[LabelBatch] {
        &self.entries[1..]
    }

    pub fn get(&self, index: usize) -> Option<&LabelBatch> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.numerator().batch_size()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabelBatch> + '_ {
        self.entries.iter()
    }
}

/// Batch record handed over by the training loop.
#[derive(Debug, Clone)]
pub struct Sample {
    pub target: LabelBatch,
    /// Explicit per-item input lengths; derived from the padding mask when absent.
    pub src_lengths: Option<Vec<usize>>,
    pub ntokens: Option<usize>,
    pub nsentences: Option<usize>,
    /// Alternative reference used for error counting at evaluation time.
    pub target_label: Option<LabelBatch>,
}

impl Sample {
    pub fn new(target: LabelBatch) -> Self {
        Self {
            target,
            src_lengths: None,
            ntokens: None,
            nsentences: None,
            target_label: None,
        }
    }
}

/// Model output consumed by the criterion.
#[derive(Debug, Clone)]
pub struct NetOutput {
    /// `(frames, batch, vocab)` normalized log-probabilities.
    pub log_probs: Tensor,
    /// `(frames, batch, features)` encoder states projected into the LM embedding space.
    pub encoder_out_kd: Option<Tensor>,
    /// `(batch, frames)` u8 mask, 1 on padded frames.
    pub padding_mask: Option<Tensor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepContext {
    pub training: bool,
    pub num_updates: u64,
}

impl StepContext {
    pub fn training(num_updates: u64) -> Self {
        Self {
            training: true,
            num_updates,
        }
    }

    pub fn evaluation() -> Self {
        Self {
            training: false,
            num_updates: 0,
        }
    }
}

#[derive(Debug)]
pub struct CriterionOutput {
    pub loss: Tensor,
    pub sample_size: usize,
    pub logging: LoggingRecord,
}

/// `(batch, frames)` f32 validity mask from a u8 padding mask (1 = pad).
pub(crate) fn frame_validity(padding_mask: &Tensor) -> candle_core::Result<Tensor> {
    padding_mask.to_dtype(DType::F32)?.affine(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAD: u32 = 1;

    #[test]
    fn from_rows_pads_to_longest() {
        let batch = LabelBatch::from_rows(&[vec![4, 5, 6], vec![7]], PAD);
        assert_eq!(batch.width(), 3);
        assert_eq!(batch.lengths(), &[3, 1]);
        assert_eq!(batch.row(1), &[7, PAD, PAD]);
        assert_eq!(batch.valid(1), &[7]);
        assert_eq!(batch.total_tokens(), 4);
    }

    #[test]
    fn from_padded_rejects_ragged_rows() {
        let err = LabelBatch::from_padded(&[vec![4, 5], vec![6]], &[2, 1], PAD).unwrap_err();
        assert!(err.to_string().contains("ragged"));
    }

    #[test]
    fn from_padded_rejects_length_past_width() {
        assert!(LabelBatch::from_padded(&[vec![4, 5]], &[3], PAD).is_err());
    }

    #[test]
    fn repeated_doubles_batch() {
        let batch = LabelBatch::from_rows(&[vec![4, 5], vec![6]], PAD);
        let doubled = batch.repeated();
        assert_eq!(doubled.batch_size(), 4);
        assert_eq!(doubled.valid(2), &[4, 5]);
        assert_eq!(doubled.valid(3), &[6]);
    }

    #[test]
    fn token_mask_marks_valid_prefix() {
        let batch = LabelBatch::from_rows(&[vec![4, 5], vec![6]], PAD);
        let mask = batch.token_mask(&Device::Cpu).unwrap();
        assert_eq!(
            mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0], vec![1.0, 0.0]]
        );
    }

    #[test]
    fn candidate_set_rejects_batch_size_mismatch() {
        let mut set = CandidateSet::new(LabelBatch::from_rows(&[vec![4], vec![5]], PAD));
        assert!(set
            .push(LabelBatch::from_rows(&[vec![4]], PAD))
            .is_err());
        set.push(LabelBatch::from_rows(&[vec![5], vec![4]], PAD))
            .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.denominators().len(), 1);
    }

    #[test]
    fn frame_validity_inverts_padding_mask() {
        let mask = Tensor::new(&[[0u8, 0, 1]], &Device::Cpu).unwrap();
        let valid = frame_validity(&mask).unwrap();
        assert_eq!(valid.to_vec2::<f32>().unwrap(), vec![vec![1.0, 1.0, 0.0]]);
    }
}
