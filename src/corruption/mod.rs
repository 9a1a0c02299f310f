use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;

use crate::error::CriterionError;
use crate::types::{CandidateSet, LabelBatch};


/// Structured corruption applied to one label sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Corruption {
    /// Shuffle a contiguous span of word units.
    Swap,
    /// Remove a contiguous span of tokens.
    Delete,
    /// Repeat one token up to `max_len` extra times.
    Insert { max_len: usize },
}

impl Corruption {
    pub const DEFAULT_MAX_INSERT_LEN: usize = 4;

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::Swap,
            Self::Delete,
            Self::Insert {
                max_len: Self::DEFAULT_MAX_INSERT_LEN,
            },
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Swap => "swap",
            Self::Delete => "delete",
            Self::Insert { .. } => "insert",
        }
    }

    /// Columns added to the padded width so the worst case still fits.
    pub fn extra_width(self) -> usize {
        match self {
            Self::Insert { max_len } => max_len,
            Self::Swap | Self::Delete => 0,
        }
    }

    /// Corrupts the valid tokens of one sequence. Too-short inputs come back unchanged.
    pub fn apply<R: Rng + ?Sized>(
        self,
        tokens: &[u32],
        separator: Option<u32>,
        rng: &mut R,
    ) -> Vec<u32> {
        match self {
            Self::Swap => swap_segments(tokens, separator, rng),
            Self::Delete => delete_span(tokens, rng),
            Self::Insert { max_len } => insert_repetition(tokens, max_len, rng),
        }
    }
}

/// Shuffles a span of 2..=units/2 word units; sequences with fewer than four units are kept.
pub fn swap_segments<R: Rng + ?Sized>(
    tokens: &[u32],
    separator: Option<u32>,
    rng: &mut R,
) -> Vec<u32> {
    let Some(sep) = separator else {
        return tokens.to_vec();
    };
    let mut units = tokens.split(|&t| t == sep).collect::<Vec<_>>();
    let n = units.len();
    if n < 4 {
        return tokens.to_vec();
    }

    let span = rng.gen_range(2..=n / 2);
    let start = rng.gen_range(0..=n - span);
    units[start..start + span].shuffle(rng);

    let mut out = Vec::with_capacity(tokens.len());
    for (i, unit) in units.iter().enumerate() {
        if i > 0 {
            out.push(sep);
        }
        out.extend_from_slice(unit);
    }
    out
}

/// Removes 1..=len/2 tokens starting inside the sequence.
pub fn delete_span<R: Rng + ?Sized>(tokens: &[u32], rng: &mut R) -> Vec<u32> {
    let len = tokens.len();
    if len < 2 {
        return tokens.to_vec();
    }
    let del = rng.gen_range(1..=len / 2);
    let start = rng.gen_range(0..len - del);
    let mut out = Vec::with_capacity(len - del);
    out.extend_from_slice(&tokens[..start]);
    out.extend_from_slice(&tokens[start + del..]);
    out
}

/// Repeats the token at a random offset 1..=max_len extra times.
pub fn insert_repetition<R: Rng + ?Sized>(tokens: &[u32], max_len: usize, rng: &mut R) -> Vec<u32> {
    let len = tokens.len();
    if max_len == 0 {
        return tokens.to_vec();
    }
    let ins = rng.gen_range(1..=max_len);
    if len <= ins {
        return tokens.to_vec();
    }
    let start = rng.gen_range(0..len - ins);
    let mut out = Vec::with_capacity(len + ins);
    out.extend_from_slice(&tokens[..start]);
    out.extend(std::iter::repeat(tokens[start]).take(ins));
    out.extend_from_slice(&tokens[start..]);
    out
}

/// Builds the candidate set: the ground truth followed by `rounds` passes
/// over the configured corruptions.
#[derive(Debug, Clone)]
pub struct SequenceCorruptor {
    corruptions: Vec<Corruption>,
    rounds: usize,
    separator: Option<u32>,
}

impl SequenceCorruptor {
    pub fn new(corruptions: Vec<Corruption>, rounds: usize, separator: Option<u32>) -> Self {
        Self {
            corruptions,
            rounds,
            separator,
        }
    }

    pub fn corruptions(&self) -> &[Corruption] {
        &self.corruptions
    }

    pub fn num_candidates(&self) -> usize {
        1 + self.rounds * self.corruptions.len()
    }

    /// Applies one corruption to every batch item independently.
    pub fn corrupt_batch<R: Rng + ?Sized>(
        &self,
        corruption: Corruption,
        batch: &LabelBatch,
        rng: &mut R,
    ) -> LabelBatch {
        let rows = batch
            .valid_rows()
            .map(|row| corruption.apply(row, self.separator, rng))
            .collect::<Vec<_>>();
        LabelBatch::from_rows_with_width(&rows, batch.pad(), batch.width() + corruption.extra_width())
    }

    pub fn candidates<R: Rng + ?Sized>(
        &self,
        target: &LabelBatch,
        rng: &mut R,
    ) -> Result<CandidateSet, CriterionError> {
        let mut set = CandidateSet::new(target.clone());
        for _ in 0..self.rounds {
            for &corruption in &self.corruptions {
                set.push(self.corrupt_batch(corruption, target, rng))?;
            }
        }
        Ok(set)
    }
}
