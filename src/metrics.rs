use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Per-step counters; summable across workers before reduction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingRecord {
    pub loss: f64,
    pub ntokens: u64,
    pub nsentences: u64,
    pub sample_size: u64,
    /// Unit (token) edit distance of greedy hypotheses.
    pub c_errors: u64,
    pub c_total: u64,
    /// Word errors, from the beam decoder when one is configured.
    pub w_errors: u64,
    /// Word errors of the greedy hypotheses.
    pub wv_errors: u64,
    pub w_total: u64,
}

impl Add for LoggingRecord {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl AddAssign for LoggingRecord {
    fn add_assign(&mut self, rhs: Self) {
        self.loss += rhs.loss;
        self.ntokens += rhs.ntokens;
        self.nsentences += rhs.nsentences;
        self.sample_size += rhs.sample_size;
        self.c_errors += rhs.c_errors;
        self.c_total += rhs.c_total;
        self.w_errors += rhs.w_errors;
        self.wv_errors += rhs.wv_errors;
        self.w_total += rhs.w_total;
    }
}

impl Sum for LoggingRecord {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl<'a> Sum<&'a LoggingRecord> for LoggingRecord {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// Corpus-level view of summed logging records. Rates are percentages and
/// NaN when their denominator is zero.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReducedMetrics {
    /// Loss per sample-size unit, in bits.
    pub loss: f64,
    /// Loss per token in bits, when sample size is not counted in tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nll_loss: Option<f64>,
    pub ntokens: u64,
    pub nsentences: u64,
    pub sample_size: u64,
    pub uer: f64,
    pub wer: f64,
    pub raw_wer: f64,
}

/// Partial records may be summed on each worker before [`reduce_metrics`].
pub const fn logging_outputs_can_be_summed() -> bool {
    true
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn ratio(numerator: f64, denominator: u64, scale: f64) -> f64 {
    if denominator == 0 {
        return f64::NAN;
    }
    round3(numerator * scale / denominator as f64)
}

pub fn reduce_metrics(records: &[LoggingRecord]) -> ReducedMetrics {
    let total: LoggingRecord = records.iter().sum();
    let bits = 1.0 / std::f64::consts::LN_2;
    ReducedMetrics {
        loss: ratio(total.loss, total.sample_size, bits),
        nll_loss: (total.sample_size != total.ntokens)
            .then(|| ratio(total.loss, total.ntokens, bits)),
        ntokens: total.ntokens,
        nsentences: total.nsentences,
        sample_size: total.sample_size,
        uer: ratio(total.c_errors as f64, total.c_total, 100.0),
        wer: ratio(total.w_errors as f64, total.w_total, 100.0),
        raw_wer: ratio(total.wv_errors as f64, total.w_total, 100.0),
    }
}

/// Arg-max path with repeats collapsed and blanks removed.
pub fn greedy_ctc_decode(log_probs: &[Vec<f32>], blank: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut prev = None;
    for frame in log_probs {
        let best = frame
            .iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |acc, (i, &v)| {
                if v > acc.1 {
                    (i, v)
                } else {
                    acc
                }
            })
            .0 as u32;
        if prev != Some(best) && best != blank {
            out.push(best);
        }
        prev = Some(best);
    }
    out
}
