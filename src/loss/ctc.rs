use candle_core::{DType, Tensor};

use crate::error::CriterionError;
use crate::types::LabelBatch;

/// Finite stand-in for log(0); keeps the recursion free of inf - inf.
const NEG: f32 = -1e30;
/// Per-item losses at or above this are impossible alignments.
const INFEASIBLE: f32 = 1e29;

/// Connectionist temporal classification loss over `(frames, batch, vocab)`
/// log-probabilities, returned per item.
#[derive(Debug, Clone, Copy)]
pub struct CtcLoss {
    blank: u32,
    zero_infinity: bool,
}

impl CtcLoss {
    pub fn new(blank: u32, zero_infinity: bool) -> Self {
        Self {
            blank,
            zero_infinity,
        }
    }

    pub fn blank(&self) -> u32 {
        self.blank
    }

    /// `(batch,)` negative log-likelihoods. Items whose input is too short
    /// for their target get `+inf`, or `0` with `zero_infinity`.
    pub fn forward(
        &self,
        log_probs: &Tensor,
        targets: &LabelBatch,
        input_lengths: &[usize],
    ) -> Result<Tensor, CriterionError> {
        let (frames, batch, vocab) = log_probs
            .dims3()
            .map_err(|e| CriterionError::runtime("ctc log_probs dims3", e))?;
        if targets.batch_size() != batch || input_lengths.len() != batch {
            return Err(CriterionError::invalid_input(format!(
                "ctc batch mismatch: log_probs {batch}, targets {}, input lengths {}",
                targets.batch_size(),
                input_lengths.len()
            )));
        }
        if let Some(&len) = input_lengths.iter().find(|&&len| len > frames) {
            return Err(CriterionError::invalid_input(format!(
                "input length {len} exceeds {frames} frames"
            )));
        }
        if (self.blank as usize) >= vocab {
            return Err(CriterionError::invalid_input(format!(
                "blank index {} outside vocabulary of {vocab}",
                self.blank
            )));
        }
        for row in targets.valid_rows() {
            if let Some(&tok) = row.iter().find(|&&t| t as usize >= vocab) {
                return Err(CriterionError::invalid_input(format!(
                    "target token {tok} outside vocabulary of {vocab}"
                )));
            }
        }

        self.compute(log_probs, targets, input_lengths)
            .map_err(|e| CriterionError::runtime("ctc forward", e))
    }

    fn compute(
        &self,
        log_probs: &Tensor,
        targets: &LabelBatch,
        input_lengths: &[usize],
    ) -> candle_core::Result<Tensor> {
        let device = log_probs.device();
        let log_probs = log_probs.to_dtype(DType::F32)?;
        let (frames, batch, _) = log_probs.dims3()?;
        let states = 2 * targets.width() + 1;

        let (ext, skip) = self.extended_labels(targets, states);
        let ext = Tensor::from_vec(ext, (batch, states), device)?;
        let skip = Tensor::from_vec(skip, (batch, states), device)?;

        let lengths = targets.lengths();
        let loss = if frames == 0 {
            Tensor::zeros(batch, DType::F32, device)?
        } else {
            let init = (0..batch)
                .flat_map(|_| (0..states).map(|s| if s < 2 { 0f32 } else { NEG }))
                .collect::<Vec<_>>();
            let init = Tensor::from_vec(init, (batch, states), device)?;
            let mut alpha = (log_probs.get(0)?.gather(&ext, 1)? + init)?;

            for t in 1..frames {
                let emit = log_probs.get(t)?.gather(&ext, 1)?;
                let stay = alpha.clone();
                let step = shift_right(&alpha, 1)?;
                let skip_step = (shift_right(&alpha, 2)? + &skip)?;
                let next = (logsumexp0(&Tensor::stack(&[stay, step, skip_step], 0)?)? + emit)?;

                let active = input_lengths
                    .iter()
                    .map(|&len| if t < len { 1f32 } else { 0f32 })
                    .collect::<Vec<_>>();
                let active = Tensor::from_vec(active, (batch, 1), device)?;
                let keep = active.affine(-1.0, 1.0)?;
                alpha = (next.broadcast_mul(&active)? + alpha.broadcast_mul(&keep)?)?;
            }

            let last = lengths.iter().map(|&l| (2 * l) as u32).collect::<Vec<_>>();
            let prev = lengths
                .iter()
                .map(|&l| (2 * l).saturating_sub(1) as u32)
                .collect::<Vec<_>>();
            let prev_bias = lengths
                .iter()
                .map(|&l| if l == 0 { NEG } else { 0f32 })
                .collect::<Vec<_>>();
            let last = alpha.gather(&Tensor::from_vec(last, (batch, 1), device)?, 1)?;
            let prev = (alpha.gather(&Tensor::from_vec(prev, (batch, 1), device)?, 1)?
                + Tensor::from_vec(prev_bias, (batch, 1), device)?)?;
            logsumexp0(&Tensor::stack(&[last, prev], 0)?)?
                .squeeze(1)?
                .neg()?
        };

        // Zero-frame inputs only admit the empty target.
        let empty_input = input_lengths
            .iter()
            .zip(lengths)
            .map(|(&n, &l)| match (n, l) {
                (0, 0) => 0f32,
                (0, _) => f32::INFINITY,
                _ => f32::NAN,
            })
            .collect::<Vec<_>>();
        let has_override = empty_input.iter().map(|v| u8::from(!v.is_nan())).collect::<Vec<_>>();
        let override_value = empty_input
            .iter()
            .map(|v| if v.is_nan() { 0f32 } else { *v })
            .collect::<Vec<_>>();
        let loss = Tensor::from_vec(has_override, batch, device)?.where_cond(
            &Tensor::from_vec(override_value, batch, device)?,
            &loss,
        )?;

        let infeasible = loss.ge(INFEASIBLE)?;
        let fallback = if self.zero_infinity {
            Tensor::zeros(batch, DType::F32, device)?
        } else {
            Tensor::full(f32::INFINITY, batch, device)?
        };
        infeasible.where_cond(&fallback, &loss)
    }

    /// Blank-interleaved labels and the additive mask allowing the `s - 2` skip.
    fn extended_labels(&self, targets: &LabelBatch, states: usize) -> (Vec<u32>, Vec<f32>) {
        let batch = targets.batch_size();
        let mut ext = vec![self.blank; batch * states];
        let mut skip = vec![NEG; batch * states];
        for b in 0..batch {
            let row = targets.valid(b);
            let base = b * states;
            for (i, &tok) in row.iter().enumerate() {
                let s = 2 * i + 1;
                ext[base + s] = tok;
                if i > 0 && row[i - 1] != tok {
                    skip[base + s] = 0.0;
                }
            }
        }
        (ext, skip)
    }
}

/// Shifts `(batch, states)` right by `by` along the state axis, filling with `NEG`.
fn shift_right(alpha: &Tensor, by: usize) -> candle_core::Result<Tensor> {
    let (batch, states) = alpha.dims2()?;
    let fill = Tensor::full(NEG, (batch, by.min(states)), alpha.device())?;
    if by >= states {
        return Ok(fill);
    }
    Tensor::cat(&[&fill, &alpha.narrow(1, 0, states - by)?], 1)
}

fn logsumexp0(xs: &Tensor) -> candle_core::Result<Tensor> {
    let max = xs.max_keepdim(0)?;
    let summed = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(0)?.log()?;
    (summed + max)?.squeeze(0)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    const BLANK: u32 = 0;
    const PAD: u32 = 1;

    /// `(frames, batch, vocab)` tensor from host log-probabilities laid out `[batch][frame][vocab]`.
    fn log_probs_tensor(items: &[Vec<Vec<f32>>], device: &Device) -> candle_core::Result<Tensor> {
        let batch = items.len();
        let frames = items.first().map(Vec::len).unwrap_or(0);
        let vocab = items
            .first()
            .and_then(|item| item.first())
            .map(Vec::len)
            .unwrap_or(0);
        let flat = items
            .iter()
            .flat_map(|item| item.iter().flat_map(|frame| frame.iter().copied()))
            .collect::<Vec<_>>();
        Tensor::from_vec(flat, (batch, frames, vocab), device)?.transpose(0, 1)?.contiguous()
    }

    fn uniform(frames: usize, batch: usize, vocab: usize) -> Tensor {
        Tensor::full((1.0 / vocab as f32).ln(), (frames, batch, vocab), &Device::Cpu).unwrap()
    }

    fn collapse(path: &[u32]) -> Vec<u32> {
        let mut out = Vec::new();
        let mut prev = None;
        for &p in path {
            if Some(p) != prev && p != BLANK {
                out.push(p);
            }
            prev = Some(p);
        }
        out
    }

    /// Sums the probability of every frame path that collapses to `target`.
    fn brute_force(log_probs: &[Vec<f32>], target: &[u32]) -> f32 {
        let frames = log_probs.len();
        let vocab = log_probs[0].len();
        let mut total = 0f64;
        let mut path = vec![0u32; frames];
        for code in 0..vocab.pow(frames as u32) {
            let mut c = code;
            for slot in path.iter_mut() {
                *slot = (c % vocab) as u32;
                c /= vocab;
            }
            if collapse(&path) == target {
                let lp = path
                    .iter()
                    .enumerate()
                    .map(|(t, &v)| log_probs[t][v as usize] as f64)
                    .sum::<f64>();
                total += lp.exp();
            }
        }
        -(total.ln() as f32)
    }

    #[test]
    fn single_label_over_two_uniform_frames() {
        let ctc = CtcLoss::new(BLANK, false);
        let targets = LabelBatch::from_rows(&[vec![1]], PAD);
        let loss = ctc.forward(&uniform(2, 1, 2), &targets, &[2]).unwrap();
        let value = loss.to_vec1::<f32>().unwrap()[0];
        assert!((value - (-(0.75f32).ln())).abs() < 1e-5, "{value}");
    }

    #[test]
    fn matches_path_enumeration() {
        let mut rng = StdRng::seed_from_u64(7);
        let ctc = CtcLoss::new(BLANK, false);
        for _ in 0..20 {
            let frames = rng.gen_range(1..=5);
            let vocab = 3;
            let target_len = rng.gen_range(0..=2);
            let target = (0..target_len)
                .map(|_| rng.gen_range(1..vocab as u32))
                .collect::<Vec<_>>();
            let lp = (0..frames)
                .map(|_| {
                    let raw = (0..vocab).map(|_| rng.gen_range(-3.0f32..0.0)).collect::<Vec<_>>();
                    let norm = raw.iter().map(|v| v.exp()).sum::<f32>().ln();
                    raw.into_iter().map(|v| v - norm).collect::<Vec<_>>()
                })
                .collect::<Vec<_>>();
            let expected = brute_force(&lp, &target);
            let tensor = log_probs_tensor(&[lp.clone()], &Device::Cpu).unwrap();
            let targets = LabelBatch::from_rows(&[target.clone()], PAD);
            let got = ctc.forward(&tensor, &targets, &[frames]).unwrap().to_vec1::<f32>().unwrap()[0];
            if expected.is_infinite() {
                assert!(got.is_infinite(), "{target:?} over {frames}: {got}");
            } else {
                assert!((got - expected).abs() < 1e-3, "{target:?}: {got} vs {expected}");
            }
        }
    }

    #[test]
    fn impossible_alignment_is_infinite_or_zeroed() {
        let targets = LabelBatch::from_rows(&[vec![1, 1]], PAD);
        let lp = uniform(1, 1, 2);
        let loss = CtcLoss::new(BLANK, false).forward(&lp, &targets, &[1]).unwrap();
        assert!(loss.to_vec1::<f32>().unwrap()[0].is_infinite());
        let zeroed = CtcLoss::new(BLANK, true).forward(&lp, &targets, &[1]).unwrap();
        assert_eq!(zeroed.to_vec1::<f32>().unwrap(), vec![0.0]);
    }

    #[test]
    fn frames_past_input_length_are_ignored() {
        let ctc = CtcLoss::new(BLANK, false);
        let targets = LabelBatch::from_rows(&[vec![1], vec![1]], PAD);
        let loss = ctc.forward(&uniform(4, 2, 2), &targets, &[2, 4]).unwrap();
        let values = loss.to_vec1::<f32>().unwrap();
        let short = ctc
            .forward(&uniform(2, 1, 2), &LabelBatch::from_rows(&[vec![1]], PAD), &[2])
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        assert!((values[0] - short).abs() < 1e-5);
        assert!(values[1] > values[0]);
    }

    #[test]
    fn empty_target_scores_all_blank_path() {
        let ctc = CtcLoss::new(BLANK, false);
        let targets = LabelBatch::from_rows(&[vec![]], PAD);
        let loss = ctc.forward(&uniform(3, 1, 2), &targets, &[3]).unwrap();
        let value = loss.to_vec1::<f32>().unwrap()[0];
        assert!((value - 3.0 * 2f32.ln()).abs() < 1e-5);
        let none = ctc.forward(&uniform(3, 1, 2), &targets, &[0]).unwrap();
        assert_eq!(none.to_vec1::<f32>().unwrap(), vec![0.0]);
    }

    #[test]
    fn rejects_length_mismatch() {
        let ctc = CtcLoss::new(BLANK, false);
        let targets = LabelBatch::from_rows(&[vec![1]], PAD);
        assert!(ctc.forward(&uniform(2, 1, 2), &targets, &[3]).is_err());
        assert!(ctc.forward(&uniform(2, 2, 2), &targets, &[2, 2]).is_err());
    }
}
