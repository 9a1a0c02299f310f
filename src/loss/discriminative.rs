use candle_core::{DType, Tensor, D};

use crate::error::CriterionError;

/// `sum(target * (ln target - log_softmax(scores)))` over every cell, with
/// `0 * ln 0` taken as 0.
pub fn kl_divergence(scores: &Tensor, targets: &[Vec<f32>]) -> Result<Tensor, CriterionError> {
    let (batch, candidates) = scores
        .dims2()
        .map_err(|e| CriterionError::runtime("score matrix dims2", e))?;
    if targets.len() != batch || targets.iter().any(|row| row.len() != candidates) {
        return Err(CriterionError::invalid_input(format!(
            "soft labels do not match the {batch}x{candidates} score matrix"
        )));
    }

    let device = scores.device();
    let target = targets.iter().flatten().copied().collect::<Vec<_>>();
    let log_target = target
        .iter()
        .map(|&p| if p > 0.0 { p.ln() } else { 0.0 })
        .collect::<Vec<_>>();

    let compute = || -> candle_core::Result<Tensor> {
        let target = Tensor::from_vec(target, (batch, candidates), device)?;
        let log_target = Tensor::from_vec(log_target, (batch, candidates), device)?;
        let log_q = candle_nn::ops::log_softmax(&scores.to_dtype(DType::F32)?, D::Minus1)?;
        (target * (log_target - log_q)?)?.sum_all()
    };
    compute().map_err(|e| CriterionError::runtime("kl divergence", e))
}

/// Linear warm-up `min(num_updates / ramp_updates, 1)`.
pub fn ramp(num_updates: u64, ramp_updates: u64) -> f64 {
    if ramp_updates == 0 {
        return 1.0;
    }
    (num_updates as f64 / ramp_updates as f64).min(1.0)
}

/// Weights the KD divergence and adds it to the CTC loss.
#[derive(Debug, Clone, Copy)]
pub struct DiscriminativeLossAggregator {
    ramp_updates: u64,
    apply_ramp: bool,
}

impl DiscriminativeLossAggregator {
    pub fn new(ramp_updates: u64, apply_ramp: bool) -> Self {
        Self {
            ramp_updates,
            apply_ramp,
        }
    }

    /// Batch-size weight, optionally scaled by the warm-up ramp.
    pub fn alpha(&self, batch: usize, num_updates: u64) -> f64 {
        let alpha = batch as f64;
        if self.apply_ramp {
            alpha * ramp(num_updates, self.ramp_updates)
        } else {
            alpha
        }
    }

    pub fn ramp(&self, num_updates: u64) -> f64 {
        ramp(num_updates, self.ramp_updates)
    }

    pub fn combine(
        &self,
        ctc: &Tensor,
        divergence: &Tensor,
        batch: usize,
        num_updates: u64,
    ) -> Result<Tensor, CriterionError> {
        let alpha = self.alpha(batch, num_updates);
        divergence
            .affine(alpha, 0.0)
            .and_then(|kd| ctc + kd)
            .map_err(|e| CriterionError::runtime("combine ctc and kd", e))
    }
}
