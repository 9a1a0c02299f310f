use serde::Deserialize;

/// Turns edit distances into a target distribution over candidates.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SoftLabelPolicy {
    /// `softmax(-distance * (1 + temperature))`.
    Softmax {
        #[serde(default = "default_temperature")]
        temperature: f32,
    },
    /// `(max - distance) / sum(max - distance)`.
    Linear,
}

pub const DEFAULT_TEMPERATURE: f32 = 1.5;

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

impl Default for SoftLabelPolicy {
    fn default() -> Self {
        Self::Softmax {
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SoftLabelBuilder {
    policy: SoftLabelPolicy,
}

impl SoftLabelBuilder {
    pub fn new(policy: SoftLabelPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> SoftLabelPolicy {
        self.policy
    }

    pub fn row(&self, distances: &[f32]) -> Vec<f32> {
        if distances.is_empty() {
            return Vec::new();
        }
        match self.policy {
            SoftLabelPolicy::Softmax { temperature } => {
                let logits = distances
                    .iter()
                    .map(|&d| -d * (1.0 + temperature))
                    .collect::<Vec<_>>();
                let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let exps = logits.iter().map(|&l| (l - max).exp()).collect::<Vec<_>>();
                let sum = exps.iter().sum::<f32>();
                exps.into_iter().map(|e| e / sum).collect()
            }
            SoftLabelPolicy::Linear => {
                let max = distances.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let gaps = distances.iter().map(|&d| max - d).collect::<Vec<_>>();
                let sum = gaps.iter().sum::<f32>();
                if sum <= 0.0 {
                    // all candidates equally distant
                    let uniform = 1.0 / distances.len() as f32;
                    return vec![uniform; distances.len()];
                }
                gaps.into_iter().map(|g| g / sum).collect()
            }
        }
    }

    /// `(batch, candidates)` target distribution.
    pub fn build(&self, distances: &[Vec<f32>]) -> Vec<Vec<f32>> {
        distances.iter().map(|row| self.row(row)).collect()
    }
}
