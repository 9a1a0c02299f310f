use std::path::Path;

use serde::Deserialize;

use crate::corruption::Corruption;
use crate::error::CriterionError;
use crate::loss::scoring::ProjectionAxis;
use crate::loss::soft_label::SoftLabelPolicy;
use crate::pipeline::traits::EmbedderKind;
use crate::text::EditDistanceMode;

/// Options recognized by the CTC + sequence-discriminative KD criterion.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CriterionConfig {
    /// Zero infinite CTC losses instead of propagating them.
    pub zero_infinity: bool,
    /// Normalize by sentences instead of tokens.
    pub sentence_avg: bool,
    pub post_process: String,
    /// Directory holding `config.json` and `model.safetensors` of the frozen LM.
    pub lm_checkpoint_dir: Option<String>,
    pub embedder: EmbedderKind,
    /// Inner-state index, negative values count from the last layer.
    pub lm_hidden_layer: isize,
    pub device: String,
    pub rdrop_alpha: f64,
    pub wer: WerDecoderConfig,
    pub kd: KdConfig,
}

impl CriterionConfig {
    pub const DEFAULT_LM_HIDDEN_LAYER: isize = -9;

    pub fn load(path: &Path) -> Result<Self, CriterionError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| CriterionError::io("read criterion config", e))?;
        serde_json::from_str(&data).map_err(|e| CriterionError::json("parse criterion config", e))
    }
}

impl Default for CriterionConfig {
    fn default() -> Self {
        Self {
            zero_infinity: false,
            sentence_avg: false,
            post_process: "letter".to_string(),
            lm_checkpoint_dir: None,
            embedder: EmbedderKind::SharedVocab,
            lm_hidden_layer: Self::DEFAULT_LM_HIDDEN_LAYER,
            device: "cpu".to_string(),
            rdrop_alpha: 0.0,
            wer: WerDecoderConfig::default(),
            kd: KdConfig::default(),
        }
    }
}

/// External beam decoder settings, only used for evaluation word errors.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WerDecoderConfig {
    pub kenlm_model: Option<String>,
    pub lexicon: Option<String>,
    pub lm_weight: f64,
    pub word_score: f64,
    pub sil_weight: f64,
}

impl WerDecoderConfig {
    pub fn is_enabled(&self) -> bool {
        self.kenlm_model.as_deref().is_some_and(|p| !p.is_empty())
    }
}

impl Default for WerDecoderConfig {
    fn default() -> Self {
        Self {
            kenlm_model: None,
            lexicon: None,
            lm_weight: 2.0,
            word_score: -1.0,
            sil_weight: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KdConfig {
    pub corruptions: Vec<Corruption>,
    pub corruption_rounds: usize,
    pub edit_distance: EditDistanceMode,
    pub soft_label: SoftLabelPolicy,
    pub projection: ProjectionAxis,
    /// Score every item against the other items' references as extra negatives.
    pub batch_negatives: bool,
    /// Append an arg-max LM reconstruction of a random candidate.
    pub lm_resample_candidate: bool,
    pub ramp_updates: u64,
    /// Multiply the KD weight by the warm-up ramp.
    pub apply_ramp: bool,
    /// Log diagnostics on every n-th update; 0 disables them.
    pub diagnostics_interval: u64,
}

impl KdConfig {
    pub const DEFAULT_RAMP_UPDATES: u64 = 6000;
    pub const DEFAULT_DIAGNOSTICS_INTERVAL: u64 = 3000;
}

impl Default for KdConfig {
    fn default() -> Self {
        Self {
            corruptions: Corruption::defaults(),
            corruption_rounds: 1,
            edit_distance: EditDistanceMode::Normalized,
            soft_label: SoftLabelPolicy::default(),
            projection: ProjectionAxis::Mas,
            batch_negatives: false,
            lm_resample_candidate: false,
            ramp_updates: Self::DEFAULT_RAMP_UPDATES,
            apply_ramp: false,
            diagnostics_interval: Self::DEFAULT_DIAGNOSTICS_INTERVAL,
        }
    }
}

/// RoBERTa-style hyper-parameters from the LM checkpoint's `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LanguageModelConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
}

fn default_eps() -> f64 {
    1e-5
}
fn default_pad_token_id() -> u32 {
    1
}
fn default_type_vocab_size() -> usize {
    1
}

impl LanguageModelConfig {
    pub(crate) fn load(path: &Path) -> Result<Self, CriterionError> {
        let data =
            std::fs::read_to_string(path).map_err(|e| CriterionError::io("read LM config.json", e))?;
        serde_json::from_str(&data).map_err(|e| CriterionError::json("parse LM config.json", e))
    }

    pub(crate) fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads.max(1)
    }

    /// Resolves an inner-state index; state 0 is the embedding output.
    pub(crate) fn resolve_hidden_layer(&self, index: isize) -> Option<usize> {
        let states = self.num_hidden_layers as isize + 1;
        let resolved = if index < 0 { states + index } else { index };
        (0..states).contains(&resolved).then_some(resolved as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_LM_CONFIG_JSON: &str = r#"{
        "hidden_size": 8,
        "num_hidden_layers": 12,
        "num_attention_heads": 2,
        "intermediate_size": 16,
        "vocab_size": 12,
        "max_position_embeddings": 64
    }"#;

    #[test]
    fn criterion_config_defaults() {
        let config = CriterionConfig::default();
        assert!(!config.zero_infinity);
        assert_eq!(config.post_process, "letter");
        assert_eq!(config.lm_hidden_layer, -9);
        assert_eq!(config.device, "cpu");
        assert_eq!(config.kd.corruptions.len(), 3);
        assert_eq!(config.kd.ramp_updates, 6000);
        assert_eq!(config.wer.lm_weight, 2.0);
        assert!(!config.wer.is_enabled());
    }

    #[test]
    fn criterion_config_partial_json_keeps_defaults() {
        let config: CriterionConfig = serde_json::from_str(
            r#"{
                "zero_infinity": true,
                "embedder": "subword",
                "kd": {
                    "corruptions": [{"kind": "delete"}],
                    "soft_label": {"policy": "linear"},
                    "projection": "text"
                }
            }"#,
        )
        .expect("valid config json");
        assert!(config.zero_infinity);
        assert_eq!(config.embedder, EmbedderKind::Subword);
        assert_eq!(config.kd.corruptions, vec![Corruption::Delete]);
        assert_eq!(config.kd.soft_label, SoftLabelPolicy::Linear);
        assert_eq!(config.kd.projection, ProjectionAxis::Text);
        assert_eq!(config.kd.corruption_rounds, 1);
        assert_eq!(config.post_process, "letter");
    }

    #[test]
    fn wer_decoder_enabled_only_with_model_path() {
        let mut wer = WerDecoderConfig::default();
        wer.kenlm_model = Some(String::new());
        assert!(!wer.is_enabled());
        wer.kenlm_model = Some("lm.bin".to_string());
        assert!(wer.is_enabled());
    }

    #[test]
    fn lm_config_resolves_negative_layers() {
        let cfg: LanguageModelConfig =
            serde_json::from_str(MINIMAL_LM_CONFIG_JSON).expect("valid LM config");
        assert_eq!(cfg.pad_token_id, 1);
        assert_eq!(cfg.resolve_hidden_layer(-1), Some(12));
        assert_eq!(cfg.resolve_hidden_layer(-9), Some(4));
        assert_eq!(cfg.resolve_hidden_layer(0), Some(0));
        assert_eq!(cfg.resolve_hidden_layer(-13), Some(0));
        assert_eq!(cfg.resolve_hidden_layer(-14), None);
        assert_eq!(cfg.resolve_hidden_layer(13), None);
    }

    #[test]
    fn load_fails_on_missing_file() {
        assert!(CriterionConfig::load(Path::new("/nonexistent/criterion.json")).is_err());
        assert!(LanguageModelConfig::load(Path::new("/nonexistent/config.json")).is_err());
    }
}
