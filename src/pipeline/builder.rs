use std::path::Path;
use std::sync::Arc;

use candle_core::Device;

use crate::config::CriterionConfig;
use crate::corruption::SequenceCorruptor;
use crate::error::CriterionError;
use crate::loss::{
    BatchNegativeScorer, CandidateScorer, DiscriminativeLossAggregator, SoftLabelBuilder,
};
use crate::model::MaskedLm;
use crate::pipeline::criterion::{CriterionParts, CtcSdtKdCriterion, DistillationStage};
use crate::pipeline::defaults::MonotonicAlignmentSearch;
use crate::pipeline::embedder::{SharedVocabEmbedder, SubwordEmbedder};
use crate::pipeline::traits::{AlignmentSearch, EmbedderKind, LanguageModelEmbedder, WordDecoder};
use crate::text::{Dictionary, EditDistanceScorer, PostProcess};

pub struct CriterionBuilder {
    config: CriterionConfig,
    dictionary: Dictionary,
    embedder: Option<Arc<dyn LanguageModelEmbedder>>,
    aligner: Option<Arc<dyn AlignmentSearch>>,
    word_decoder: Option<Box<dyn WordDecoder>>,
}

impl CriterionBuilder {
    pub fn new(config: CriterionConfig, dictionary: Dictionary) -> Self {
        Self {
            config,
            dictionary,
            embedder: None,
            aligner: None,
            word_decoder: None,
        }
    }

    /// Uses `embedder` instead of loading `lm_checkpoint_dir`.
    pub fn with_embedder(mut self, embedder: Arc<dyn LanguageModelEmbedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_aligner(mut self, aligner: Arc<dyn AlignmentSearch>) -> Self {
        self.aligner = Some(aligner);
        self
    }

    pub fn with_word_decoder(mut self, word_decoder: Box<dyn WordDecoder>) -> Self {
        self.word_decoder = Some(word_decoder);
        self
    }

    pub fn build(self) -> Result<CtcSdtKdCriterion, CriterionError> {
        let post_process = self.config.post_process.parse::<PostProcess>()?;
        let dictionary = Arc::new(self.dictionary);

        let embedder = match self.embedder {
            Some(embedder) => Some(embedder),
            None => load_embedder(&self.config, &dictionary)?,
        };
        if let Some(embedder) = &embedder {
            if self.config.kd.lm_resample_candidate && !embedder.shares_vocabulary() {
                return Err(CriterionError::config(
                    "lm_resample_candidate needs an LM sharing the acoustic vocabulary",
                ));
            }
        }

        if self.config.wer.is_enabled() && self.word_decoder.is_none() {
            tracing::warn!(
                kenlm_model = ?self.config.wer.kenlm_model,
                "beam decoder configured but none injected; word errors use greedy decoding"
            );
        }

        let distillation = embedder.map(|embedder| {
            let kd = &self.config.kd;
            let aligner = self
                .aligner
                .unwrap_or_else(|| Arc::new(MonotonicAlignmentSearch) as Arc<dyn AlignmentSearch>);
            DistillationStage {
                embedder,
                corruptor: SequenceCorruptor::new(
                    kd.corruptions.clone(),
                    kd.corruption_rounds,
                    dictionary.word_separator(),
                ),
                scorer: CandidateScorer::new(kd.projection, aligner),
                negatives: kd
                    .batch_negatives
                    .then(|| BatchNegativeScorer::new(kd.projection)),
                edit_distance: EditDistanceScorer::new(kd.edit_distance),
                soft_labels: SoftLabelBuilder::new(kd.soft_label),
                aggregator: DiscriminativeLossAggregator::new(kd.ramp_updates, kd.apply_ramp),
                lm_resample: kd.lm_resample_candidate,
                diagnostics_interval: kd.diagnostics_interval,
            }
        });

        Ok(CtcSdtKdCriterion::from_parts(CriterionParts {
            config: self.config,
            dictionary,
            post_process,
            distillation,
            word_decoder: self.word_decoder,
        }))
    }
}

fn select_device(name: &str) -> Result<Device, CriterionError> {
    match name {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(0).map_err(|e| CriterionError::runtime("CUDA init", e)),
        other => Err(CriterionError::config(format!(
            "unknown device {other:?}, expected \"cpu\" or \"cuda\""
        ))),
    }
}

fn check_shared_vocabulary(lm_vocab: usize, dictionary_len: usize) -> Result<(), CriterionError> {
    if lm_vocab < dictionary_len {
        return Err(CriterionError::config(format!(
            "LM vocabulary of {lm_vocab} cannot cover the {dictionary_len}-symbol acoustic dictionary"
        )));
    }
    Ok(())
}

/// Loads the frozen LM behind the configured backend; `None` without a checkpoint.
fn load_embedder(
    config: &CriterionConfig,
    dictionary: &Arc<Dictionary>,
) -> Result<Option<Arc<dyn LanguageModelEmbedder>>, CriterionError> {
    let Some(dir) = config.lm_checkpoint_dir.as_deref().filter(|d| !d.is_empty()) else {
        return Ok(None);
    };
    let dir = Path::new(dir);
    let device = select_device(&config.device)?;
    let lm = Arc::new(MaskedLm::from_checkpoint_dir(dir, &device)?);

    let embedder: Arc<dyn LanguageModelEmbedder> = match config.embedder {
        EmbedderKind::SharedVocab => {
            check_shared_vocabulary(lm.vocab_size(), dictionary.len())?;
            Arc::new(SharedVocabEmbedder::new(lm, config.lm_hidden_layer)?)
        }
        EmbedderKind::Subword => {
            let tokenizer = SubwordEmbedder::load_tokenizer(&dir.join("tokenizer.json"))?;
            Arc::new(SubwordEmbedder::new(
                lm,
                config.lm_hidden_layer,
                tokenizer,
                Arc::clone(dictionary),
            )?)
        }
    };
    tracing::info!(
        embedder = embedder.label(),
        hidden_layer = config.lm_hidden_layer,
        "sequence-discriminative distillation enabled"
    );
    Ok(Some(embedder))
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Tensor};

    use super::*;
    use crate::pipeline::traits::LmEmbedding;
    use crate::types::LabelBatch;

    struct MockEmbedder {
        shares: bool,
    }

    impl LanguageModelEmbedder for MockEmbedder {
        fn embed(&self, batch: &LabelBatch) -> Result<LmEmbedding, CriterionError> {
            let (b, t) = (batch.batch_size(), batch.width().max(1));
            let zeros = |dims: (usize, usize, usize)| {
                Tensor::zeros(dims, DType::F32, &Device::Cpu)
                    .map_err(|e| CriterionError::runtime("mock", e))
            };
            Ok(LmEmbedding {
                logits: zeros((b, t, 8))?,
                hidden: zeros((b, t, 2))?,
                token_mask: Tensor::zeros((b, t), DType::F32, &Device::Cpu)
                    .map_err(|e| CriterionError::runtime("mock", e))?,
                token_lens: vec![0; b],
            })
        }

        fn shares_vocabulary(&self) -> bool {
            self.shares
        }

        fn label(&self) -> &'static str {
            "mock"
        }
    }

    fn dictionary() -> Dictionary {
        Dictionary::from_symbols(["a", "b", "c", "|"])
    }

    #[test]
    fn build_without_lm_is_ctc_only() {
        let criterion = CriterionBuilder::new(CriterionConfig::default(), dictionary())
            .build()
            .expect("ctc-only criterion");
        assert!(!criterion.has_distillation());
    }

    #[test]
    fn build_with_injected_embedder_enables_distillation() {
        let criterion = CriterionBuilder::new(CriterionConfig::default(), dictionary())
            .with_embedder(Arc::new(MockEmbedder { shares: true }))
            .build()
            .unwrap();
        assert!(criterion.has_distillation());
    }

    #[test]
    fn build_fails_on_invalid_checkpoint_dir() {
        let config = CriterionConfig {
            lm_checkpoint_dir: Some("/nonexistent/lm".to_string()),
            ..Default::default()
        };
        let err = CriterionBuilder::new(config, dictionary()).build().err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn build_fails_on_empty_post_process() {
        let config = CriterionConfig {
            post_process: String::new(),
            ..Default::default()
        };
        let err = CriterionBuilder::new(config, dictionary()).build().err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn lm_resample_requires_shared_vocabulary() {
        let mut config = CriterionConfig::default();
        config.kd.lm_resample_candidate = true;
        let result = CriterionBuilder::new(config, dictionary())
            .with_embedder(Arc::new(MockEmbedder { shares: false }))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn unknown_device_is_config_error() {
        assert!(matches!(select_device("cpu"), Ok(Device::Cpu)));
        assert!(select_device("gpu").unwrap_err().is_config());

        let config = CriterionConfig {
            lm_checkpoint_dir: Some(std::env::temp_dir().to_string_lossy().to_string()),
            device: "gpu".to_string(),
            ..Default::default()
        };
        let err = CriterionBuilder::new(config, dictionary()).build().err().unwrap();
        assert!(err.is_config());
        assert!(err.to_string().contains("gpu"));
    }

    #[test]
    fn shared_vocabulary_must_cover_dictionary() {
        assert!(check_shared_vocabulary(8, 8).is_ok());
        assert!(check_shared_vocabulary(7, 8).unwrap_err().is_config());
    }

    #[test]
    fn checkpoint_without_weights_fails() {
        let dir = std::env::temp_dir().join("ctc_sdkd_builder_missing_weights");
        std::fs::create_dir_all(&dir).expect("create temp dir");
        std::fs::write(
            dir.join("config.json"),
            r#"{
                "hidden_size": 4,
                "num_hidden_layers": 1,
                "num_attention_heads": 2,
                "intermediate_size": 8,
                "vocab_size": 16,
                "max_position_embeddings": 16
            }"#,
        )
        .expect("write config");
        let _ = std::fs::remove_file(dir.join("model.safetensors"));

        let config = CriterionConfig {
            lm_checkpoint_dir: Some(dir.to_string_lossy().to_string()),
            ..Default::default()
        };
        let err = CriterionBuilder::new(config, dictionary()).build().err().unwrap();
        assert!(err.is_config());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
