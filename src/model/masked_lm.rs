use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

use crate::config::LanguageModelConfig;
use crate::error::CriterionError;
use crate::model::encoder::Encoder;
use crate::model::layers::{key_padding_bias, LayerNorm};

struct Embeddings {
    words: Embedding,
    positions: Embedding,
    token_type: Tensor,
    layer_norm: LayerNorm,
    pad: u32,
    max_positions: usize,
}

impl Embeddings {
    fn load(cfg: &LanguageModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden = cfg.hidden_size;
        let token_types = candle_nn::embedding(
            cfg.type_vocab_size.max(1),
            hidden,
            vb.pp("token_type_embeddings"),
        )?;
        Ok(Self {
            words: candle_nn::embedding(cfg.vocab_size, hidden, vb.pp("word_embeddings"))?,
            positions: candle_nn::embedding(
                cfg.max_position_embeddings,
                hidden,
                vb.pp("position_embeddings"),
            )?,
            token_type: token_types.embeddings().get(0)?,
            layer_norm: LayerNorm::load(hidden, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            pad: cfg.pad_token_id,
            max_positions: cfg.max_position_embeddings,
        })
    }

    /// Real tokens take positions `pad + 1, pad + 2, ...`; padding keeps `pad`.
    fn position_ids(&self, mask: &Tensor) -> candle_core::Result<Tensor> {
        let (_, tokens) = mask.dims2()?;
        let last = self.pad as usize + tokens;
        if last >= self.max_positions {
            return Err(candle_core::Error::Msg(format!(
                "sequence of {tokens} tokens exceeds {} position embeddings",
                self.max_positions
            )));
        }
        (mask.cumsum(1)? * mask)?
            .affine(1.0, self.pad as f64)?
            .to_dtype(DType::U32)
    }

    fn forward(&self, input_ids: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
        let words = self.words.forward(input_ids)?;
        let positions = self.positions.forward(&self.position_ids(mask)?)?;
        let summed = (words + positions)?.broadcast_add(&self.token_type)?;
        self.layer_norm.forward(&summed)
    }
}

/// `dense -> GELU -> layer norm -> vocabulary projection`.
struct LmHead {
    dense: Linear,
    layer_norm: LayerNorm,
    decoder: Linear,
}

impl LmHead {
    fn load(
        cfg: &LanguageModelConfig,
        word_embeddings: &Tensor,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let hidden = cfg.hidden_size;
        // Checkpoints often tie the decoder to the word embeddings.
        let decoder_weight = if vb.contains_tensor("decoder.weight") {
            vb.get((cfg.vocab_size, hidden), "decoder.weight")?
        } else {
            word_embeddings.clone()
        };
        Ok(Self {
            dense: candle_nn::linear(hidden, hidden, vb.pp("dense"))?,
            layer_norm: LayerNorm::load(hidden, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            decoder: Linear::new(decoder_weight, Some(vb.get(cfg.vocab_size, "bias")?)),
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.dense.forward(xs)?.gelu_erf()?;
        self.decoder.forward(&self.layer_norm.forward(&h)?)
    }
}

/// Output of one masked-LM pass.
#[derive(Debug, Clone)]
pub struct MaskedLmOutput {
    /// `(batch, tokens, vocab)`.
    pub logits: Tensor,
    /// Embedding output followed by every layer output, each `(batch, tokens, hidden)`.
    pub hidden_states: Vec<Tensor>,
}

/// Frozen RoBERTa-style masked language model.
pub struct MaskedLm {
    embeddings: Embeddings,
    encoder: Encoder,
    head: LmHead,
    config: LanguageModelConfig,
    device: Device,
}

impl MaskedLm {
    pub(crate) fn load(cfg: LanguageModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let device = vb.device().clone();
        let body = vb.pp("roberta");
        let embeddings = Embeddings::load(&cfg, body.pp("embeddings"))?;
        let encoder = Encoder::load(&cfg, body.pp("encoder"))?;
        let head = LmHead::load(&cfg, embeddings.words.embeddings(), vb.pp("lm_head"))?;
        Ok(Self {
            embeddings,
            encoder,
            head,
            config: cfg,
            device,
        })
    }

    /// Loads `config.json` and `model.safetensors` from a checkpoint directory.
    pub fn from_checkpoint_dir(dir: &Path, device: &Device) -> Result<Self, CriterionError> {
        if !dir.is_dir() {
            return Err(CriterionError::config(format!(
                "language model checkpoint directory {} does not exist",
                dir.display()
            )));
        }
        let cfg = LanguageModelConfig::load(&dir.join("config.json"))?;
        let weights = std::fs::read(dir.join("model.safetensors"))
            .map_err(|e| CriterionError::io("read LM safetensors", e))?;
        let vb = VarBuilder::from_buffered_safetensors(weights, DType::F32, device)
            .map_err(|e| CriterionError::config(format!("invalid LM safetensors: {e}")))?;
        let lm = Self::load(cfg, vb).map_err(|e| {
            CriterionError::config(format!("LM weights do not match config.json: {e}"))
        })?;

        tracing::info!(
            hidden_size = lm.config.hidden_size,
            layers = lm.config.num_hidden_layers,
            vocab = lm.config.vocab_size,
            device = ?lm.device,
            "frozen masked LM loaded"
        );
        Ok(lm)
    }

    pub(crate) fn config(&self) -> &LanguageModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    pub fn pad_token_id(&self) -> u32 {
        self.config.pad_token_id
    }

    /// `input_ids` is `(batch, tokens)` u32, `mask` is `(batch, tokens)` f32 with
    /// 1.0 on real tokens. Outputs are detached from any gradient graph.
    pub fn forward(&self, input_ids: &Tensor, mask: &Tensor) -> candle_core::Result<MaskedLmOutput> {
        let mask = mask.to_dtype(DType::F32)?;
        let embedded = self.embeddings.forward(input_ids, &mask)?;
        let bias = key_padding_bias(&mask)?;
        let hidden_states = self
            .encoder
            .forward(embedded, &bias)?
            .into_iter()
            .map(|state| state.detach())
            .collect::<Vec<_>>();
        let last = hidden_states
            .last()
            .ok_or_else(|| candle_core::Error::Msg("masked LM produced no states".to_string()))?;
        let logits = self.head.forward(last)?.detach();
        Ok(MaskedLmOutput {
            logits,
            hidden_states,
        })
    }
}
