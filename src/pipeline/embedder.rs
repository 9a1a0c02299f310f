use std::path::Path;
use std::sync::Arc;

use tokenizers::Tokenizer;

use crate::error::CriterionError;
use crate::model::MaskedLm;
use crate::pipeline::traits::{LanguageModelEmbedder, LmEmbedding};
use crate::text::Dictionary;
use crate::types::LabelBatch;

fn resolve_layer(lm: &MaskedLm, hidden_layer: isize) -> Result<usize, CriterionError> {
    lm.config().resolve_hidden_layer(hidden_layer).ok_or_else(|| {
        CriterionError::config(format!(
            "hidden layer {hidden_layer} out of range for a {}-layer language model",
            lm.config().num_hidden_layers
        ))
    })
}

/// Runs the LM over `batch` and keeps the logits and one inner state.
fn run_lm(lm: &MaskedLm, layer: usize, batch: &LabelBatch) -> Result<LmEmbedding, CriterionError> {
    // The encoder needs at least one position.
    let widened;
    let batch = if batch.width() == 0 {
        widened = LabelBatch::from_rows_with_width(&vec![Vec::new(); batch.batch_size()], batch.pad(), 1);
        &widened
    } else {
        batch
    };

    let device = lm.device();
    let ids = batch
        .to_tensor(device)
        .map_err(|e| CriterionError::runtime("LM input ids", e))?;
    let token_mask = batch
        .token_mask(device)
        .map_err(|e| CriterionError::runtime("LM token mask", e))?;
    let out = lm
        .forward(&ids, &token_mask)
        .map_err(|e| CriterionError::runtime("LM forward", e))?;
    let hidden = out.hidden_states.get(layer).cloned().ok_or_else(|| {
        CriterionError::runtime("LM hidden state", format!("no inner state {layer}"))
    })?;
    Ok(LmEmbedding {
        logits: out.logits,
        hidden,
        token_mask,
        token_lens: batch.lengths().to_vec(),
    })
}

/// Feeds acoustic token indices straight into an LM sharing that vocabulary.
pub struct SharedVocabEmbedder {
    lm: Arc<MaskedLm>,
    layer: usize,
}

impl SharedVocabEmbedder {
    pub fn new(lm: Arc<MaskedLm>, hidden_layer: isize) -> Result<Self, CriterionError> {
        let layer = resolve_layer(&lm, hidden_layer)?;
        Ok(Self { lm, layer })
    }
}

impl LanguageModelEmbedder for SharedVocabEmbedder {
    fn embed(&self, batch: &LabelBatch) -> Result<LmEmbedding, CriterionError> {
        run_lm(&self.lm, self.layer, batch)
    }

    fn shares_vocabulary(&self) -> bool {
        true
    }

    fn label(&self) -> &'static str {
        "shared-vocab"
    }
}

/// Detokenizes candidates and re-encodes them in the LM's subword vocabulary.
pub struct SubwordEmbedder {
    lm: Arc<MaskedLm>,
    layer: usize,
    tokenizer: Tokenizer,
    dictionary: Arc<Dictionary>,
}

impl SubwordEmbedder {
    pub fn new(
        lm: Arc<MaskedLm>,
        hidden_layer: isize,
        tokenizer: Tokenizer,
        dictionary: Arc<Dictionary>,
    ) -> Result<Self, CriterionError> {
        let layer = resolve_layer(&lm, hidden_layer)?;
        Ok(Self {
            lm,
            layer,
            tokenizer,
            dictionary,
        })
    }

    pub fn load_tokenizer(path: &Path) -> Result<Tokenizer, CriterionError> {
        Tokenizer::from_file(path).map_err(|e| {
            CriterionError::config(format!("cannot load tokenizer {}: {e}", path.display()))
        })
    }

    /// Re-tokenized batch, padded with the LM's pad id.
    pub fn retokenize(&self, batch: &LabelBatch) -> Result<LabelBatch, CriterionError> {
        let texts = batch
            .valid_rows()
            .map(|row| self.dictionary.to_text(row))
            .collect::<Vec<_>>();
        let encodings = self
            .tokenizer
            .encode_batch(texts, true)
            .map_err(|e| CriterionError::runtime("subword encode", e))?;
        let rows = encodings
            .iter()
            .map(|enc| enc.get_ids().to_vec())
            .collect::<Vec<_>>();
        Ok(LabelBatch::from_rows(&rows, self.lm.pad_token_id()))
    }
}

impl LanguageModelEmbedder for SubwordEmbedder {
    fn embed(&self, batch: &LabelBatch) -> Result<LmEmbedding, CriterionError> {
        let retokenized = self.retokenize(batch)?;
        if let Some(&id) = retokenized
            .valid_rows()
            .flatten()
            .find(|&&id| id as usize >= self.lm.vocab_size())
        {
            return Err(CriterionError::invalid_input(format!(
                "subword id {id} outside LM vocabulary of {}",
                self.lm.vocab_size()
            )));
        }
        run_lm(&self.lm, self.layer, &retokenized)
    }

    fn shares_vocabulary(&self) -> bool {
        false
    }

    fn label(&self) -> &'static str {
        "subword"
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::model::masked_lm::tests::tiny_lm;

    const WORD_LEVEL_TOKENIZER_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<unk>": 3, "hello": 4, "world": 5},
            "unk_token": "<unk>"
        }
    }"#;

    fn letters() -> Arc<Dictionary> {
        Arc::new(Dictionary::from_symbols(["|", "h", "e", "l", "o", "w", "r", "d"]))
    }

    #[test]
    fn shared_vocab_embeds_with_length_mask() {
        let embedder = SharedVocabEmbedder::new(Arc::new(tiny_lm(12)), -1).unwrap();
        let batch = LabelBatch::from_rows(&[vec![4, 5, 6], vec![7]], 1);
        let out = embedder.embed(&batch).unwrap();
        assert_eq!(out.hidden.dims(), &[2, 3, 4]);
        assert_eq!(out.logits.dims(), &[2, 3, 12]);
        assert_eq!(out.token_lens, vec![3, 1]);
        assert_eq!(
            out.token_mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0, 1.0], vec![1.0, 0.0, 0.0]]
        );
        assert!(embedder.shares_vocabulary());
    }

    #[test]
    fn all_empty_batch_still_embeds() {
        let embedder = SharedVocabEmbedder::new(Arc::new(tiny_lm(12)), 0).unwrap();
        let batch = LabelBatch::from_rows(&[vec![], vec![]], 1);
        let out = embedder.embed(&batch).unwrap();
        assert_eq!(out.hidden.dims(), &[2, 1, 4]);
        assert_eq!(out.token_lens, vec![0, 0]);
    }

    #[test]
    fn out_of_range_hidden_layer_is_config_error() {
        let err = SharedVocabEmbedder::new(Arc::new(tiny_lm(12)), -4).err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn subword_backend_retokenizes_words() {
        let dict = letters();
        let tokenizer = Tokenizer::from_str(WORD_LEVEL_TOKENIZER_JSON).unwrap();
        let embedder =
            SubwordEmbedder::new(Arc::new(tiny_lm(8)), -1, tokenizer, Arc::clone(&dict)).unwrap();
        let batch = LabelBatch::from_rows(
            &[dict.encode_letters("hello world"), dict.encode_letters("world")],
            dict.pad(),
        );
        let retokenized = embedder.retokenize(&batch).unwrap();
        assert_eq!(retokenized.valid(0), &[4, 5]);
        assert_eq!(retokenized.valid(1), &[5]);

        let out = embedder.embed(&batch).unwrap();
        assert_eq!(out.hidden.dims(), &[2, 2, 4]);
        assert_eq!(out.token_lens, vec![2, 1]);
        assert!(!embedder.shares_vocabulary());
    }

    #[test]
    fn missing_tokenizer_file_is_config_error() {
        let err = SubwordEmbedder::load_tokenizer(Path::new("/nonexistent/tokenizer.json"))
            .unwrap_err();
        assert!(err.is_config());
    }
}
