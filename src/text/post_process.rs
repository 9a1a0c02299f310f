use std::str::FromStr;

use crate::error::CriterionError;

/// How a space-joined unit string is turned into words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcess {
    SentencePiece,
    WordPiece,
    Letter,
    Silence,
    EndOfWord,
    SubwordNmt,
    None,
    /// Any other symbol is stripped together with the following space.
    Custom(String),
}

impl FromStr for PostProcess {
    type Err = CriterionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" => {
                return Err(CriterionError::config(
                    "post_process must not be empty; use \"none\" to disable",
                ))
            }
            "sentencepiece" | "spm" => Self::SentencePiece,
            "wordpiece" => Self::WordPiece,
            "letter" => Self::Letter,
            "silence" => Self::Silence,
            "_EOW" => Self::EndOfWord,
            "subword_nmt" | "@@ " | "@@" => Self::SubwordNmt,
            "none" => Self::None,
            other => Self::Custom(other.to_string()),
        })
    }
}

impl PostProcess {
    pub fn apply(&self, sentence: &str) -> String {
        match self {
            Self::SentencePiece => sentence
                .replace(' ', "")
                .replace('\u{2581}', " ")
                .trim()
                .to_string(),
            Self::WordPiece => sentence.replace(' ', "").replace('_', " ").trim().to_string(),
            Self::Letter => sentence.replace(' ', "").replace('|', " ").trim().to_string(),
            Self::Silence => sentence
                .replace("<SIL>", "")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" "),
            Self::EndOfWord => sentence
                .replace(' ', "")
                .replace("_EOW", " ")
                .trim()
                .to_string(),
            Self::SubwordNmt => strip_symbol(sentence, "@@ "),
            Self::None => sentence.to_string(),
            Self::Custom(symbol) => strip_symbol(sentence, symbol),
        }
    }

    pub fn words(&self, sentence: &str) -> Vec<String> {
        self.apply(sentence)
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

fn strip_symbol(sentence: &str, symbol: &str) -> String {
    format!("{sentence} ")
        .replace(symbol, "")
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_mode_merges_letters_into_words() {
        let mode: PostProcess = "letter".parse().unwrap();
        assert_eq!(mode.apply("h i | t h e r e |"), "hi there");
    }

    #[test]
    fn sentencepiece_aliases() {
        assert_eq!("spm".parse::<PostProcess>().unwrap(), PostProcess::SentencePiece);
        let mode = PostProcess::SentencePiece;
        assert_eq!(mode.apply("\u{2581}he llo \u{2581}world"), "hello world");
    }

    #[test]
    fn subword_nmt_strips_continuation_marker() {
        let mode: PostProcess = "@@".parse().unwrap();
        assert_eq!(mode.apply("hel@@ lo wor@@ ld"), "hello world");
    }

    #[test]
    fn silence_mode_collapses_spaces() {
        assert_eq!(PostProcess::Silence.apply("a <SIL>  b"), "a b");
    }

    #[test]
    fn custom_symbol_is_stripped() {
        let mode: PostProcess = "## ".parse().unwrap();
        assert_eq!(mode, PostProcess::Custom("## ".to_string()));
        assert_eq!(mode.apply("ab## cd"), "abcd");
    }

    #[test]
    fn empty_mode_is_configuration_error() {
        let err = "".parse::<PostProcess>().unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn words_splits_on_whitespace() {
        assert_eq!(PostProcess::Letter.words("a | b c"), vec!["a", "bc"]);
    }
}
