use std::collections::HashMap;
use std::path::Path;

use crate::error::CriterionError;

pub const BOS_SYMBOL: &str = "<s>";
pub const PAD_SYMBOL: &str = "<pad>";
pub const EOS_SYMBOL: &str = "</s>";
pub const UNK_SYMBOL: &str = "<unk>";
pub const WORD_SEPARATOR: &str = "|";

/// Acoustic target vocabulary in the fairseq `dict.txt` layout.
///
/// The four special symbols occupy indices 0..4; the CTC blank is `<s>`.
#[derive(Debug, Clone)]
pub struct Dictionary {
    symbols: Vec<String>,
    indices: HashMap<String, u32>,
}

impl Dictionary {
    pub fn from_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut dict = Self {
            symbols: Vec::new(),
            indices: HashMap::new(),
        };
        for special in [BOS_SYMBOL, PAD_SYMBOL, EOS_SYMBOL, UNK_SYMBOL] {
            dict.add_symbol(special.to_string());
        }
        for symbol in symbols {
            dict.add_symbol(symbol.into());
        }
        dict
    }

    /// Parses `<symbol> <count>` lines. A trailing `#fairseq:overwrite` flag is ignored.
    pub fn load(path: &Path) -> Result<Self, CriterionError> {
        let data =
            std::fs::read_to_string(path).map_err(|e| CriterionError::io("read dict.txt", e))?;
        let mut symbols = Vec::new();
        for (line_no, line) in data.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let line = line.strip_suffix(" #fairseq:overwrite").unwrap_or(line);
            let (symbol, count) = line.rsplit_once(' ').ok_or_else(|| {
                CriterionError::config(format!(
                    "dict.txt line {}: expected '<symbol> <count>'",
                    line_no + 1
                ))
            })?;
            if count.parse::<u64>().is_err() {
                return Err(CriterionError::config(format!(
                    "dict.txt line {}: invalid count {count:?}",
                    line_no + 1
                )));
            }
            symbols.push(symbol.to_string());
        }
        Ok(Self::from_symbols(symbols))
    }

    fn add_symbol(&mut self, symbol: String) {
        if self.indices.contains_key(&symbol) {
            return;
        }
        self.indices.insert(symbol.clone(), self.symbols.len() as u32);
        self.symbols.push(symbol);
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn bos(&self) -> u32 {
        0
    }

    pub fn pad(&self) -> u32 {
        1
    }

    pub fn eos(&self) -> u32 {
        2
    }

    pub fn unk(&self) -> u32 {
        3
    }

    pub fn blank(&self) -> u32 {
        self.bos()
    }

    pub fn index(&self, symbol: &str) -> u32 {
        self.indices.get(symbol).copied().unwrap_or(self.unk())
    }

    pub fn symbol(&self, index: u32) -> &str {
        self.symbols
            .get(index as usize)
            .map(String::as_str)
            .unwrap_or(UNK_SYMBOL)
    }

    pub fn word_separator(&self) -> Option<u32> {
        self.indices.get(WORD_SEPARATOR).copied()
    }

    /// Space-joined symbols, skipping pad and eos.
    pub fn string(&self, tokens: &[u32]) -> String {
        tokens
            .iter()
            .copied()
            .filter(|&t| t != self.pad() && t != self.eos())
            .map(|t| self.symbol(t))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Plain text: symbols concatenated, word separators turned into spaces.
    pub fn to_text(&self, tokens: &[u32]) -> String {
        let mut text = String::new();
        for &t in tokens {
            if t == self.pad() || t == self.eos() {
                continue;
            }
            let symbol = self.symbol(t);
            if symbol == WORD_SEPARATOR {
                text.push(' ');
            } else {
                text.push_str(symbol);
            }
        }
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Letter-level encoding of a transcript, words joined by the separator.
    ///
    /// Casing follows the vocabulary: uppercase-only vocabularies get an
    /// uppercased transcript, everything else is lowercased. Characters
    /// outside the vocabulary are dropped.
    pub fn encode_letters(&self, transcript: &str) -> Vec<u32> {
        let mut has_upper = false;
        let mut has_lower = false;
        for c in self
            .symbols
            .iter()
            .filter_map(|s| single_char(s))
            .filter(|c| c.is_alphabetic())
        {
            has_upper |= c.is_uppercase();
            has_lower |= c.is_lowercase();
        }
        let cleaned = if has_upper && !has_lower {
            transcript.to_uppercase()
        } else {
            transcript.to_lowercase()
        };

        let separator = self.word_separator();
        let mut tokens = Vec::new();
        for word in cleaned.split_whitespace() {
            let letters = word
                .chars()
                .filter_map(|c| self.indices.get(c.to_string().as_str()).copied())
                .collect::<Vec<_>>();
            if letters.is_empty() {
                continue;
            }
            if !tokens.is_empty() {
                if let Some(sep) = separator {
                    tokens.push(sep);
                }
            }
            tokens.extend(letters);
        }
        tokens
    }
}

fn single_char(symbol: &str) -> Option<char> {
    let mut it = symbol.chars();
    let c = it.next()?;
    if it.next().is_some() {
        return None;
    }
    Some(c)
}
