use serde::Deserialize;

/// How string edit distances are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditDistanceMode {
    /// Divided by the longer string length (at least 1).
    #[default]
    Normalized,
    /// Raw operation count.
    Raw,
}

/// Levenshtein distance over arbitrary comparable units.
pub fn levenshtein<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev = (0..=b.len()).collect::<Vec<_>>();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, x) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let cost = usize::from(x != y);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EditDistanceScorer {
    mode: EditDistanceMode,
}

impl EditDistanceScorer {
    pub fn new(mode: EditDistanceMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> EditDistanceMode {
        self.mode
    }

    /// Character edit distance between two detokenized strings.
    pub fn distance(&self, reference: &str, hypothesis: &str) -> f32 {
        let r = reference.chars().collect::<Vec<_>>();
        let h = hypothesis.chars().collect::<Vec<_>>();
        let raw = levenshtein(&r, &h) as f32;
        match self.mode {
            EditDistanceMode::Raw => raw,
            EditDistanceMode::Normalized => raw / r.len().max(h.len()).max(1) as f32,
        }
    }

    /// `(batch, candidates)` distances; column 0 is the numerator and stays zero.
    ///
    /// `candidates[c][b]` is the detokenized candidate `c` for batch item `b`.
    pub fn matrix(&self, references: &[String], candidates: &[Vec<String>]) -> Vec<Vec<f32>> {
        let mut out = vec![vec![0f32; candidates.len()]; references.len()];
        for (c, column) in candidates.iter().enumerate().skip(1) {
            for (b, reference) in references.iter().enumerate() {
                debug_assert_eq!(out[b][c], 0.0);
                out[b][c] = self.distance(reference, &column[b]);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_classic_example() {
        let a = "kitten".chars().collect::<Vec<_>>();
        let b = "sitting".chars().collect::<Vec<_>>();
        assert_eq!(levenshtein(&a, &b), 3);
    }

    #[test]
    fn levenshtein_empty_inputs() {
        let empty: [u32; 0] = [];
        assert_eq!(levenshtein(&empty, &empty), 0);
        assert_eq!(levenshtein(&[1u32, 2], &empty), 2);
        assert_eq!(levenshtein(&empty, &[1u32]), 1);
    }

    #[test]
    fn levenshtein_over_words() {
        let r = ["the", "cat", "sat"];
        let h = ["the", "bat"];
        assert_eq!(levenshtein(&r, &h), 2);
    }

    #[test]
    fn distance_to_self_is_zero_and_symmetric() {
        let scorer = EditDistanceScorer::default();
        let cases = [("a b a", "a b"), ("c c", "c a c"), ("", "a"), ("abc", "cba")];
        for (s, t) in cases {
            assert_eq!(scorer.distance(s, s), 0.0);
            assert_eq!(scorer.distance(s, t), scorer.distance(t, s));
        }
    }

    #[test]
    fn normalized_divides_by_longer_string() {
        let scorer = EditDistanceScorer::new(EditDistanceMode::Normalized);
        assert!((scorer.distance("abcd", "ab") - 0.5).abs() < 1e-6);
        let raw = EditDistanceScorer::new(EditDistanceMode::Raw);
        assert_eq!(raw.distance("abcd", "ab"), 2.0);
    }

    #[test]
    fn empty_strings_do_not_divide_by_zero() {
        let scorer = EditDistanceScorer::default();
        assert_eq!(scorer.distance("", ""), 0.0);
        assert_eq!(scorer.distance("", "ab"), 1.0);
    }

    #[test]
    fn matrix_keeps_numerator_column_zero() {
        let scorer = EditDistanceScorer::new(EditDistanceMode::Raw);
        let refs = vec!["a b".to_string(), "c".to_string()];
        let candidates = vec![
            refs.clone(),
            vec!["a".to_string(), "c c".to_string()],
        ];
        let m = scorer.matrix(&refs, &candidates);
        assert_eq!(m, vec![vec![0.0, 2.0], vec![0.0, 2.0]]);
    }
}
