use crate::alignment::mas::monotonic_alignment_path;
use crate::pipeline::traits::AlignmentSearch;

pub struct MonotonicAlignmentSearch;

impl AlignmentSearch for MonotonicAlignmentSearch {
    fn align_path(&self, scores: &[Vec<f32>]) -> Vec<(usize, usize)> {
        monotonic_alignment_path(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_alignment_search_align_path() {
        let aligner = MonotonicAlignmentSearch;
        let scores = vec![vec![0.0f32, -10.0, -10.0], vec![-10.0, 0.0, 0.0]];
        let path = aligner.align_path(&scores);
        assert_eq!(path, monotonic_alignment_path(&scores));
        assert_eq!(path, vec![(0, 0), (1, 1), (1, 2)]);
    }
}
