use candle_core::{DType, Tensor};

use crate::alignment::mas::path_to_mask;
use crate::error::CriterionError;
use crate::pipeline::traits::AlignmentSearch;

/// `(batch, tokens, frames)` alignment weights for a compatibility matrix.
///
/// Each item is aligned on its valid `token_lens[b] x frame_lens[b]` corner;
/// padded cells stay zero, so empty items get an all-zero mask.
pub fn alignment_mask(
    aligner: &dyn AlignmentSearch,
    compat: &Tensor,
    token_lens: &[usize],
    frame_lens: &[usize],
) -> Result<Tensor, CriterionError> {
    let (batch, tokens, frames) = compat
        .dims3()
        .map_err(|e| CriterionError::runtime("alignment dims3", e))?;
    if token_lens.len() != batch || frame_lens.len() != batch {
        return Err(CriterionError::invalid_input(format!(
            "alignment lengths for {} / {} items, batch has {batch}",
            token_lens.len(),
            frame_lens.len()
        )));
    }

    let host = compat
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec3::<f32>())
        .map_err(|e| CriterionError::runtime("alignment to_vec3", e))?;

    let mut mask = vec![0f32; batch * tokens * frames];
    for (b, item) in host.iter().enumerate() {
        let t_len = token_lens[b].min(tokens);
        let f_len = frame_lens[b].min(frames);
        if t_len == 0 || f_len == 0 {
            continue;
        }
        let cropped = item[..t_len]
            .iter()
            .map(|row| row[..f_len].to_vec())
            .collect::<Vec<_>>();
        let path = aligner.align_path(&cropped);
        let local = path_to_mask(&path, t_len, f_len);
        let base = b * tokens * frames;
        for t in 0..t_len {
            let dst = base + t * frames;
            mask[dst..dst + f_len].copy_from_slice(&local[t * f_len..(t + 1) * f_len]);
        }
    }

    Tensor::from_vec(mask, (batch, tokens, frames), compat.device())
        .map_err(|e| CriterionError::runtime("alignment mask tensor", e))
}

/// Narrows or zero-extends the token axis of a `(batch, tokens, frames)` mask.
pub fn fit_token_axis(mask: &Tensor, tokens: usize) -> candle_core::Result<Tensor> {
    let (batch, current, frames) = mask.dims3()?;
    if tokens == current {
        return Ok(mask.clone());
    }
    if tokens < current {
        return mask.narrow(1, 0, tokens);
    }
    let filler = Tensor::zeros((batch, tokens - current, frames), mask.dtype(), mask.device())?;
    Tensor::cat(&[mask, &filler], 1)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::pipeline::defaults::MonotonicAlignmentSearch;

    #[test]
    fn mask_respects_valid_lengths() {
        let compat = Tensor::new(
            &[
                [[3.0f32, 0.0, 0.0], [0.0, 3.0, 3.0]],
                [[1.0, 1.0, 9.0], [9.0, 9.0, 9.0]],
            ],
            &Device::Cpu,
        )
        .unwrap();
        let mask = alignment_mask(&MonotonicAlignmentSearch, &compat, &[2, 1], &[3, 2]).unwrap();
        assert_eq!(
            mask.to_vec3::<f32>().unwrap(),
            vec![
                vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 1.0]],
                vec![vec![1.0, 1.0, 0.0], vec![0.0, 0.0, 0.0]],
            ]
        );
    }

    #[test]
    fn zero_length_item_gets_empty_mask() {
        let compat = Tensor::ones((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let mask = alignment_mask(&MonotonicAlignmentSearch, &compat, &[0], &[2]).unwrap();
        assert_eq!(mask.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let compat = Tensor::ones((2, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(alignment_mask(&MonotonicAlignmentSearch, &compat, &[1], &[2, 2]).is_err());
    }

    #[test]
    fn fit_token_axis_pads_and_narrows() {
        let mask = Tensor::ones((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let grown = fit_token_axis(&mask, 4).unwrap();
        assert_eq!(grown.dims(), &[1, 4, 3]);
        assert_eq!(grown.sum_all().unwrap().to_scalar::<f32>().unwrap(), 6.0);
        let shrunk = fit_token_axis(&mask, 1).unwrap();
        assert_eq!(shrunk.dims(), &[1, 1, 3]);
    }
}
