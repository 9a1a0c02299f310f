use candle_core::{DType, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

/// Large negative additive bias for masked attention keys.
const MASKED_KEY_BIAS: f64 = -1e9;

pub(crate) struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub(crate) fn load(size: usize, eps: f64, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            weight: vb.get(size, "weight")?,
            bias: vb.get(size, "bias")?,
            eps,
        })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let hidden = x.dim(D::Minus1)? as f64;
        let mean = (x.sum_keepdim(D::Minus1)? / hidden)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden)?;
        centered
            .broadcast_div(&(var + self.eps)?.sqrt()?)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// `dense -> erf GELU -> dense` block of a transformer layer.
pub(crate) struct FeedForward {
    up: Linear,
    down: Linear,
}

impl FeedForward {
    pub(crate) fn load(
        hidden: usize,
        intermediate: usize,
        up: VarBuilder,
        down: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            up: candle_nn::linear(hidden, intermediate, up)?,
            down: candle_nn::linear(intermediate, hidden, down)?,
        })
    }

    pub(crate) fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.down.forward(&self.up.forward(xs)?.gelu_erf()?)
    }
}

/// `(batch, 1, 1, tokens)` additive attention bias from a `(batch, tokens)`
/// mask with 1.0 on real tokens.
pub(crate) fn key_padding_bias(mask: &Tensor) -> candle_core::Result<Tensor> {
    let (batch, tokens) = mask.dims2()?;
    mask.to_dtype(DType::F32)?
        .affine(-MASKED_KEY_BIAS, MASKED_KEY_BIAS)?
        .reshape((batch, 1, 1, tokens))
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn layer_norm_with_zero_init_returns_bias() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let norm = LayerNorm::load(3, 1e-5, vb).unwrap();
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        assert_eq!(norm.forward(&x).unwrap().to_vec2::<f32>().unwrap(), vec![vec![0.0; 3]]);
    }

    #[test]
    fn padding_bias_masks_only_padded_keys() {
        let mask = Tensor::new(&[[1.0f32, 0.0]], &Device::Cpu).unwrap();
        let bias = key_padding_bias(&mask).unwrap();
        assert_eq!(bias.dims(), &[1, 1, 1, 2]);
        let flat = bias.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(flat[0], 0.0);
        assert!(flat[1] <= -1e8);
    }
}
