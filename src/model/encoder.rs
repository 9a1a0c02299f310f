use candle_core::{Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::config::LanguageModelConfig;
use crate::model::layers::{FeedForward, LayerNorm};

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SelfAttention {
    fn load(cfg: &LanguageModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let head_dim = cfg.head_dim();
        let hidden = cfg.hidden_size;
        let inner = vb.pp("self");
        Ok(Self {
            query: candle_nn::linear(hidden, hidden, inner.pp("query"))?,
            key: candle_nn::linear(hidden, hidden, inner.pp("key"))?,
            value: candle_nn::linear(hidden, hidden, inner.pp("value"))?,
            output: candle_nn::linear(hidden, hidden, vb.pp("output").pp("dense"))?,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn forward(&self, xs: &Tensor, bias: &Tensor) -> candle_core::Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        let heads = |x: Tensor| {
            x.reshape((b, t, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };

        let q = heads((self.query.forward(xs)? * self.scale)?)?;
        let k = heads(self.key.forward(xs)?)?;
        let v = heads(self.value.forward(xs)?)?;

        let logits = q
            .matmul(&k.transpose(2, 3)?.contiguous()?)?
            .broadcast_add(bias)?;
        let attn = candle_nn::ops::softmax(&logits, D::Minus1)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        self.output.forward(&out)
    }
}

/// Post-norm layer: `h = ln1(x + attn(x))`, `y = ln2(h + ff(h))`.
struct EncoderLayer {
    attn: SelfAttention,
    ln1: LayerNorm,
    ff: FeedForward,
    ln2: LayerNorm,
}

impl EncoderLayer {
    fn load(cfg: &LanguageModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let eps = cfg.layer_norm_eps;
        Ok(Self {
            attn: SelfAttention::load(cfg, vb.pp("attention"))?,
            ln1: LayerNorm::load(
                cfg.hidden_size,
                eps,
                vb.pp("attention").pp("output").pp("LayerNorm"),
            )?,
            ff: FeedForward::load(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate").pp("dense"),
                vb.pp("output").pp("dense"),
            )?,
            ln2: LayerNorm::load(cfg.hidden_size, eps, vb.pp("output").pp("LayerNorm"))?,
        })
    }

    fn forward(&self, xs: &Tensor, bias: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.ln1.forward(&(xs + self.attn.forward(xs, bias)?)?)?;
        self.ln2.forward(&(&h + self.ff.forward(&h)?)?)
    }
}

pub(crate) struct Encoder {
    layers: Vec<EncoderLayer>,
}

impl Encoder {
    pub(crate) fn load(cfg: &LanguageModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(EncoderLayer::load(cfg, vb.pp(format!("layer.{i}")))?);
        }
        Ok(Self { layers })
    }

    /// Runs every layer, returning the input followed by each layer's output.
    pub(crate) fn forward(
        &self,
        embedded: Tensor,
        bias: &Tensor,
    ) -> candle_core::Result<Vec<Tensor>> {
        let mut states = Vec::with_capacity(self.layers.len() + 1);
        let mut h = embedded;
        for layer in &self.layers {
            let next = layer.forward(&h, bias)?;
            states.push(h);
            h = next;
        }
        states.push(h);
        Ok(states)
    }
}
