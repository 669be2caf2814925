//! BERT-style multi-head attention.
//!
//! Post-norm: `LayerNorm(x + Dense(Attention(x)))`. The same type serves
//! self-attention (keys/values from the query stream) and decoder
//! cross-attention (keys/values from the encoder output).

use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use crate::Result;
use crate::config::BertConfig;

/// Attention block matching Hugging Face `BertAttention` weight layout:
/// `self.{query,key,value}`, `output.dense`, `output.LayerNorm`.
#[derive(Debug, Clone)]
pub struct BertAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output_dense: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl BertAttention {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let attn = vb.pp("self");
        Ok(Self {
            query: candle_nn::linear(hidden, hidden, attn.pp("query"))?,
            key: candle_nn::linear(hidden, hidden, attn.pp("key"))?,
            value: candle_nn::linear(hidden, hidden, attn.pp("value"))?,
            output_dense: candle_nn::linear(hidden, hidden, vb.pp("output.dense"))?,
            output_norm: candle_nn::layer_norm(
                hidden,
                cfg.layer_norm_eps,
                vb.pp("output.LayerNorm"),
            )?,
            num_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
        })
    }

    /// [B, S, H] → [B, heads, S, head_dim]
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        Ok(xs
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: `[B, Sq, H]`, the query stream, also the residual
    /// - `context`: `[B, Sk, H]`, keys/values for cross-attention; `None` for self-attention
    /// - `attention_mask`: additive, broadcastable to `[B, heads, Sq, Sk]`
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        context: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = hidden_states.dims3()?;
        let kv_input = context.unwrap_or(hidden_states);

        let q = self.split_heads(&self.query.forward(hidden_states)?)?;
        let k = self.split_heads(&self.key.forward(kv_input)?)?;
        let v = self.split_heads(&self.value.forward(kv_input)?)?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? / scale)?;
        let scores = match attention_mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        // [B, heads, Sq, D] → [B, Sq, heads*D]
        let ctx = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;

        let out = self.output_dense.forward(&ctx)?;
        Ok(self.output_norm.forward(&(out + hidden_states)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use crate::model::transformer::mask::padding_mask;
    use crate::test_support::tiny_config;

    #[test]
    fn test_self_attention_shape() {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let attn = BertAttention::new(&cfg, vb.pp("attention")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 7, cfg.hidden_size), &dev).unwrap();
        let y = attn.forward(&x, None, None).unwrap();
        assert_eq!(y.dims(), &[2, 7, cfg.hidden_size]);
    }

    #[test]
    fn test_cross_attention_shape() {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let attn = BertAttention::new(&cfg, vb.pp("crossattention")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, cfg.hidden_size), &dev).unwrap();
        let memory = Tensor::randn(0f32, 1.0, (2, 9, cfg.hidden_size), &dev).unwrap();
        let y = attn.forward(&x, Some(&memory), None).unwrap();
        assert_eq!(y.dims(), &[2, 3, cfg.hidden_size]);
    }

    #[test]
    fn test_padded_keys_do_not_change_output() {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let attn = BertAttention::new(&cfg, vb.pp("attention")).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 4, cfg.hidden_size), &dev).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (1, 2, cfg.hidden_size), &dev).unwrap();
        let padded = Tensor::cat(&[&x, &noise], 1).unwrap();
        let keep = Tensor::new(&[[1u32, 1, 1, 1, 0, 0]], &dev).unwrap();
        let mask = padding_mask(&keep, DType::F32).unwrap();

        let plain = attn.forward(&x, None, None).unwrap();
        let masked = attn.forward(&padded, None, Some(&mask)).unwrap();
        let masked = masked.narrow(1, 0, 4).unwrap();
        let diff: f32 = (plain - masked)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "diff = {diff}");
    }
}
