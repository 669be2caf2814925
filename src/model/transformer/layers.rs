//! Transformer block for the BERT family.
//!
//! - encoder block: self-attention + feed-forward
//! - decoder block: causal self-attention + cross-attention + feed-forward

use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use super::attention::BertAttention;
use crate::Result;
use crate::config::BertConfig;

/// Position-wise feed-forward: `LayerNorm(x + Dense(act(Dense(x))))`.
#[derive(Debug, Clone)]
struct FeedForward {
    intermediate: Linear,
    activation: candle_nn::Activation,
    output: Linear,
    output_norm: LayerNorm,
}

impl FeedForward {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            intermediate: candle_nn::linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate.dense"),
            )?,
            activation: cfg.hidden_act,
            output: candle_nn::linear(
                cfg.intermediate_size,
                cfg.hidden_size,
                vb.pp("output.dense"),
            )?,
            output_norm: candle_nn::layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("output.LayerNorm"),
            )?,
        })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let h = self.intermediate.forward(hidden_states)?;
        let h = self.activation.forward(&h)?;
        let h = self.output.forward(&h)?;
        Ok(self.output_norm.forward(&(h + hidden_states)?)?)
    }
}

/// One `encoder.layer.{i}` block.
///
/// `vb` is the block root. Cross-attention weights live under
/// `crossattention` and are read from `cross_vb`, which may point at a
/// different weight source than the rest of the block.
#[derive(Debug, Clone)]
pub struct BertLayer {
    attention: BertAttention,
    crossattention: Option<BertAttention>,
    feed_forward: FeedForward,
}

impl BertLayer {
    /// Encoder block (no cross-attention).
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: BertAttention::new(cfg, vb.pp("attention"))?,
            crossattention: None,
            feed_forward: FeedForward::new(cfg, vb)?,
        })
    }

    /// Decoder block with cross-attention read from `cross_vb`.
    pub fn new_decoder(cfg: &BertConfig, vb: VarBuilder, cross_vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: BertAttention::new(cfg, vb.pp("attention"))?,
            crossattention: Some(BertAttention::new(cfg, cross_vb.pp("crossattention"))?),
            feed_forward: FeedForward::new(cfg, vb)?,
        })
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: [B, S, H]
    /// - `attention_mask`: additive self-attention mask
    /// - `encoder`: `(encoder_hidden_states [B, Sk, H], additive key mask)` for decoder blocks
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder: Option<(&Tensor, &Tensor)>,
    ) -> Result<Tensor> {
        let h = self.attention.forward(hidden_states, None, attention_mask)?;
        let h = match (&self.crossattention, encoder) {
            (Some(cross), Some((memory, memory_mask))) => {
                cross.forward(&h, Some(memory), Some(memory_mask))?
            }
            (None, None) => h,
            (Some(_), None) => {
                return Err(crate::Error::Shape(
                    "decoder block called without encoder hidden states".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(crate::Error::Shape(
                    "encoder block given encoder hidden states".into(),
                ));
            }
        };
        self.feed_forward.forward(&h)
    }
}
