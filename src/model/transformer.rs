//! BERT-family transformer building blocks.
//!
//! Shared by the token-importance extractor (plain encoder), the
//! importance-conditioned encoder and the decoder.
//!
//! Weight layout follows Hugging Face checkpoints:
//!
//! ```text
//! {root}.embeddings.{word,position,token_type}_embeddings
//! {root}.embeddings.LayerNorm
//! {root}.encoder.layer.{i}.attention.{self,output}
//! {root}.encoder.layer.{i}.crossattention.{self,output}   (decoder only)
//! {root}.encoder.layer.{i}.{intermediate,output}
//! ```

pub mod attention;
pub mod embeddings;
pub mod layers;
pub mod mask;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::{Architecture, BertConfig};
use crate::{Error, Result};
use embeddings::BertEmbeddings;
use layers::BertLayer;

/// Embeddings followed by a stack of encoder blocks.
#[derive(Debug, Clone)]
pub struct BertEncoder {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    max_positions: usize,
}

impl BertEncoder {
    /// Load from `vb` rooted at the backbone (`bert`, `roberta`, or `encoder`).
    pub fn new(cfg: &BertConfig, arch: Architecture, vb: VarBuilder) -> Result<Self> {
        let embeddings = BertEmbeddings::new(cfg, arch, vb.pp("embeddings"))?;
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(BertLayer::new(cfg, vb.pp(format!("encoder.layer.{i}")))?);
        }
        Ok(Self {
            embeddings,
            layers,
            max_positions: cfg.max_positions(arch),
        })
    }

    pub fn layers(&self) -> &[BertLayer] {
        &self.layers
    }

    /// Number of token positions this encoder can embed.
    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Fail before any compute when `input_ids` [B, S] does not fit the position table.
    pub fn check_capacity(&self, input_ids: &Tensor) -> Result<()> {
        let (_, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_positions {
            return Err(Error::Capacity {
                seq_len,
                capacity: self.max_positions,
            });
        }
        Ok(())
    }

    /// Token embeddings [B, S, H], the input of the first block.
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.check_capacity(input_ids)?;
        self.embeddings.forward(input_ids)
    }

    /// Contextual embeddings [B, S, H].
    ///
    /// `attention_mask` is the 0/1 [B, S] mask from tokenization.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        check_mask(input_ids, attention_mask)?;
        let mut h = self.embed(input_ids)?;
        let mask = mask::padding_mask(attention_mask, h.dtype())?;
        for layer in &self.layers {
            h = layer.forward(&h, Some(&mask), None)?;
        }
        Ok(h)
    }
}

/// `attention_mask` must have exactly the shape of `input_ids`.
pub fn check_mask(input_ids: &Tensor, attention_mask: &Tensor) -> Result<()> {
    if input_ids.dims() != attention_mask.dims() {
        return Err(Error::Shape(format!(
            "attention mask {:?} does not match input ids {:?}",
            attention_mask.dims(),
            input_ids.dims()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    use crate::test_support::tiny_config;

    #[test]
    fn test_encoder_shape() {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let enc = BertEncoder::new(&cfg, Architecture::Bert, vb.pp("bert")).unwrap();
        assert_eq!(enc.layers().len(), cfg.num_hidden_layers);
        let ids = Tensor::new(&[[2u32, 5, 6, 3], [2, 7, 3, 0]], &dev).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 1], [1, 1, 1, 0]], &dev).unwrap();
        let out = enc.forward(&ids, &mask).unwrap();
        assert_eq!(out.dims(), &[2, 4, cfg.hidden_size]);
    }

    #[test]
    fn test_sequence_beyond_capacity_is_rejected() {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let enc = BertEncoder::new(&cfg, Architecture::Bert, vb.pp("bert")).unwrap();
        let len = cfg.max_position_embeddings + 1;
        let ids = Tensor::zeros((1, len), DType::U32, &dev).unwrap();
        let mask = Tensor::ones((1, len), DType::U32, &dev).unwrap();
        assert!(matches!(
            enc.forward(&ids, &mask),
            Err(Error::Capacity { seq_len, .. }) if seq_len == len
        ));
    }

    #[test]
    fn test_mask_shape_mismatch_is_rejected() {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let enc = BertEncoder::new(&cfg, Architecture::Bert, vb.pp("bert")).unwrap();
        let ids = Tensor::zeros((2, 4), DType::U32, &dev).unwrap();
        let mask = Tensor::ones((2, 3), DType::U32, &dev).unwrap();
        assert!(matches!(enc.forward(&ids, &mask), Err(Error::Shape(_))));
    }
}
