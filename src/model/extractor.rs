//! Token-importance extractor.
//!
//! A BERT-family encoder with a scalar head: every token's contextual
//! embedding is projected to one logit and squashed with a sigmoid, giving the
//! estimated probability that the token lies inside the answer span.

use candle_core::{Module, Tensor};
use candle_nn::Linear;

use super::transformer::BertEncoder;
use super::weights::ModuleWeights;
use crate::config::{Architecture, BertConfig};
use crate::{Result, inference};

/// Encoder + `Linear(H → 1)` + sigmoid.
///
/// Weight layout: `{bert|roberta}.*` for the encoder, `head.{weight,bias}`
/// for the scalar head.
#[derive(Debug, Clone)]
pub struct TokenImportanceExtractor {
    encoder: BertEncoder,
    head: Linear,
}

impl TokenImportanceExtractor {
    pub fn new(cfg: &BertConfig, arch: Architecture, weights: &ModuleWeights) -> Result<Self> {
        let encoder = BertEncoder::new(cfg, arch, weights.pretrained.pp(arch.backbone_prefix()))?;
        let head = candle_nn::linear(cfg.hidden_size, 1, weights.added.pp("head"))?;
        Ok(Self { encoder, head })
    }

    /// Maximum sequence length accepted by [`forward`](Self::forward).
    pub fn max_positions(&self) -> usize {
        self.encoder.max_positions()
    }

    /// Importance scores in [0, 1].
    ///
    /// - `input_ids`: [B, S] u32
    /// - `attention_mask`: [B, S] u32, 1 for real tokens
    ///
    /// Returns [B, S] f32. Sequences longer than the encoder's position table
    /// fail with [`Error::Capacity`](crate::Error::Capacity) before any compute.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        self.encoder.check_capacity(input_ids)?;
        let hidden = self.encoder.forward(input_ids, attention_mask)?;
        let logits = self.head.forward(&hidden)?.squeeze(2)?;
        let scores = candle_nn::ops::sigmoid(&logits)?;
        Ok(inference::detach_if_active(scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    use crate::Error;
    use crate::test_support::tiny_config;

    fn random_extractor(dev: &Device) -> TokenImportanceExtractor {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        TokenImportanceExtractor::new(&tiny_config(), Architecture::Bert, &ModuleWeights::snapshot(vb))
            .unwrap()
    }

    #[test]
    fn test_scores_in_unit_interval_with_input_shape() {
        let dev = Device::Cpu;
        let extractor = random_extractor(&dev);
        let ids = Tensor::new(&[[2u32, 9, 10, 11, 3, 12, 3], [2, 13, 3, 14, 3, 0, 0]], &dev).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 1, 1, 1, 1], [1, 1, 1, 1, 1, 0, 0]], &dev).unwrap();
        let scores = extractor.forward(&ids, &mask).unwrap();
        assert_eq!(scores.dims(), ids.dims());
        let values: Vec<f32> = scores.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|s| (0.0..=1.0).contains(s)), "{values:?}");
    }

    #[test]
    fn test_zero_weights_give_one_half() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let extractor =
            TokenImportanceExtractor::new(&tiny_config(), Architecture::Bert, &ModuleWeights::snapshot(vb))
                .unwrap();
        let ids = Tensor::new(&[[2u32, 5, 3]], &dev).unwrap();
        let mask = Tensor::ones((1, 3), DType::U32, &dev).unwrap();
        let scores: Vec<Vec<f32>> = extractor.forward(&ids, &mask).unwrap().to_vec2().unwrap();
        assert!(scores[0].iter().all(|s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_over_long_input_is_capacity_error() {
        let dev = Device::Cpu;
        let extractor = random_extractor(&dev);
        let len = extractor.max_positions() + 3;
        let ids = Tensor::zeros((1, len), DType::U32, &dev).unwrap();
        let mask = Tensor::ones((1, len), DType::U32, &dev).unwrap();
        assert!(matches!(
            extractor.forward(&ids, &mask),
            Err(Error::Capacity { .. })
        ));
    }
}
