//! Token + position + token-type embeddings.

use candle_core::{DType, Module, Tensor};
use candle_nn::{Embedding, LayerNorm, VarBuilder};

use crate::Result;
use crate::config::{Architecture, BertConfig};

/// Embedding layer matching Hugging Face `BertEmbeddings` / `RobertaEmbeddings`.
///
/// Token-type ids are always 0: neither module feeds segment ids.
#[derive(Debug, Clone)]
pub struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
    arch: Architecture,
    pad_token_id: u32,
}

impl BertEmbeddings {
    pub fn new(cfg: &BertConfig, arch: Architecture, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            word_embeddings: candle_nn::embedding(
                cfg.vocab_size,
                cfg.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: candle_nn::embedding(
                cfg.max_position_embeddings,
                cfg.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: candle_nn::embedding(
                cfg.type_vocab_size,
                cfg.hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            arch,
            pad_token_id: cfg.pad_token_id,
        })
    }

    /// Word embedding matrix [V, H] (tied to the decoder's LM head).
    pub fn word_embeddings(&self) -> &Tensor {
        self.word_embeddings.embeddings()
    }

    /// Forward pass: `input_ids` [B, S] u32 → [B, S, H].
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        let device = input_ids.device();

        let position_ids = self.position_ids(input_ids)?;
        let token_type_ids = Tensor::zeros((batch, seq_len), DType::U32, device)?;

        let embeddings = self.word_embeddings.forward(input_ids)?;
        let embeddings = embeddings.broadcast_add(&self.position_embeddings.forward(&position_ids)?)?;
        let embeddings = (embeddings + self.token_type_embeddings.forward(&token_type_ids)?)?;
        Ok(self.layer_norm.forward(&embeddings)?)
    }

    /// BERT: `0..S` shared by every row, [1, S].
    /// RoBERTa: padding tokens get `pad`, others count up from `pad + 1`, [B, S].
    fn position_ids(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        match self.arch {
            Architecture::Bert => {
                Ok(Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?)
            }
            Architecture::Roberta => {
                let rows: Vec<Vec<u32>> = input_ids.to_vec2()?;
                let ids = roberta_position_ids(&rows, self.pad_token_id);
                Ok(Tensor::from_vec(ids, input_ids.dims2()?, input_ids.device())?)
            }
        }
    }
}

fn roberta_position_ids(rows: &[Vec<u32>], pad: u32) -> Vec<u32> {
    let mut out = Vec::with_capacity(rows.iter().map(Vec::len).sum());
    for row in rows {
        let mut count = 0u32;
        for &id in row {
            if id == pad {
                out.push(pad);
            } else {
                count += 1;
                out.push(pad + count);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    use crate::test_support::tiny_config;

    #[test]
    fn test_roberta_position_ids_skip_padding() {
        let ids = roberta_position_ids(&[vec![0, 5, 6, 1, 1], vec![0, 7, 1, 1, 1]], 1);
        assert_eq!(ids, vec![2, 3, 4, 1, 1, 2, 3, 1, 1, 1]);
    }

    #[test]
    fn test_embeddings_shape() {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        for arch in [Architecture::Bert, Architecture::Roberta] {
            let vb = VarBuilder::zeros(DType::F32, &dev);
            let emb = BertEmbeddings::new(&cfg, arch, vb.pp("embeddings")).unwrap();
            let ids = Tensor::new(&[[2u32, 5, 6, 3], [2, 7, 3, 0]], &dev).unwrap();
            let out = emb.forward(&ids).unwrap();
            assert_eq!(out.dims(), &[2, 4, cfg.hidden_size]);
        }
    }
}
