//! Importance-conditioned encoder-decoder.
//!
//! The encoder is a BERT-family encoder whose every block receives the token
//! importance scores as an additive input:
//!
//! ```text
//! h_0   = embeddings(input_ids)
//! h_i   = block_i(h_{i-1} + Linear_i(scores[..., None]))
//! ```
//!
//! `Linear_i` maps one scalar per token to the hidden size and is never shared
//! between blocks. The decoder is an unmodified causal BERT-family decoder with
//! cross-attention and an LM head tied to its word embeddings.
//!
//! Weight layout (snapshot naming):
//!
//! ```text
//! encoder.embeddings.*                         encoder.encoder.layer.{i}.*
//! encoder.importance_projections.{i}.{weight,bias}
//! decoder.{bert|roberta}.embeddings.*          decoder.{bert|roberta}.encoder.layer.{i}.*
//! decoder.{bert|roberta}.encoder.layer.{i}.crossattention.*
//! decoder.cls.predictions.{transform.*,bias}   (BERT)
//! decoder.lm_head.{dense,layer_norm,bias}      (RoBERTa)
//! ```

use candle_core::{D, IndexOp, Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use super::generation::{self, EncoderMemory, SpecialTokens, StepDecoder};
use super::transformer::embeddings::BertEmbeddings;
use super::transformer::layers::BertLayer;
use super::transformer::mask::{causal_mask, padding_mask};
use super::transformer::{BertEncoder, check_mask};
use super::weights::ModuleWeights;
use crate::config::{Architecture, BertConfig, GenerationParams};
use crate::{Error, Result, inference};

/// Encoder with one importance projection per block.
#[derive(Debug, Clone)]
pub struct ImportanceConditionedEncoder {
    encoder: BertEncoder,
    projections: Vec<Linear>,
}

impl ImportanceConditionedEncoder {
    /// `weights` rooted at the encoder (`encoder`).
    pub fn new(cfg: &BertConfig, arch: Architecture, weights: &ModuleWeights) -> Result<Self> {
        let encoder = BertEncoder::new(cfg, arch, weights.pretrained.clone())?;
        let projections = (0..cfg.num_hidden_layers)
            .map(|i| {
                candle_nn::linear(
                    1,
                    cfg.hidden_size,
                    weights.added.pp(format!("importance_projections.{i}")),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            encoder,
            projections,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.projections.len()
    }

    pub fn max_positions(&self) -> usize {
        self.encoder.max_positions()
    }

    /// Vector added to the input of `block`: [B, S] scores → [B, S, H].
    pub fn project_importances(&self, block: usize, token_importances: &Tensor) -> Result<Tensor> {
        let projection = self.projections.get(block).ok_or_else(|| {
            Error::Shape(format!(
                "block {block} out of range for {} encoder blocks",
                self.projections.len()
            ))
        })?;
        let dtype = projection.weight().dtype();
        let scores = token_importances.to_dtype(dtype)?.unsqueeze(D::Minus1)?;
        Ok(projection.forward(&scores)?)
    }

    /// Encoder hidden states [B, S, H].
    ///
    /// `token_importances` must have exactly the shape of `input_ids`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        token_importances: &Tensor,
    ) -> Result<Tensor> {
        check_mask(input_ids, attention_mask)?;
        if token_importances.dims() != input_ids.dims() {
            return Err(Error::Shape(format!(
                "token importances {:?} are not aligned with input ids {:?}",
                token_importances.dims(),
                input_ids.dims()
            )));
        }

        let mut h = self.encoder.embed(input_ids)?;
        let mask = padding_mask(attention_mask, h.dtype())?;
        let scores = token_importances.to_dtype(h.dtype())?.unsqueeze(D::Minus1)?;
        for (layer, projection) in self.encoder.layers().iter().zip(&self.projections) {
            h = (h + projection.forward(&scores)?)?;
            h = layer.forward(&h, Some(&mask), None)?;
        }
        Ok(h)
    }
}

/// Masked-LM head: transform (dense, activation, norm) then a projection tied
/// to the word embeddings.
#[derive(Debug, Clone)]
struct LmHead {
    dense: Linear,
    activation: candle_nn::Activation,
    layer_norm: LayerNorm,
    decoder: Linear,
}

impl LmHead {
    fn new(cfg: &BertConfig, arch: Architecture, vb: VarBuilder, word_embeddings: Tensor) -> Result<Self> {
        let (dense, norm, activation) = match arch {
            Architecture::Bert => ("transform.dense", "transform.LayerNorm", cfg.hidden_act),
            Architecture::Roberta => ("dense", "layer_norm", candle_nn::Activation::Gelu),
        };
        let bias = vb.get_with_hints(cfg.vocab_size, "bias", candle_nn::Init::Const(0.))?;
        Ok(Self {
            dense: candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp(dense))?,
            activation,
            layer_norm: candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp(norm))?,
            decoder: Linear::new(word_embeddings, Some(bias)),
        })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let h = self.dense.forward(hidden_states)?;
        let h = self.activation.forward(&h)?;
        let h = self.layer_norm.forward(&h)?;
        Ok(self.decoder.forward(&h)?)
    }
}

/// Causal BERT-family decoder with cross-attention.
#[derive(Debug, Clone)]
pub struct BertDecoder {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    lm_head: LmHead,
    max_positions: usize,
}

impl BertDecoder {
    /// `weights` rooted at the decoder (`decoder`).
    pub fn new(cfg: &BertConfig, arch: Architecture, weights: &ModuleWeights) -> Result<Self> {
        let backbone = weights.pp(arch.backbone_prefix());
        let embeddings = BertEmbeddings::new(cfg, arch, backbone.pretrained.pp("embeddings"))?;
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            let block = backbone.pp(format!("encoder.layer.{i}"));
            layers.push(BertLayer::new_decoder(cfg, block.pretrained, block.added)?);
        }
        let lm_head = LmHead::new(
            cfg,
            arch,
            weights.pretrained.pp(arch.lm_head_prefix()),
            embeddings.word_embeddings().clone(),
        )?;
        Ok(Self {
            embeddings,
            layers,
            lm_head,
            max_positions: cfg.max_positions(arch),
        })
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }
}

impl StepDecoder for BertDecoder {
    fn step_logits(&self, decoder_input_ids: &Tensor, memory: &EncoderMemory) -> Result<Tensor> {
        let (_, seq_len) = decoder_input_ids.dims2()?;
        let mut h = self.embeddings.forward(decoder_input_ids)?;
        let self_mask = causal_mask(seq_len, h.dtype(), h.device())?;
        let memory_mask = padding_mask(&memory.attention_mask, h.dtype())?;
        for layer in &self.layers {
            h = layer.forward(
                &h,
                Some(&self_mask),
                Some((&memory.hidden_states, &memory_mask)),
            )?;
        }
        let last = h.i((.., seq_len - 1, ..))?;
        self.lm_head.forward(&last)
    }
}

/// The generator: importance-conditioned encoder + BERT-family decoder.
#[derive(Debug, Clone)]
pub struct ImportanceEncoderDecoder {
    encoder: ImportanceConditionedEncoder,
    decoder: BertDecoder,
    special_tokens: Option<SpecialTokens>,
}

impl ImportanceEncoderDecoder {
    pub fn new(cfg: &BertConfig, arch: Architecture, weights: &ModuleWeights) -> Result<Self> {
        Ok(Self {
            encoder: ImportanceConditionedEncoder::new(cfg, arch, &weights.pp("encoder"))?,
            decoder: BertDecoder::new(cfg, arch, &weights.pp("decoder"))?,
            special_tokens: None,
        })
    }

    pub fn encoder(&self) -> &ImportanceConditionedEncoder {
        &self.encoder
    }

    /// Wire the decoder start, end and padding ids.
    pub fn set_special_tokens(&mut self, tokens: SpecialTokens) {
        self.special_tokens = Some(tokens);
    }

    pub fn special_tokens(&self) -> Option<SpecialTokens> {
        self.special_tokens
    }

    /// Run the encoder, producing the memory the decoder attends to.
    pub fn encode(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        token_importances: &Tensor,
    ) -> Result<EncoderMemory> {
        let hidden_states = self.encoder.forward(input_ids, attention_mask, token_importances)?;
        Ok(EncoderMemory {
            hidden_states: inference::detach_if_active(hidden_states),
            attention_mask: attention_mask.clone(),
        })
    }

    /// Generate answer ids [B, out_len], right-padded with the pad id.
    pub fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        token_importances: &Tensor,
        params: &GenerationParams,
    ) -> Result<Tensor> {
        let tokens = self.special_tokens.ok_or_else(|| {
            Error::Config("decoder special tokens have not been set".into())
        })?;
        if params.max_length > self.decoder.max_positions() {
            return Err(Error::Capacity {
                seq_len: params.max_length,
                capacity: self.decoder.max_positions(),
            });
        }

        let memory = self.encode(input_ids, attention_mask, token_importances)?;
        let sequences = generation::generate(&self.decoder, &memory, tokens, params)?;
        let (flat, out_len) = generation::pad_sequences(&sequences, tokens.pad);
        tracing::debug!(
            batch_size = sequences.len(),
            out_len,
            num_beams = params.num_beams,
            do_sample = params.do_sample,
            "generated answers"
        );
        Ok(Tensor::from_vec(flat, (sequences.len(), out_len), input_ids.device())?)
    }
}
