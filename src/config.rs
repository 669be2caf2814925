//! Configuration for the importance-conditioned QA model.
//!
//! - [`PretrainedModel`]: the supported pretrained identifiers
//! - [`BertConfig`]: backbone hyper-parameters, read from the checkpoint's `config.json`
//! - [`GenerationParams`]: decoding options with the model's defaults

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum number of tokens in a tokenized (question + history, passage) pair.
pub const MAX_SEQUENCE_LENGTH: usize = 512;

/// Backbone family. Decides weight names, special tokens and position ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Bert,
    Roberta,
}

impl Architecture {
    /// Prefix of the backbone tensors in a Hugging Face checkpoint.
    pub fn backbone_prefix(self) -> &'static str {
        match self {
            Architecture::Bert => "bert",
            Architecture::Roberta => "roberta",
        }
    }

    /// Prefix of the masked-LM head tensors in a Hugging Face checkpoint.
    pub fn lm_head_prefix(self) -> &'static str {
        match self {
            Architecture::Bert => "cls.predictions",
            Architecture::Roberta => "lm_head",
        }
    }

    /// Names of the classification/start, separator/end and padding tokens.
    pub fn special_token_names(self) -> SpecialTokenNames {
        match self {
            Architecture::Bert => SpecialTokenNames {
                cls: "[CLS]",
                sep: "[SEP]",
                pad: "[PAD]",
            },
            Architecture::Roberta => SpecialTokenNames {
                cls: "<s>",
                sep: "</s>",
                pad: "<pad>",
            },
        }
    }
}

/// Textual form of the special tokens a tokenizer must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokenNames {
    pub cls: &'static str,
    pub sep: &'static str,
    pub pad: &'static str,
}

/// Pretrained checkpoints both modules can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PretrainedModel {
    /// `prajjwal1/bert-tiny`: 2 layers, hidden size 128.
    BertTiny,
    /// `distilroberta-base`: 6 layers, hidden size 768.
    DistilRoberta,
}

impl PretrainedModel {
    /// Resolve a Hugging Face model identifier.
    pub fn from_id(model_id: &str) -> Result<Self> {
        match model_id {
            "prajjwal1/bert-tiny" => Ok(PretrainedModel::BertTiny),
            "distilroberta-base" | "distilbert/distilroberta-base" => {
                Ok(PretrainedModel::DistilRoberta)
            }
            other => Err(Error::Config(format!(
                "unsupported model '{other}', expected 'prajjwal1/bert-tiny' or 'distilroberta-base'"
            ))),
        }
    }

    /// Hub repository holding config and weights.
    pub fn model_id(self) -> &'static str {
        match self {
            PretrainedModel::BertTiny => "prajjwal1/bert-tiny",
            PretrainedModel::DistilRoberta => "distilroberta-base",
        }
    }

    /// Hub repository holding `tokenizer.json`.
    ///
    /// bert-tiny ships only `vocab.txt`; it uses the uncased BERT vocabulary,
    /// so the tokenizer is taken from `bert-base-uncased`.
    pub fn tokenizer_repo(self) -> &'static str {
        match self {
            PretrainedModel::BertTiny => "google-bert/bert-base-uncased",
            PretrainedModel::DistilRoberta => "distilroberta-base",
        }
    }

    pub fn architecture(self) -> Architecture {
        match self {
            PretrainedModel::BertTiny => Architecture::Bert,
            PretrainedModel::DistilRoberta => Architecture::Roberta,
        }
    }
}

/// BERT-family backbone configuration matching Hugging Face `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: candle_nn::Activation,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: u32,
}

impl Default for BertConfig {
    /// `prajjwal1/bert-tiny`.
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 128,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 512,
            hidden_act: default_hidden_act(),
            max_position_embeddings: default_max_position_embeddings(),
            type_vocab_size: default_type_vocab_size(),
            layer_norm_eps: default_layer_norm_eps(),
            pad_token_id: 0,
        }
    }
}

impl BertConfig {
    /// Parse a Hugging Face `config.json`.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Number of token positions the encoder can embed.
    ///
    /// RoBERTa reserves the first `pad_token_id + 1` position slots.
    pub fn max_positions(&self, arch: Architecture) -> usize {
        match arch {
            Architecture::Bert => self.max_position_embeddings,
            Architecture::Roberta => self
                .max_position_embeddings
                .saturating_sub(self.pad_token_id as usize + 1),
        }
    }
}

fn default_hidden_act() -> candle_nn::Activation {
    candle_nn::Activation::Gelu
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

/// Decoding options. Any subset can be given as JSON; the rest keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Multinomial sampling instead of deterministic search.
    pub do_sample: bool,
    /// Beam width for deterministic search (1 = greedy).
    pub num_beams: usize,
    /// Penalty for tokens already present in the output (1.0 = off).
    pub repetition_penalty: f32,
    /// Maximum output length, counting the decoder start token.
    pub max_length: usize,
    /// The end token is suppressed until the output reaches this length.
    pub min_length: usize,
    /// Sampling temperature.
    pub temperature: f64,
    /// Sampling: keep only the `k` most likely tokens.
    pub top_k: Option<usize>,
    /// Sampling: nucleus probability mass.
    pub top_p: Option<f64>,
    /// Beam search: exponent applied to hypothesis length when ranking.
    pub length_penalty: f32,
    /// Sampling seed. Random when absent.
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            do_sample: false,
            num_beams: 3,
            repetition_penalty: 2.0,
            max_length: 20,
            min_length: 0,
            temperature: 1.0,
            top_k: Some(50),
            top_p: None,
            length_penalty: 1.0,
            seed: None,
        }
    }
}

impl GenerationParams {
    /// Parse a (possibly partial) JSON options object.
    pub fn from_json(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_beams == 0 {
            return Err(Error::Config("num_beams must be at least 1".into()));
        }
        if self.max_length < 2 {
            return Err(Error::Config(
                "max_length must leave room for at least one generated token".into(),
            ));
        }
        if self.repetition_penalty <= 0.0 {
            return Err(Error::Config("repetition_penalty must be positive".into()));
        }
        Ok(())
    }
}

/// Parse a device identifier: `auto`, `cpu`, `cuda`, `cuda:N` or `metal`.
///
/// `auto` picks the first CUDA device when available and falls back to CPU.
pub fn parse_device(spec: &str) -> Result<Device> {
    let device = match spec.trim() {
        "auto" => Device::cuda_if_available(0)?,
        "cpu" => Device::Cpu,
        "cuda" => Device::new_cuda(0)?,
        "metal" => Device::new_metal(0)?,
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => {
                let ordinal: usize = ordinal
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid CUDA ordinal in '{other}'")))?;
                Device::new_cuda(ordinal)?
            }
            None => return Err(Error::Config(format!("unknown device '{other}'"))),
        },
    };
    Ok(device)
}
