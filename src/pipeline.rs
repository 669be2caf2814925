//! End-to-end question answering.
//!
//! [`QaPipeline`] owns the tokenizer and both modules:
//!
//! 1. Linearize (question, history) with the tokenizer's separator token
//! 2. Tokenize (question + history, passage) pairs, truncating to 512 tokens
//!    and padding to the longest pair in the batch
//! 3. Score every token with the importance extractor
//! 4. Generate with the importance-conditioned encoder-decoder
//! 5. Decode, dropping special tokens

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use hf_hub::api::sync::Api;
use tokenizers::Tokenizer;

use crate::config::{Architecture, BertConfig, GenerationParams, PretrainedModel};
use crate::conversation::{ConversationTokenizer, linearize, linearize_batch};
use crate::inference::InferenceMode;
use crate::model::encoder_decoder::ImportanceEncoderDecoder;
use crate::model::extractor::TokenImportanceExtractor;
use crate::model::weights::{ModuleWeights, open_checkpoint};
use crate::{Error, Result};

const DTYPE: DType = DType::F32;

/// Conversational QA model: importance extractor + importance-conditioned generator.
pub struct QaPipeline {
    arch: Architecture,
    config: BertConfig,
    tokenizer: ConversationTokenizer,
    extractor: TokenImportanceExtractor,
    encoder_decoder: ImportanceEncoderDecoder,
    device: Device,
    last_params: Option<GenerationParams>,
}

impl QaPipeline {
    /// Build both modules from a pretrained Hugging Face checkpoint.
    ///
    /// `model_id` must be `prajjwal1/bert-tiny` or `distilroberta-base`.
    /// Without a `tokenizer`, the checkpoint's own tokenizer is downloaded.
    /// Parameters the checkpoint lacks (extractor head, importance
    /// projections, decoder cross-attention) start freshly initialized.
    pub fn from_pretrained(model_id: &str, tokenizer: Option<Tokenizer>, device: &Device) -> Result<Self> {
        let model = PretrainedModel::from_id(model_id)?;
        tracing::info!(model_id = model.model_id(), "fetching pretrained checkpoint");

        let api = Api::new()?;
        let repo = api.model(model.model_id().to_string());
        let config_path = repo.get("config.json")?;
        let weights_path = repo
            .get("model.safetensors")
            .or_else(|_| repo.get("pytorch_model.bin"))?;
        let tokenizer = match tokenizer {
            Some(tokenizer) => tokenizer,
            None => {
                let path = api
                    .model(model.tokenizer_repo().to_string())
                    .get("tokenizer.json")?;
                Tokenizer::from_file(path)?
            }
        };

        Self::from_files(model.architecture(), &config_path, &weights_path, tokenizer, device)
    }

    /// Build both modules from a local `config.json` and backbone checkpoint.
    pub fn from_files(
        arch: Architecture,
        config_path: &Path,
        checkpoint_path: &Path,
        tokenizer: Tokenizer,
        device: &Device,
    ) -> Result<Self> {
        let config = BertConfig::from_json_file(config_path)?;
        tracing::info!(?arch, checkpoint = ?checkpoint_path, "loading backbone");
        let checkpoint = open_checkpoint(checkpoint_path, DTYPE, device)?;

        // encoder.X → {backbone}.X, decoder.X → X
        let backbone = arch.backbone_prefix();
        let seq2seq = checkpoint.clone().rename_f(move |name: &str| {
            if let Some(rest) = name.strip_prefix("encoder.") {
                format!("{backbone}.{rest}")
            } else {
                name.strip_prefix("decoder.").unwrap_or(name).to_string()
            }
        });

        let extractor_added = VarMap::new();
        let seq2seq_added = VarMap::new();
        Self::new(
            arch,
            config,
            tokenizer,
            ModuleWeights::with_fresh_added(checkpoint, &extractor_added),
            ModuleWeights::with_fresh_added(seq2seq, &seq2seq_added),
            device,
        )
    }

    /// Build from explicit weight sources for both modules.
    ///
    /// Fails with a configuration error when the tokenizer lacks the special
    /// tokens of `arch` or has more tokens than the model's vocabulary.
    pub fn new(
        arch: Architecture,
        config: BertConfig,
        tokenizer: Tokenizer,
        extractor_weights: ModuleWeights,
        encoder_decoder_weights: ModuleWeights,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer = ConversationTokenizer::new(tokenizer, arch)?;
        if tokenizer.vocab_size() > config.vocab_size {
            return Err(Error::Config(format!(
                "tokenizer has {} tokens but the model vocabulary holds {}",
                tokenizer.vocab_size(),
                config.vocab_size
            )));
        }

        let extractor = TokenImportanceExtractor::new(&config, arch, &extractor_weights)?;
        let mut encoder_decoder = ImportanceEncoderDecoder::new(&config, arch, &encoder_decoder_weights)?;
        encoder_decoder.set_special_tokens(tokenizer.special_tokens());
        tracing::info!(
            ?arch,
            hidden_size = config.hidden_size,
            blocks = config.num_hidden_layers,
            vocab_size = config.vocab_size,
            "QA pipeline ready"
        );

        Ok(Self {
            arch,
            config,
            tokenizer,
            extractor,
            encoder_decoder,
            device: device.clone(),
            last_params: None,
        })
    }

    /// Replace both modules with trained snapshots.
    ///
    /// Both snapshots are loaded before anything is swapped in. On error the
    /// current modules stay in place.
    pub fn load_weights(
        &mut self,
        extractor_path: impl AsRef<Path>,
        encoder_decoder_path: impl AsRef<Path>,
    ) -> Result<()> {
        let extractor_path = extractor_path.as_ref();
        let encoder_decoder_path = encoder_decoder_path.as_ref();

        let vb = open_checkpoint(extractor_path, DTYPE, &self.device)?;
        let extractor = TokenImportanceExtractor::new(&self.config, self.arch, &ModuleWeights::snapshot(vb))
            .map_err(|e| incompatible(extractor_path, e))?;

        let vb = open_checkpoint(encoder_decoder_path, DTYPE, &self.device)?;
        let mut encoder_decoder =
            ImportanceEncoderDecoder::new(&self.config, self.arch, &ModuleWeights::snapshot(vb))
                .map_err(|e| incompatible(encoder_decoder_path, e))?;
        encoder_decoder.set_special_tokens(self.tokenizer.special_tokens());

        self.extractor = extractor;
        self.encoder_decoder = encoder_decoder;
        tracing::info!(
            extractor = ?extractor_path,
            encoder_decoder = ?encoder_decoder_path,
            "loaded trained weights"
        );
        Ok(())
    }

    /// Answer a batch of questions.
    ///
    /// `passages`, `questions` and `histories` (if given) must have equal
    /// lengths. Histories use `" <sep> "` between turns. `params` defaults to
    /// [`GenerationParams::default`].
    pub fn generate(
        &mut self,
        passages: &[&str],
        questions: &[&str],
        histories: Option<&[&str]>,
        params: Option<GenerationParams>,
    ) -> Result<Vec<String>> {
        Ok(self
            .generate_with_importances(passages, questions, histories, params)?
            .0)
    }

    /// [`generate`](Self::generate), also returning the importance scores [B, S].
    pub fn generate_with_importances(
        &mut self,
        passages: &[&str],
        questions: &[&str],
        histories: Option<&[&str]>,
        params: Option<GenerationParams>,
    ) -> Result<(Vec<String>, Tensor)> {
        let _scope = InferenceMode::enter();
        let params = params.unwrap_or_default();
        params.validate()?;
        if passages.len() != questions.len() {
            return Err(Error::Shape(format!(
                "{} passages for {} questions",
                passages.len(),
                questions.len()
            )));
        }

        let queries = linearize_batch(questions, histories, self.tokenizer.sep_token())?;
        let batch = self.tokenizer.encode_pairs(queries, passages, &self.device)?;
        let importances = self.extractor.forward(&batch.input_ids, &batch.attention_mask)?;
        let generated = self.encoder_decoder.generate(
            &batch.input_ids,
            &batch.attention_mask,
            &importances,
            &params,
        )?;
        let sequences: Vec<Vec<u32>> = generated.to_vec2()?;
        let answers = self.tokenizer.decode_batch(&sequences)?;

        self.last_params = Some(params);
        Ok((answers, importances))
    }

    /// Importance scores [1, S] for a single passage / question / history.
    pub fn compute_token_importances(
        &self,
        passage: &str,
        question: &str,
        history: Option<&str>,
    ) -> Result<Tensor> {
        let _scope = InferenceMode::enter();
        let query = linearize(question, history, self.tokenizer.sep_token());
        let batch = self.tokenizer.encode_pairs(vec![query], &[passage], &self.device)?;
        self.extractor.forward(&batch.input_ids, &batch.attention_mask)
    }

    /// Parameters used by the last successful [`generate`](Self::generate) call.
    pub fn last_generation_params(&self) -> Option<&GenerationParams> {
        self.last_params.as_ref()
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn tokenizer(&self) -> &ConversationTokenizer {
        &self.tokenizer
    }

    pub fn extractor(&self) -> &TokenImportanceExtractor {
        &self.extractor
    }

    pub fn encoder_decoder(&self) -> &ImportanceEncoderDecoder {
        &self.encoder_decoder
    }
}

fn incompatible(path: &Path, error: Error) -> Error {
    match error {
        Error::WeightLoad(_) => error,
        other => Error::WeightLoad(format!("{} is not a compatible snapshot: {other}", path.display())),
    }
}
