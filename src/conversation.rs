//! Conversation linearization and pair tokenization.
//!
//! Callers serialize multi-turn history as one string with turns separated by
//! `" <sep> "`. Before tokenization the history is appended to the question,
//! each turn introduced by the tokenizer's own separator token:
//!
//! ```text
//! question [SEP] turn 1 [SEP] turn 2
//! ```
//!
//! The result is tokenized as the first sequence of a pair whose second
//! sequence is the passage.

use candle_core::{Device, Tensor};
use tokenizers::{
    EncodeInput, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams, TruncationStrategy,
};

use crate::config::{Architecture, MAX_SEQUENCE_LENGTH};
use crate::model::generation::SpecialTokens;
use crate::{Error, Result};

/// Turn separator in caller-supplied history strings.
pub const HISTORY_SEPARATOR: &str = " <sep> ";

/// Split a serialized history into its turns.
///
/// Blank turns are dropped, so an empty or whitespace-only history has no turns.
pub fn split_turns(history: &str) -> Vec<&str> {
    history
        .split(HISTORY_SEPARATOR)
        .filter(|turn| !turn.trim().is_empty())
        .collect()
}

/// Append the history turns to the question, each prefixed by `sep_token`.
pub fn linearize(question: &str, history: Option<&str>, sep_token: &str) -> String {
    let turns = history.map(split_turns).unwrap_or_default();
    if turns.is_empty() {
        return question.to_string();
    }
    let separator = format!(" {sep_token} ");
    format!("{question}{separator}{}", turns.join(&separator))
}

/// Elementwise [`linearize`] over a batch.
pub fn linearize_batch(
    questions: &[&str],
    histories: Option<&[&str]>,
    sep_token: &str,
) -> Result<Vec<String>> {
    match histories {
        None => Ok(questions.iter().map(|q| q.to_string()).collect()),
        Some(histories) => {
            if histories.len() != questions.len() {
                return Err(Error::Shape(format!(
                    "{} histories for {} questions",
                    histories.len(),
                    questions.len()
                )));
            }
            Ok(questions
                .iter()
                .zip(histories)
                .map(|(question, history)| linearize(question, Some(*history), sep_token))
                .collect())
        }
    }
}

/// Token ids and attention mask of one tokenization call.
///
/// Both tensors are `u32` with shape [B, S]; the mask is 1 for real tokens
/// and 0 for padding.
#[derive(Debug, Clone)]
pub struct TokenizedBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
}

impl TokenizedBatch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.dims().get(1).copied().unwrap_or(0)
    }
}

/// Tokenizer configured for (question + history, passage) pairs.
///
/// Truncation (longest-first, [`MAX_SEQUENCE_LENGTH`]) and batch-longest
/// padding are set once here; this is the only place sequence length is
/// enforced.
#[derive(Clone)]
pub struct ConversationTokenizer {
    tokenizer: Tokenizer,
    sep_token: String,
    special_tokens: SpecialTokens,
}

impl ConversationTokenizer {
    /// Wrap `tokenizer`, resolving the special tokens `arch` relies on.
    ///
    /// Fails with a configuration error when the tokenizer lacks one of them.
    pub fn new(mut tokenizer: Tokenizer, arch: Architecture) -> Result<Self> {
        let names = arch.special_token_names();
        let lookup = |token: &str| {
            tokenizer.token_to_id(token).ok_or_else(|| {
                Error::Config(format!("tokenizer has no '{token}' token required by {arch:?}"))
            })
        };
        let special_tokens = SpecialTokens {
            start: lookup(names.cls)?,
            end: lookup(names.sep)?,
            pad: lookup(names.pad)?,
        };

        tokenizer.with_truncation(Some(TruncationParams {
            max_length: MAX_SEQUENCE_LENGTH,
            strategy: TruncationStrategy::LongestFirst,
            ..Default::default()
        }))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            pad_id: special_tokens.pad,
            pad_token: names.pad.to_string(),
            ..Default::default()
        }));

        Ok(Self {
            tokenizer,
            sep_token: names.sep.to_string(),
            special_tokens,
        })
    }

    /// The separator token substituted for `" <sep> "`.
    pub fn sep_token(&self) -> &str {
        &self.sep_token
    }

    pub fn special_tokens(&self) -> SpecialTokens {
        self.special_tokens
    }

    /// Vocabulary size including added tokens.
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Tokenize `(question_and_history[i], passage[i])` pairs into one padded batch.
    pub fn encode_pairs(
        &self,
        questions_and_histories: Vec<String>,
        passages: &[&str],
        device: &Device,
    ) -> Result<TokenizedBatch> {
        if questions_and_histories.len() != passages.len() {
            return Err(Error::Shape(format!(
                "{} questions for {} passages",
                questions_and_histories.len(),
                passages.len()
            )));
        }
        if passages.is_empty() {
            return Err(Error::Shape("empty batch".into()));
        }

        let inputs: Vec<EncodeInput> = questions_and_histories
            .into_iter()
            .zip(passages.iter().map(|p| p.to_string()))
            .map(EncodeInput::from)
            .collect();
        let encodings = self.tokenizer.encode_batch(inputs, true)?;

        let batch_size = encodings.len();
        let seq_len = encodings.first().map(|e| e.len()).unwrap_or(0);
        let mut ids = Vec::with_capacity(batch_size * seq_len);
        let mut mask = Vec::with_capacity(batch_size * seq_len);
        for encoding in &encodings {
            ids.extend_from_slice(encoding.get_ids());
            mask.extend_from_slice(encoding.get_attention_mask());
        }
        tracing::debug!(batch_size, seq_len, "tokenized question/passage pairs");

        Ok(TokenizedBatch {
            input_ids: Tensor::from_vec(ids, (batch_size, seq_len), device)?,
            attention_mask: Tensor::from_vec(mask, (batch_size, seq_len), device)?,
        })
    }

    /// Decode generated id sequences, stripping special tokens.
    pub fn decode_batch(&self, sequences: &[Vec<u32>]) -> Result<Vec<String>> {
        let slices: Vec<&[u32]> = sequences.iter().map(Vec::as_slice).collect();
        Ok(self.tokenizer.decode_batch(&slices, true)?)
    }
}
