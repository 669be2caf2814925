//! Neural components.
//!
//! - [`transformer`]: BERT-family embeddings, attention and blocks
//! - [`extractor`]: token-importance extractor (encoder + sigmoid head)
//! - [`encoder_decoder`]: importance-conditioned encoder and causal decoder
//! - [`generation`]: greedy, beam and sampling search
//! - [`weights`]: pretrained vs. snapshot weight sources

pub mod encoder_decoder;
pub mod extractor;
pub mod generation;
pub mod transformer;
pub mod weights;
