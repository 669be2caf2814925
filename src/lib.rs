//! Importance-conditioned conversational question answering in pure Rust.
//!
//! Two cooperating candle models answer a question about a passage, given the
//! earlier turns of the conversation:
//!
//! ```text
//! question + history ──┐
//!                      ├→ tokenize pair ─→ importance extractor ─→ scores [B, S]
//! passage ─────────────┘         │                                     │
//!                                └──────→ encoder (+ Linear_i(scores) per block)
//!                                                   ↓
//!                                         decoder (cross-attention, LM head)
//!                                                   ↓
//!                                                answers
//! ```
//!
//! ## Modules
//!
//! - [`conversation`]: history linearization and pair tokenization
//! - [`model`]: extractor, encoder-decoder, decoding strategies
//! - [`pipeline`]: [`QaPipeline`](pipeline::QaPipeline), the end-to-end entry point
//! - [`config`]: pretrained identifiers, backbone config, generation params
//! - [`inference`]: scope guard that keeps outputs out of the gradient graph

pub mod config;
pub mod conversation;
pub mod inference;
pub mod model;
pub mod pipeline;

mod error;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
