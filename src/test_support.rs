//! Shared fixtures for unit tests.

use tokenizers::Tokenizer;

use crate::config::BertConfig;

/// Words known to [`word_level_tokenizer`], ids from 5 on.
const WORDS: &[&str] = &[
    "what", "is", "it", "?", "paris", "the", "capital", "of", "france", ".", "who", "wrote", "a",
    "book", "where", "in", "city",
];

/// A two-block, 16-wide backbone whose vocabulary covers the tokenizer fixture.
pub fn tiny_config() -> BertConfig {
    BertConfig {
        vocab_size: 32,
        hidden_size: 16,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        intermediate_size: 32,
        max_position_embeddings: 64,
        ..BertConfig::default()
    }
}

/// Lower-casing, whitespace-splitting word-level tokenizer with BERT special
/// tokens: `[PAD]`=0, `[UNK]`=1, `[CLS]`=2, `[SEP]`=3, `[MASK]`=4.
pub fn word_level_tokenizer() -> Tokenizer {
    let specials = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]"];
    let added_tokens: Vec<serde_json::Value> = specials
        .iter()
        .enumerate()
        .map(|(id, content)| {
            serde_json::json!({
                "id": id,
                "content": content,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true,
            })
        })
        .collect();
    let vocab: serde_json::Map<String, serde_json::Value> = specials
        .iter()
        .chain(WORDS)
        .enumerate()
        .map(|(id, token)| (token.to_string(), serde_json::json!(id)))
        .collect();

    let special = |name: &str| serde_json::json!({ "SpecialToken": { "id": name, "type_id": 0 } });
    let special_b = |name: &str| serde_json::json!({ "SpecialToken": { "id": name, "type_id": 1 } });
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": { "type": "Lowercase" },
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": {
            "type": "TemplateProcessing",
            "single": [
                special("[CLS]"),
                { "Sequence": { "id": "A", "type_id": 0 } },
                special("[SEP]"),
            ],
            "pair": [
                special("[CLS]"),
                { "Sequence": { "id": "A", "type_id": 0 } },
                special("[SEP]"),
                { "Sequence": { "id": "B", "type_id": 1 } },
                special_b("[SEP]"),
            ],
            "special_tokens": {
                "[CLS]": { "id": "[CLS]", "ids": [2], "tokens": ["[CLS]"] },
                "[SEP]": { "id": "[SEP]", "ids": [3], "tokens": ["[SEP]"] },
            },
        },
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" },
    });
    Tokenizer::from_bytes(json.to_string().as_bytes()).expect("valid tokenizer fixture")
}

#[test]
fn test_fixture_vocab_fits_tiny_config() {
    let tokenizer = word_level_tokenizer();
    assert!(tokenizer.get_vocab_size(true) <= tiny_config().vocab_size);
    assert_eq!(tokenizer.token_to_id("[SEP]"), Some(3));
    assert_eq!(tokenizer.token_to_id("paris"), Some(9));
}
