//! Conversational QA from the command line.
//!
//! Answers one question about a passage, optionally given earlier turns of
//! the conversation. Downloads the pretrained backbone from HuggingFace on
//! first run.
//!
//! # Output
//!
//! One JSON line on stdout:
//!
//! ```json
//! {"answer":"paris","importances":[0.51,0.48,...]}
//! ```
//!
//! `importances` is present only with `--importances`.
//!
//! # Example
//!
//! ```sh
//! qa-generate --model prajjwal1/bert-tiny \
//!   --passage "The Eiffel Tower is in Paris." \
//!   --question "Which city?" \
//!   --history "What is the Eiffel Tower? <sep> A tower." \
//!   --extractor-weights extractor.safetensors \
//!   --encoder-decoder-weights generator.safetensors \
//!   --params '{"num_beams": 4, "max_length": 32}'
//! ```

use std::path::PathBuf;

use clap::Parser;
use importance_qa::{
    config::{GenerationParams, parse_device},
    pipeline::QaPipeline,
};

#[derive(Parser, Debug)]
#[command(
    name = "qa-generate",
    about = "Importance-conditioned conversational question answering",
    long_about = "Answer a question about a passage, conditioning generation on per-token\n\
                  importance scores. Prints a single JSON line to stdout."
)]
struct Args {
    /// Pretrained backbone: "prajjwal1/bert-tiny" or "distilroberta-base".
    #[arg(long, short = 'm', default_value = "prajjwal1/bert-tiny")]
    model: String,

    /// Passage the answer is taken from.
    #[arg(long, short = 'p')]
    passage: String,

    /// Question about the passage.
    #[arg(long, short = 'q')]
    question: String,

    /// Earlier conversation turns, separated by " <sep> ".
    #[arg(long)]
    history: Option<String>,

    /// Trained extractor snapshot (.safetensors, .bin, .pt or .pth).
    #[arg(long, requires = "encoder_decoder_weights")]
    extractor_weights: Option<PathBuf>,

    /// Trained encoder-decoder snapshot (.safetensors, .bin, .pt or .pth).
    #[arg(long, requires = "extractor_weights")]
    encoder_decoder_weights: Option<PathBuf>,

    /// Generation parameters as JSON; omitted keys keep their defaults.
    #[arg(long)]
    params: Option<String>,

    /// Device: auto, cpu, cuda, cuda:N or metal.
    #[arg(long, default_value = "auto")]
    device: String,

    /// Also print the token importance scores.
    #[arg(long)]
    importances: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let params = match &args.params {
        Some(json) => GenerationParams::from_json(json)
            .map_err(|e| anyhow::anyhow!("invalid --params: {e}"))?,
        None => GenerationParams::default(),
    };
    let device = parse_device(&args.device)?;
    tracing::info!("Using device: {:?}", device);

    let mut pipeline = QaPipeline::from_pretrained(&args.model, None, &device)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", args.model))?;

    if let (Some(extractor), Some(encoder_decoder)) =
        (&args.extractor_weights, &args.encoder_decoder_weights)
    {
        pipeline
            .load_weights(extractor, encoder_decoder)
            .map_err(|e| anyhow::anyhow!("failed to load trained weights: {e}"))?;
    } else {
        tracing::warn!("no trained snapshots given; added layers are untrained");
    }

    let history = args.history.as_deref();
    let histories = history.as_ref().map(std::slice::from_ref);
    let (answers, importances) = pipeline
        .generate_with_importances(
            &[args.passage.as_str()],
            &[args.question.as_str()],
            histories,
            Some(params),
        )
        .map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;

    let mut summary = serde_json::json!({
        "answer": answers.into_iter().next().unwrap_or_default(),
    });
    if args.importances {
        let scores: Vec<f32> = importances.squeeze(0)?.to_vec1()?;
        summary["importances"] = serde_json::json!(scores);
    }
    println!("{summary}");

    Ok(())
}
