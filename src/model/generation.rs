//! Autoregressive decoding strategies.
//!
//! The search loop only needs next-token logits, so it is written against the
//! [`StepDecoder`] trait:
//!
//! - **greedy** (`num_beams == 1`) and **sampling** (`do_sample`) advance the
//!   whole batch with one decoder call per step
//! - **beam search** (`num_beams > 1`) runs item by item, with one decoder
//!   call per step covering all beams of that item
//!
//! Every sequence starts with `start`. A row is finished once it emits `end`,
//! after which it is padded with `pad`. Decoding stops at `max_length` tokens.

use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::utils::apply_repeat_penalty;

use crate::Result;
use crate::config::GenerationParams;

/// Token ids the decoder's generation is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    /// Decoder start token (the tokenizer's CLS/BOS).
    pub start: u32,
    /// End token (the tokenizer's SEP/EOS).
    pub end: u32,
    /// Padding token.
    pub pad: u32,
}

/// Encoder output the decoder cross-attends to.
#[derive(Debug, Clone)]
pub struct EncoderMemory {
    /// [B, S, H]
    pub hidden_states: Tensor,
    /// [B, S] u32, 1 for real tokens.
    pub attention_mask: Tensor,
}

impl EncoderMemory {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.hidden_states.dim(0)?)
    }

    pub fn device(&self) -> &Device {
        self.hidden_states.device()
    }

    /// Gather rows, e.g. `[i, i, i]` to give each of three beams item `i`'s memory.
    pub fn select(&self, rows: &[u32]) -> Result<Self> {
        let index = Tensor::new(rows, self.device())?;
        Ok(Self {
            hidden_states: self.hidden_states.index_select(&index, 0)?,
            attention_mask: self.attention_mask.index_select(&index, 0)?,
        })
    }
}

/// One decoder step.
pub trait StepDecoder {
    /// Logits [N, V] for the token following each row of `decoder_input_ids` [N, T].
    ///
    /// Row `n` attends to row `n` of `memory`.
    fn step_logits(&self, decoder_input_ids: &Tensor, memory: &EncoderMemory) -> Result<Tensor>;
}

/// Generate one id sequence per memory row.
///
/// Sequences start with `tokens.start`. They have different lengths unless
/// padded by the caller.
pub fn generate<D: StepDecoder + ?Sized>(
    decoder: &D,
    memory: &EncoderMemory,
    tokens: SpecialTokens,
    params: &GenerationParams,
) -> Result<Vec<Vec<u32>>> {
    params.validate()?;
    if params.do_sample {
        if params.num_beams > 1 {
            tracing::warn!(
                num_beams = params.num_beams,
                "sampling draws a single sequence per item; num_beams is ignored"
            );
        }
        let seed = params.seed.unwrap_or_else(rand::random);
        let mut chooser = TokenChooser::Sample(LogitsProcessor::from_sampling(seed, sampling(params)));
        batched_search(decoder, memory, tokens, params, &mut chooser)
    } else if params.num_beams == 1 {
        batched_search(decoder, memory, tokens, params, &mut TokenChooser::Greedy)
    } else {
        let batch = memory.batch_size()?;
        (0..batch as u32)
            .map(|item| beam_search(decoder, &memory.select(&[item])?, tokens, params))
            .collect()
    }
}

/// Right-pad sequences with `pad` into a row-major [B, L] buffer.
pub fn pad_sequences(sequences: &[Vec<u32>], pad: u32) -> (Vec<u32>, usize) {
    let out_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(sequences.len() * out_len);
    for sequence in sequences {
        flat.extend_from_slice(sequence);
        flat.extend(std::iter::repeat_n(pad, out_len - sequence.len()));
    }
    (flat, out_len)
}

fn sampling(params: &GenerationParams) -> Sampling {
    let temperature = params.temperature;
    if temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    match (params.top_k, params.top_p) {
        (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        (Some(k), None) => Sampling::TopK { k, temperature },
        (None, Some(p)) => Sampling::TopP { p, temperature },
        (None, None) => Sampling::All { temperature },
    }
}

enum TokenChooser {
    Greedy,
    Sample(LogitsProcessor),
}

impl TokenChooser {
    fn choose(&mut self, scores: Vec<f32>, device: &Device) -> Result<u32> {
        match self {
            TokenChooser::Greedy => Ok(argmax(&scores)),
            TokenChooser::Sample(processor) => {
                let len = scores.len();
                Ok(processor.sample(&Tensor::from_vec(scores, len, device)?)?)
            }
        }
    }
}

/// Apply the repetition penalty and the minimum-length rule to one row of logits.
fn process_logits(
    logits: &Tensor,
    sequence: &[u32],
    tokens: SpecialTokens,
    params: &GenerationParams,
) -> Result<Vec<f32>> {
    let logits = logits.to_dtype(DType::F32)?;
    let logits = if params.repetition_penalty != 1.0 {
        apply_repeat_penalty(&logits, params.repetition_penalty, sequence)?
    } else {
        logits
    };
    let mut scores: Vec<f32> = logits.to_vec1()?;
    if sequence.len() < params.min_length
        && let Some(score) = scores.get_mut(tokens.end as usize)
    {
        *score = f32::NEG_INFINITY;
    }
    Ok(scores)
}

fn argmax(scores: &[f32]) -> u32 {
    scores
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (i, &s)| if s > best.1 { (i, s) } else { best })
        .0 as u32
}

fn log_softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = scores.iter().map(|s| (s - max).exp()).sum();
    let log_sum = max + sum.ln();
    scores.iter().map(|s| s - log_sum).collect()
}

/// Indices of the `k` largest scores, best first.
fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    let k = k.min(indices.len());
    if k == 0 {
        return Vec::new();
    }
    indices.select_nth_unstable_by(k - 1, |&a, &b| scores[b].total_cmp(&scores[a]));
    indices.truncate(k);
    indices.sort_unstable_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    indices
}

fn batched_search<D: StepDecoder + ?Sized>(
    decoder: &D,
    memory: &EncoderMemory,
    tokens: SpecialTokens,
    params: &GenerationParams,
    chooser: &mut TokenChooser,
) -> Result<Vec<Vec<u32>>> {
    let batch = memory.batch_size()?;
    let device = memory.device().clone();
    let mut sequences = vec![vec![tokens.start]; batch];
    let mut finished = vec![false; batch];

    for cur_len in 1..params.max_length {
        let ids = Tensor::from_vec(sequences.concat(), (batch, cur_len), &device)?;
        let logits = decoder.step_logits(&ids, memory)?;

        for (row, sequence) in sequences.iter_mut().enumerate() {
            if finished[row] {
                sequence.push(tokens.pad);
                continue;
            }
            let scores = process_logits(&logits.get(row)?, sequence, tokens, params)?;
            let next = chooser.choose(scores, &device)?;
            sequence.push(next);
            finished[row] = next == tokens.end;
        }

        if finished.iter().all(|done| *done) {
            break;
        }
    }
    Ok(sequences)
}

struct Beam {
    tokens: Vec<u32>,
    /// Sum of token log-probabilities.
    log_prob: f32,
}

/// Length-normalized score; the start token does not count.
fn beam_score(log_prob: f32, tokens: &[u32], length_penalty: f32) -> f32 {
    let generated = tokens.len().saturating_sub(1).max(1) as f32;
    log_prob / generated.powf(length_penalty)
}

/// Beam search for a single item (`memory` has batch size 1).
fn beam_search<D: StepDecoder + ?Sized>(
    decoder: &D,
    memory: &EncoderMemory,
    tokens: SpecialTokens,
    params: &GenerationParams,
) -> Result<Vec<u32>> {
    let num_beams = params.num_beams;
    let device = memory.device().clone();
    let mut beams = vec![Beam {
        tokens: vec![tokens.start],
        log_prob: 0.0,
    }];
    // (normalized score, tokens), best first, at most `num_beams`
    let mut hypotheses: Vec<(f32, Vec<u32>)> = Vec::with_capacity(num_beams + 1);

    for cur_len in 1..params.max_length {
        let ids: Vec<u32> = beams.iter().flat_map(|b| b.tokens.iter().copied()).collect();
        let ids = Tensor::from_vec(ids, (beams.len(), cur_len), &device)?;
        let beam_memory = memory.select(&vec![0u32; beams.len()])?;
        let logits = decoder.step_logits(&ids, &beam_memory)?;

        let mut candidates: Vec<(f32, usize, u32)> = Vec::with_capacity(beams.len() * 2 * num_beams);
        for (b, beam) in beams.iter().enumerate() {
            let scores = process_logits(&logits.get(b)?, &beam.tokens, tokens, params)?;
            let log_probs = log_softmax(&scores);
            for token in top_k(&log_probs, 2 * num_beams) {
                candidates.push((beam.log_prob + log_probs[token], b, token as u32));
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut next_beams = Vec::with_capacity(num_beams);
        for (rank, (log_prob, b, token)) in candidates.into_iter().enumerate() {
            if !log_prob.is_finite() {
                break;
            }
            let mut sequence = beams[b].tokens.clone();
            sequence.push(token);
            if token == tokens.end {
                // An end token outside the top `num_beams` would displace a
                // better running beam; drop it.
                if rank < num_beams {
                    let score = beam_score(log_prob, &sequence, params.length_penalty);
                    hypotheses.push((score, sequence));
                }
            } else {
                next_beams.push(Beam {
                    tokens: sequence,
                    log_prob,
                });
            }
            if next_beams.len() == num_beams {
                break;
            }
        }
        hypotheses.sort_by(|a, b| b.0.total_cmp(&a.0));
        hypotheses.truncate(num_beams);

        beams = next_beams;
        if beams.is_empty() {
            break;
        }
        if hypotheses.len() == num_beams {
            let worst_finished = hypotheses[num_beams - 1].0;
            let best_running = beam_score(beams[0].log_prob, &beams[0].tokens, params.length_penalty);
            if worst_finished >= best_running {
                break;
            }
        }
    }

    // Beams still running at the length cap compete with finished hypotheses.
    for beam in beams {
        let score = beam_score(beam.log_prob, &beam.tokens, params.length_penalty);
        hypotheses.push((score, beam.tokens));
    }
    Ok(hypotheses
        .into_iter()
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, sequence)| sequence)
        .unwrap_or_else(|| vec![tokens.start]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCAB: usize = 8;
    const TOKENS: SpecialTokens = SpecialTokens {
        start: 0,
        end: 1,
        pad: 2,
    };

    /// Decoder whose logits are a function of (item id, prefix).
    ///
    /// The item id is stored as the single hidden value of each memory row.
    struct ScriptedDecoder<F: Fn(u32, &[u32]) -> Vec<f32>> {
        script: F,
    }

    impl<F: Fn(u32, &[u32]) -> Vec<f32>> StepDecoder for ScriptedDecoder<F> {
        fn step_logits(&self, ids: &Tensor, memory: &EncoderMemory) -> Result<Tensor> {
            let rows: Vec<Vec<u32>> = ids.to_vec2()?;
            let items: Vec<Vec<Vec<f32>>> = memory.hidden_states.to_vec3()?;
            let logits: Vec<f32> = rows
                .iter()
                .zip(&items)
                .flat_map(|(row, item)| (self.script)(item[0][0] as u32, row))
                .collect();
            Ok(Tensor::from_vec(logits, (rows.len(), VOCAB), ids.device())?)
        }
    }

    fn memory(batch: usize) -> EncoderMemory {
        let dev = Device::Cpu;
        let items: Vec<f32> = (0..batch).map(|i| i as f32).collect();
        EncoderMemory {
            hidden_states: Tensor::from_vec(items, (batch, 1, 1), &dev).unwrap(),
            attention_mask: Tensor::ones((batch, 1), DType::U32, &dev).unwrap(),
        }
    }

    /// Logits favouring `token` with margin 10.
    fn pick(token: u32) -> Vec<f32> {
        let mut logits = vec![0.0; VOCAB];
        logits[token as usize] = 10.0;
        logits
    }

    fn weights_to_logits(weights: &[(u32, f32)]) -> Vec<f32> {
        let mut logits = vec![0.0; VOCAB]; // weight 1 elsewhere
        for &(token, weight) in weights {
            logits[token as usize] = weight.ln();
        }
        logits
    }

    fn greedy() -> GenerationParams {
        GenerationParams {
            num_beams: 1,
            repetition_penalty: 1.0,
            ..GenerationParams::default()
        }
    }

    #[test]
    fn test_greedy_stops_at_end_and_pads_finished_rows() {
        let decoder = ScriptedDecoder {
            script: |item: u32, prefix: &[u32]| match (item, prefix) {
                (0, [_]) => pick(5),
                (0, [_, 5]) => pick(TOKENS.end),
                (1, [_]) => pick(6),
                (1, [_, 6]) => pick(7),
                (1, [_, 6, 7]) => pick(TOKENS.end),
                _ => pick(3),
            },
        };
        let out = generate(&decoder, &memory(2), TOKENS, &greedy()).unwrap();
        assert_eq!(out, vec![vec![0, 5, 1, 2], vec![0, 6, 7, 1]]);

        let (flat, len) = pad_sequences(&out, TOKENS.pad);
        assert_eq!(len, 4);
        assert_eq!(flat.len(), 8);
    }

    #[test]
    fn test_generation_respects_max_length() {
        let decoder = ScriptedDecoder {
            script: |_: u32, _: &[u32]| pick(4),
        };
        let params = GenerationParams {
            max_length: 6,
            ..greedy()
        };
        let out = generate(&decoder, &memory(1), TOKENS, &params).unwrap();
        assert_eq!(out[0].len(), 6);

        let beam = GenerationParams {
            max_length: 6,
            num_beams: 3,
            ..greedy()
        };
        let out = generate(&decoder, &memory(1), TOKENS, &beam).unwrap();
        assert_eq!(out[0].len(), 6);
    }

    #[test]
    fn test_repetition_penalty_changes_greedy_choice() {
        let decoder = ScriptedDecoder {
            script: |_: u32, _: &[u32]| {
                let mut logits = vec![0.0; VOCAB];
                logits[4] = 2.0;
                logits[5] = 1.5;
                logits
            },
        };
        let plain = GenerationParams {
            max_length: 4,
            ..greedy()
        };
        let out = generate(&decoder, &memory(1), TOKENS, &plain).unwrap();
        assert_eq!(out[0], vec![0, 4, 4, 4]);

        let penalized = GenerationParams {
            repetition_penalty: 2.0,
            ..plain
        };
        let out = generate(&decoder, &memory(1), TOKENS, &penalized).unwrap();
        // 4 → (4 halved to 1.0 < 1.5) 5 → (1.0 vs 0.75) 4
        assert_eq!(out[0], vec![0, 4, 5, 4]);
    }

    #[test]
    fn test_min_length_suppresses_end_token() {
        let decoder = ScriptedDecoder {
            script: |_: u32, _: &[u32]| {
                let mut logits = pick(TOKENS.end);
                logits[6] = 5.0;
                logits
            },
        };
        let params = GenerationParams {
            min_length: 3,
            ..greedy()
        };
        let out = generate(&decoder, &memory(1), TOKENS, &params).unwrap();
        assert_eq!(out[0], vec![0, 6, 6, 1]);
    }

    #[test]
    fn test_beam_search_beats_greedy() {
        let script = |_: u32, prefix: &[u32]| match prefix {
            [_] => weights_to_logits(&[(3, 50.0), (4, 40.0)]),
            [_, 3] => weights_to_logits(&[(TOKENS.end, 32.0), (5, 30.0), (6, 30.0)]),
            [_, 4] => weights_to_logits(&[(TOKENS.end, 90.0)]),
            _ => pick(TOKENS.end),
        };
        let decoder = ScriptedDecoder { script };

        let out = generate(&decoder, &memory(1), TOKENS, &greedy()).unwrap();
        assert_eq!(out[0], vec![0, 3, 1]);

        let beam = GenerationParams {
            num_beams: 2,
            ..greedy()
        };
        let out = generate(&decoder, &memory(1), TOKENS, &beam).unwrap();
        assert_eq!(out[0], vec![0, 4, 1]);
    }

    #[test]
    fn test_beam_search_items_are_independent() {
        let decoder = ScriptedDecoder {
            script: |item: u32, prefix: &[u32]| match prefix.len() {
                1 => pick(3 + item),
                _ => pick(TOKENS.end),
            },
        };
        let params = GenerationParams {
            repetition_penalty: 1.0,
            ..GenerationParams::default()
        };
        let out = generate(&decoder, &memory(3), TOKENS, &params).unwrap();
        assert_eq!(out, vec![vec![0, 3, 1], vec![0, 4, 1], vec![0, 5, 1]]);
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let decoder = ScriptedDecoder {
            script: |_: u32, _: &[u32]| vec![0.0, -1.0, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5],
        };
        let params = GenerationParams {
            do_sample: true,
            seed: Some(42),
            max_length: 10,
            ..greedy()
        };
        let first = generate(&decoder, &memory(2), TOKENS, &params).unwrap();
        let second = generate(&decoder, &memory(2), TOKENS, &params).unwrap();
        assert_eq!(first, second);
        assert!(first.iter().all(|s| s[0] == TOKENS.start));
    }

    #[test]
    fn test_top_k_orders_best_first() {
        assert_eq!(top_k(&[0.1, 0.9, 0.5, 0.7], 3), vec![1, 3, 2]);
        assert_eq!(top_k(&[0.1], 4), vec![0]);
    }

    #[test]
    fn test_log_softmax_normalizes() {
        let lp = log_softmax(&[1.0, 2.0, 3.0]);
        let total: f32 = lp.iter().map(|l| l.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }
}
