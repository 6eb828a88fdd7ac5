//! Autoregressive decoding on top of an [`InferenceBackend`].
//!
//! Greedy and sampled decoding keep one sequence. Beam search and beam
//! sampling keep `num_beams` live sequences and a bounded set of finished
//! hypotheses ranked by `sum_logprobs / generated_len^length_penalty`.

use genqueue_backend::{InferenceBackend, SequenceState};
use genqueue_common::generation::{DecodingStrategy, GenerationConfig};
use genqueue_common::{GenqueueError, Result};
use rand::Rng;

use crate::sampler::{argmax, log_softmax, sample_distinct, sample_index, softmax, top_k_indices, warp};

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Prompt followed by the generated tokens (EOS included when emitted).
    pub tokens: Vec<u32>,
    pub prompt_len: usize,
    /// Sum of log-probabilities of the generated tokens.
    pub score: f32,
}

impl Generation {
    pub fn new_tokens(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedText {
    pub text: String,
    pub prompt_tokens: usize,
    pub new_tokens: usize,
    pub score: f32,
}

pub fn generate<R: Rng + ?Sized>(
    backend: &dyn InferenceBackend,
    prompt: &[u32],
    cfg: &GenerationConfig,
    eos: Option<u32>,
    rng: &mut R,
) -> Result<Generation> {
    cfg.validate()?;
    if prompt.is_empty() {
        return Err(GenqueueError::Message("cannot generate from an empty token sequence".into()));
    }
    match cfg.strategy() {
        DecodingStrategy::Greedy => single_sequence(backend, prompt, cfg, eos, None::<&mut R>),
        DecodingStrategy::Sample => single_sequence(backend, prompt, cfg, eos, Some(rng)),
        DecodingStrategy::BeamSearch { num_beams } => beam_search(backend, prompt, cfg, num_beams, eos, None::<&mut R>),
        DecodingStrategy::BeamSample { num_beams } => beam_search(backend, prompt, cfg, num_beams, eos, Some(rng)),
    }
}

/// Tokenizes `prompt`, generates, and decodes the whole sequence with
/// special tokens removed and surrounding whitespace trimmed.
pub fn generate_text<R: Rng + ?Sized>(
    backend: &dyn InferenceBackend,
    prompt: &str,
    cfg: &GenerationConfig,
    bos_override: Option<u32>,
    rng: &mut R,
) -> Result<GeneratedText> {
    let special = backend.special_tokens().with_bos_override(bos_override);
    let mut tokens = backend.tokenize(prompt, false)?;
    if let Some(bos) = special.bos {
        tokens.insert(0, bos);
    }
    let generation = generate(backend, &tokens, cfg, special.eos, rng)?;
    let visible: Vec<u32> = generation.tokens.iter().copied().filter(|t| !special.is_special(*t)).collect();
    let text = backend.detokenize(&visible, true)?.trim().to_string();
    Ok(GeneratedText {
        text,
        prompt_tokens: generation.prompt_len,
        new_tokens: generation.new_tokens().len(),
        score: generation.score,
    })
}

fn next_logits(backend: &dyn InferenceBackend, sequences: &[SequenceState]) -> Result<Vec<Vec<f32>>> {
    let out = backend.forward(sequences)?;
    if out.logits.len() != sequences.len() {
        return Err(GenqueueError::Backend(format!(
            "backend returned {} logit rows for {} sequences",
            out.logits.len(),
            sequences.len()
        )));
    }
    Ok(out.logits)
}

fn single_sequence<R: Rng + ?Sized>(
    backend: &dyn InferenceBackend,
    prompt: &[u32],
    cfg: &GenerationConfig,
    eos: Option<u32>,
    mut rng: Option<&mut R>,
) -> Result<Generation> {
    let mut seq = SequenceState::new(prompt.to_vec());
    let mut score = 0.0_f32;
    for _ in 0..cfg.max_new_tokens {
        let mut logits = next_logits(backend, std::slice::from_ref(&seq))?.remove(0);
        let token = match rng.as_deref_mut() {
            Some(rng) => {
                warp(&mut logits, cfg);
                sample_index(&softmax(&logits), rng)
            }
            None => argmax(&logits),
        };
        score += log_softmax(&logits)[token];
        seq.tokens.push(token as u32);
        if Some(token as u32) == eos {
            break;
        }
    }
    Ok(Generation { tokens: seq.tokens, prompt_len: prompt.len(), score })
}

struct Beam {
    seq: SequenceState,
    score: f32,
}

struct Hypotheses {
    num_beams: usize,
    length_penalty: f32,
    early_stopping: bool,
    /// (normalized score, sum of log-probs, tokens)
    entries: Vec<(f32, f32, Vec<u32>)>,
}

impl Hypotheses {
    fn new(num_beams: usize, length_penalty: f32, early_stopping: bool) -> Self {
        Self { num_beams, length_penalty, early_stopping, entries: Vec::with_capacity(num_beams + 1) }
    }

    fn normalize(&self, sum_logprobs: f32, generated_len: usize) -> f32 {
        sum_logprobs / (generated_len.max(1) as f32).powf(self.length_penalty)
    }

    fn worst(&self) -> f32 {
        self.entries.iter().map(|e| e.0).fold(f32::INFINITY, f32::min)
    }

    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32, generated_len: usize) {
        let score = self.normalize(sum_logprobs, generated_len);
        if self.entries.len() < self.num_beams || score > self.worst() {
            self.entries.push((score, sum_logprobs, tokens));
            if self.entries.len() > self.num_beams {
                let worst = (0..self.entries.len())
                    .min_by(|&a, &b| self.entries[a].0.total_cmp(&self.entries[b].0))
                    .unwrap_or(0);
                self.entries.remove(worst);
            }
        }
    }

    /// No continuation can still improve on the finished set.
    fn is_done(&self, best_sum_logprobs: f32, generated_len: usize) -> bool {
        if self.entries.len() < self.num_beams {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        self.worst() >= self.normalize(best_sum_logprobs, generated_len)
    }

    fn best(self) -> Option<(f32, Vec<u32>)> {
        self.entries
            .into_iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, sum, tokens)| (sum, tokens))
    }
}

/// (total score, parent beam, token)
type Candidate = (f32, usize, u32);

fn beam_candidates<R: Rng + ?Sized>(
    beams: &[Beam],
    rows: Vec<Vec<f32>>,
    cfg: &GenerationConfig,
    want: usize,
    rng: Option<&mut R>,
) -> Vec<Candidate> {
    match rng {
        None => {
            let mut candidates: Vec<Candidate> = Vec::with_capacity(beams.len() * want);
            for (b, (beam, row)) in beams.iter().zip(rows).enumerate() {
                let lp = log_softmax(&row);
                for t in top_k_indices(&lp, want) {
                    candidates.push((beam.score + lp[t], b, t as u32));
                }
            }
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
            candidates.truncate(want);
            candidates
        }
        Some(rng) => {
            let mut flat: Vec<Candidate> = Vec::new();
            for (b, (beam, mut row)) in beams.iter().zip(rows).enumerate() {
                warp(&mut row, cfg);
                let lp = log_softmax(&row);
                flat.extend(
                    lp.iter()
                        .enumerate()
                        .filter(|(_, l)| l.is_finite())
                        .map(|(t, l)| (beam.score + l, b, t as u32)),
                );
            }
            let totals: Vec<f32> = flat.iter().map(|c| c.0).collect();
            let mut candidates: Vec<Candidate> =
                sample_distinct(&softmax(&totals), want, rng).into_iter().map(|i| flat[i]).collect();
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
            candidates
        }
    }
}

/// Splits ranked candidates into finished hypotheses and the next live
/// beams. EOS only finishes a hypothesis from the top `num_beams` ranks.
fn advance(
    beams: &[Beam],
    candidates: &[Candidate],
    num_beams: usize,
    eos: Option<u32>,
    hyps: &mut Hypotheses,
    generated_len: usize,
) -> Vec<Beam> {
    let mut next = Vec::with_capacity(num_beams);
    for (rank, &(total, parent, token)) in candidates.iter().enumerate() {
        if Some(token) == eos {
            if rank < num_beams {
                let mut tokens = beams[parent].seq.tokens.clone();
                tokens.push(token);
                hyps.add(tokens, total, generated_len);
            }
        } else {
            let mut seq = beams[parent].seq.clone();
            seq.tokens.push(token);
            next.push(Beam { seq, score: total });
        }
        if next.len() == num_beams {
            break;
        }
    }
    next
}

fn beam_search<R: Rng + ?Sized>(
    backend: &dyn InferenceBackend,
    prompt: &[u32],
    cfg: &GenerationConfig,
    num_beams: usize,
    eos: Option<u32>,
    mut rng: Option<&mut R>,
) -> Result<Generation> {
    let prompt_len = prompt.len();
    let mut hyps = Hypotheses::new(num_beams, cfg.length_penalty, cfg.early_stopping);
    // A single starting beam avoids scoring identical copies of the prompt.
    let mut beams = vec![Beam { seq: SequenceState::new(prompt.to_vec()), score: 0.0 }];
    let mut finished = false;

    for step in 0..cfg.max_new_tokens {
        let generated_len = step + 1;
        let sequences: Vec<SequenceState> = beams.iter().map(|b| b.seq.clone()).collect();
        let rows = next_logits(backend, &sequences)?;
        let candidates = beam_candidates(&beams, rows, cfg, 2 * num_beams, rng.as_deref_mut());

        // Stop check uses the best candidate of this step, finished or not.
        let best_candidate = candidates.first().map(|c| c.0).unwrap_or(f32::NEG_INFINITY);
        beams = advance(&beams, &candidates, num_beams, eos, &mut hyps, generated_len);
        if beams.is_empty() || hyps.is_done(best_candidate, generated_len) {
            tracing::debug!(target: "decode", "beam search finished at step {step}");
            finished = true;
            break;
        }
    }

    if !finished {
        for beam in beams {
            let generated_len = beam.seq.tokens.len() - prompt_len;
            hyps.add(beam.seq.tokens, beam.score, generated_len);
        }
    }
    let (score, tokens) = hyps.best().ok_or_else(|| GenqueueError::Message("beam search produced no hypotheses".into()))?;
    Ok(Generation { tokens, prompt_len, score })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypotheses_keep_the_best_n() {
        let mut hyps = Hypotheses::new(2, 1.0, false);
        hyps.add(vec![1], -3.0, 1);
        hyps.add(vec![2], -1.0, 1);
        hyps.add(vec![3], -2.0, 1);
        assert_eq!(hyps.entries.len(), 2);
        assert_eq!(hyps.worst(), -2.0);
        assert!(hyps.is_done(-2.5, 1));
        assert!(!hyps.is_done(-0.5, 1));
        assert_eq!(hyps.best(), Some((-1.0, vec![2])));
    }

    #[test]
    fn low_ranked_eos_candidates_do_not_finish() {
        let beams = vec![
            Beam { seq: SequenceState::new(vec![1, 3]), score: -0.5 },
            Beam { seq: SequenceState::new(vec![1, 4]), score: -0.9 },
        ];
        let candidates: Vec<Candidate> = vec![(-0.6, 0, 2), (-1.4, 1, 0), (-1.8, 1, 2), (-2.8, 0, 5)];
        let mut hyps = Hypotheses::new(2, 1.0, false);
        let next = advance(&beams, &candidates, 2, Some(2), &mut hyps, 2);

        assert_eq!(hyps.entries.len(), 1);
        assert_eq!(hyps.entries[0].2, vec![1, 3, 2]);
        let live: Vec<Vec<u32>> = next.into_iter().map(|b| b.seq.tokens).collect();
        assert_eq!(live, vec![vec![1, 4, 0], vec![1, 3, 5]]);
    }

    #[test]
    fn length_penalty_normalizes_by_generated_length() {
        let hyps = Hypotheses::new(1, 1.0, false);
        assert_eq!(hyps.normalize(-4.0, 4), -1.0);
        let flat = Hypotheses::new(1, 0.0, false);
        assert_eq!(flat.normalize(-4.0, 4), -4.0);
    }
}
