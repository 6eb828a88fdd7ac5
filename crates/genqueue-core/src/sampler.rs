//! Logits warpers and token sampling.
//!
//! Filtered entries are set to `-inf` so the remaining mass renormalizes in
//! the following softmax.

use genqueue_common::generation::GenerationConfig;
use rand::prelude::*;

pub fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    let t = temperature.max(1e-4);
    if t != 1.0 {
        logits.iter_mut().for_each(|l| *l /= t);
    }
}

/// Keeps every logit at least as large as the k-th largest one.
pub fn apply_top_k(logits: &mut [f32], top_k: usize) {
    if top_k == 0 || top_k >= logits.len() {
        return;
    }
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let threshold = sorted[top_k - 1];
    logits.iter_mut().filter(|l| **l < threshold).for_each(|l| *l = f32::NEG_INFINITY);
}

/// Keeps the smallest high-probability prefix whose mass reaches `top_p`.
pub fn apply_top_p(logits: &mut [f32], top_p: f32) {
    if top_p >= 1.0 || logits.is_empty() {
        return;
    }
    let probs = softmax(logits);
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    let mut acc = 0.0_f32;
    let mut keep = 0;
    for &i in &order {
        keep += 1;
        acc += probs[i];
        if acc >= top_p {
            break;
        }
    }
    for &i in &order[keep..] {
        logits[i] = f32::NEG_INFINITY;
    }
}

/// Temperature, then top-k, then top-p.
pub fn warp(logits: &mut [f32], cfg: &GenerationConfig) {
    apply_temperature(logits, cfg.temperature);
    apply_top_k(logits, cfg.top_k);
    apply_top_p(logits, cfg.top_p);
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![1.0 / logits.len().max(1) as f32; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let lse = max + logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln();
    logits.iter().map(|&l| l - lse).collect()
}

pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Indices of the `k` largest values, largest first; ties keep index order.
pub fn top_k_indices(values: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    order.truncate(k);
    order
}

/// Draws one index from a probability vector.
pub fn sample_index<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> usize {
    let total: f32 = probs.iter().sum();
    if !(total > 0.0) {
        return argmax(probs);
    }
    let r: f32 = rng.gen::<f32>() * total;
    let mut acc = 0.0_f32;
    let mut last = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        acc += p;
        last = i;
        if r < acc {
            return i;
        }
    }
    last
}

/// Draws up to `n` distinct indices, proportionally to `probs`.
pub fn sample_distinct<R: Rng + ?Sized>(probs: &[f32], n: usize, rng: &mut R) -> Vec<usize> {
    let mut remaining = probs.to_vec();
    let mut picked = Vec::with_capacity(n);
    while picked.len() < n && remaining.iter().any(|&p| p > 0.0) {
        let i = sample_index(&remaining, rng);
        picked.push(i);
        remaining[i] = 0.0;
    }
    picked
}

pub fn sample_top_k_top_p<R: Rng + ?Sized>(
    logits: &[f32],
    top_k: usize,
    top_p: f32,
    temperature: f32,
    rng: &mut R,
) -> usize {
    if logits.is_empty() {
        return 0;
    }
    let mut warped = logits.to_vec();
    apply_temperature(&mut warped, temperature);
    apply_top_k(&mut warped, top_k);
    apply_top_p(&mut warped, top_p);
    sample_index(&softmax(&warped), rng)
}
