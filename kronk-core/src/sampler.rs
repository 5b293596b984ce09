//! Sampler chain: turns request parameters into a configured token picker.
//!
//! The chain applies, in order: repetition penalties (plus DRY when
//! enabled), top-k, top-p, min-p, optional XTC culling, temperature, and a
//! final multinomial draw. All stages run on the CPU over the raw logits
//! row. Each slot or request owns its chain; sampler state is never shared.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::Token;
use crate::request::Params;

/// Token picker configured from request parameters.
pub struct SamplerChain {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    min_p: f32,
    repeat_penalty: f32,
    repeat_last_n: usize,
    dry_multiplier: f32,
    dry_base: f32,
    dry_allowed_length: usize,
    dry_penalty_last_n: usize,
    xtc_probability: f32,
    xtc_threshold: f32,
    xtc_min_keep: usize,
    rng: StdRng,
    recent: Vec<Token>,
}

impl SamplerChain {
    /// Build a chain from adjusted parameters. `seq_offset` perturbs the
    /// seed so concurrent slots draw independent streams.
    pub fn new(params: &Params, seq_offset: u64) -> Self {
        Self {
            temperature: params.temperature,
            top_k: params.top_k.max(0) as usize,
            top_p: params.top_p,
            min_p: params.min_p,
            repeat_penalty: params.repeat_penalty,
            repeat_last_n: params.repeat_last_n,
            dry_multiplier: params.dry_multiplier,
            dry_base: params.dry_base,
            dry_allowed_length: params.dry_allowed_length,
            dry_penalty_last_n: params.dry_penalty_last_n,
            xtc_probability: params.xtc_probability,
            xtc_threshold: params.xtc_threshold,
            xtc_min_keep: params.xtc_min_keep.max(1),
            rng: StdRng::seed_from_u64(params.seed.wrapping_add(seq_offset)),
            recent: Vec::new(),
        }
    }

    /// Record a sampled token so the penalty stages see it.
    pub fn accept(&mut self, token: Token) {
        self.recent.push(token);
        let window = self.penalty_window();
        if self.recent.len() > window {
            let excess = self.recent.len() - window;
            self.recent.drain(..excess);
        }
    }

    /// Reset per-request state, keeping the configuration.
    pub fn reset(&mut self) {
        self.recent.clear();
    }

    fn penalty_window(&self) -> usize {
        let dry_window = if self.dry_multiplier > 0.0 {
            if self.dry_penalty_last_n == 0 {
                4096
            } else {
                self.dry_penalty_last_n
            }
        } else {
            0
        };
        self.repeat_last_n.max(dry_window).max(1)
    }

    /// Pick the next token from a logits row.
    pub fn sample(&mut self, logits: &mut [f32]) -> Token {
        self.apply_repeat_penalty(logits);
        if self.dry_multiplier > 0.0 {
            self.apply_dry(logits);
        }

        if self.temperature <= 0.0 {
            return argmax(logits);
        }

        // Candidate list survives the truncation stages.
        let mut candidates: Vec<(usize, f32)> =
            logits.iter().copied().enumerate().collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if self.top_k > 0 && self.top_k < candidates.len() {
            candidates.truncate(self.top_k);
        }

        let mut probs = softmax(&candidates);

        if self.top_p > 0.0 && self.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            let mut cutoff = probs.len();
            for (i, p) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= self.top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            candidates.truncate(cutoff);
            probs.truncate(cutoff);
        }

        if self.min_p > 0.0 && !probs.is_empty() {
            let floor = probs[0] * self.min_p;
            let keep = probs.iter().take_while(|p| **p >= floor).count().max(1);
            candidates.truncate(keep);
            probs.truncate(keep);
        }

        if self.xtc_probability > 0.0 && self.rng.gen::<f32>() < self.xtc_probability {
            // Remove every token above the threshold except the least
            // probable of them, never dropping below min_keep candidates.
            let above = probs.iter().take_while(|p| **p >= self.xtc_threshold).count();
            if above >= 2 {
                let cut = (above - 1).min(candidates.len().saturating_sub(self.xtc_min_keep));
                if cut > 0 {
                    candidates.drain(..cut);
                    probs.drain(..cut);
                }
            }
        }

        // Temperature rescale over the surviving candidates, then draw.
        let rescaled: Vec<(usize, f32)> = candidates
            .iter()
            .map(|(idx, logit)| (*idx, logit / self.temperature))
            .collect();
        let probs = softmax(&rescaled);

        let r: f32 = self.rng.gen();
        let mut cumulative = 0.0f32;
        for (i, p) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative >= r {
                return rescaled[i].0 as Token;
            }
        }

        rescaled.last().map(|(idx, _)| *idx as Token).unwrap_or(0)
    }

    fn apply_repeat_penalty(&self, logits: &mut [f32]) {
        if self.repeat_penalty == 1.0 || self.recent.is_empty() {
            return;
        }

        let start = self.recent.len().saturating_sub(self.repeat_last_n);
        for &token in &self.recent[start..] {
            let Some(logit) = logits.get_mut(token as usize) else {
                continue;
            };
            if *logit > 0.0 {
                *logit /= self.repeat_penalty;
            } else {
                *logit *= self.repeat_penalty;
            }
        }
    }

    /// DRY repetition penalty: a candidate that would extend an n-gram
    /// already present in the recent window is penalized exponentially in
    /// the length of the repeated run.
    fn apply_dry(&self, logits: &mut [f32]) {
        let window_start = if self.dry_penalty_last_n > 0 {
            self.recent.len().saturating_sub(self.dry_penalty_last_n)
        } else {
            0
        };
        let window = &self.recent[window_start..];
        if window.len() < self.dry_allowed_length {
            return;
        }

        for pos in 0..window.len().saturating_sub(1) {
            // Length of the match between the window suffix and the run
            // ending at `pos`.
            let mut len = 0usize;
            while len <= pos
                && len < window.len() - 1
                && window[pos - len] == window[window.len() - 1 - len]
            {
                len += 1;
            }

            if len >= self.dry_allowed_length {
                let candidate = window[pos + 1] as usize;
                if let Some(logit) = logits.get_mut(candidate) {
                    let exponent = (len - self.dry_allowed_length) as f32;
                    *logit -= self.dry_multiplier * self.dry_base.powf(exponent);
                }
            }
        }
    }
}

fn argmax(logits: &[f32]) -> Token {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as Token)
        .unwrap_or(0)
}

fn softmax(candidates: &[(usize, f32)]) -> Vec<f32> {
    let max = candidates
        .iter()
        .map(|(_, l)| *l)
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = candidates.iter().map(|(_, l)| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 {
        return vec![0.0; candidates.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}
