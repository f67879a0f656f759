//! Answer token selection.
//!
//! FiD answers are short extractive spans, so greedy decoding is the default.
//! Stochastic decoding is available for sampling several candidate answers:
//!
//! ```text
//! Logits [batch, vocab_size]
//!     │
//!     ▼ temperature == 0 → argmax
//! Logits / temperature
//!     │
//!     ▼ Top-k filtering (optional)
//! Softmax over the survivors
//!     │
//!     ▼ Top-p filtering (optional)
//! Renormalize + draw from the seeded RNG
//! ```

use candle_core::{DType, Result, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingConfig;

/// Picks one token per row of last-position logits.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// Creates a sampler; a configured seed makes draws reproducible.
    pub fn new(config: &SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng,
        }
    }

    /// Greedy sampler.
    pub fn greedy() -> Self {
        Self::new(&SamplingConfig::default())
    }

    /// Whether tokens are chosen by argmax.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Samples tokens from logits.
    ///
    /// # Arguments
    ///
    /// * `logits` - [vocab_size] or [batch, vocab_size]
    ///
    /// # Returns
    ///
    /// One token ID per row
    pub fn sample(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        let rows: Vec<Vec<f32>> = match logits.rank() {
            1 => vec![logits.to_dtype(DType::F32)?.to_vec1()?],
            2 => logits.to_dtype(DType::F32)?.to_vec2()?,
            rank => candle_core::bail!("expected 1D or 2D logits, got {rank}D"),
        };
        rows.iter().map(|row| self.sample_row(row)).collect()
    }

    fn sample_row(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            candle_core::bail!("cannot sample from empty logits");
        }
        if self.is_greedy() {
            return Ok(argmax(logits));
        }

        // (token, scaled logit), best first
        let mut candidates: Vec<(u32, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (i as u32, l / self.temperature))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        if self.top_k > 0 {
            candidates.truncate(self.top_k);
        }

        let max_logit = candidates[0].1;
        let mut probs: Vec<f32> = candidates
            .iter()
            .map(|&(_, l)| (l - max_logit).exp())
            .collect();
        let total: f32 = probs.iter().sum();
        probs.iter_mut().for_each(|p| *p /= total);

        if self.top_p > 0.0 && self.top_p < 1.0 {
            let mut cumulative = 0.0;
            let cutoff = probs
                .iter()
                .position(|&p| {
                    cumulative += p;
                    cumulative > self.top_p
                })
                .map_or(probs.len(), |i| i + 1);
            probs.truncate(cutoff);
            candidates.truncate(cutoff);
        }

        let dist = WeightedIndex::new(&probs)
            .map_err(|e| candle_core::Error::Msg(format!("invalid sampling distribution: {e}")))?;
        Ok(candidates[dist.sample(&mut self.rng)].0)
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &l)| {
            if l > best.1 {
                (i, l)
            } else {
                best
            }
        })
        .0 as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]), 1);
        assert_eq!(argmax(&[f32::NEG_INFINITY, -1.0]), 1);
    }

    #[test]
    fn test_top_p_keeps_token_crossing_threshold() {
        let config = SamplingConfig {
            temperature: 1.0,
            top_p: 0.5,
            seed: Some(3),
            ..SamplingConfig::default()
        };
        let mut sampler = Sampler::new(&config);
        // Token 2 alone holds most of the mass.
        for _ in 0..20 {
            assert_eq!(sampler.sample_row(&[0.0, 0.0, 5.0, 0.0]).unwrap(), 2);
        }
    }
}
