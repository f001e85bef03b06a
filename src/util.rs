//! Small numeric helpers used around training loops.

use std::collections::VecDeque;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::tensor::Tensor;

/// Discounted return per step: `G_t = r_t + gamma * G_{t+1}`.
pub fn discounted_rewards(rewards: &[f32], gamma: f32) -> Vec<f32> {
    let mut out = vec![0.0; rewards.len()];
    let mut acc = 0.0;
    for (i, &r) in rewards.iter().enumerate().rev() {
        acc = r + gamma * acc;
        out[i] = acc;
    }
    out
}

/// Cosine similarity over all elements; 0 when either operand is zero.
pub fn cosine_similarity(a: &Tensor, b: &Tensor) -> f32 {
    let dot = a.dot_flat(b);
    let na = a.dot_flat(a).sqrt();
    let nb = b.dot_flat(b).sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Draw an index with probability proportional to its weight.
pub fn random_choice<R: Rng>(rng: &mut R, weights: &[f32]) -> Option<usize> {
    let dist = WeightedIndex::new(weights).ok()?;
    Some(dist.sample(rng))
}

/// Simple moving average over a fixed window.
pub struct Sma {
    window: usize,
    values: VecDeque<f32>,
    sum: f32,
}

impl Sma {
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "SMA window must be positive");
        Self {
            window,
            values: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    pub fn update(&mut self, value: f32) -> f32 {
        self.values.push_back(value);
        self.sum += value;
        if self.values.len() > self.window {
            self.sum -= self.values.pop_front().expect("non-empty");
        }
        self.value()
    }

    pub fn value(&self) -> f32 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f32
        }
    }
}

/// Exponential moving average with smoothing factor alpha.
pub struct Ema {
    alpha: f32,
    state: Option<f32>,
}

impl Ema {
    pub fn new(alpha: f32) -> Self {
        Self { alpha, state: None }
    }

    pub fn update(&mut self, value: f32) -> f32 {
        let next = match self.state {
            None => value,
            Some(prev) => self.alpha * value + (1.0 - self.alpha) * prev,
        };
        self.state = Some(next);
        next
    }

    pub fn value(&self) -> f32 {
        self.state.unwrap_or(0.0)
    }
}

/// Simple moving average of a slice: element i averages the trailing
/// window ending at i. Agrees with feeding the slice through `Sma`.
pub fn sma(values: &[f32], window: usize) -> Vec<f32> {
    let mut state = Sma::new(window);
    values.iter().map(|&v| state.update(v)).collect()
}

/// Exponential moving average of a slice, seeded at the first sample.
pub fn ema(values: &[f32], alpha: f32) -> Vec<f32> {
    let mut state = Ema::new(alpha);
    values.iter().map(|&v| state.update(v)).collect()
}

/// Linearly weighted moving average of a slice over a trailing window.
pub fn wma(values: &[f32], window: usize) -> Vec<f32> {
    let mut state = Wma::new(window);
    values.iter().map(|&v| state.update(v)).collect()
}

/// Linearly weighted moving average; the newest sample weighs most.
pub struct Wma {
    window: usize,
    values: VecDeque<f32>,
}

impl Wma {
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "WMA window must be positive");
        Self {
            window,
            values: VecDeque::with_capacity(window),
        }
    }

    pub fn update(&mut self, value: f32) -> f32 {
        self.values.push_back(value);
        if self.values.len() > self.window {
            self.values.pop_front();
        }
        self.value()
    }

    pub fn value(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut num = 0.0;
        let mut den = 0.0;
        for (i, &v) in self.values.iter().enumerate() {
            let w = (i + 1) as f32;
            num += w * v;
            den += w;
        }
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn discounted_rewards_accumulate_backwards() {
        let g = discounted_rewards(&[1.0, 1.0, 1.0], 0.5);
        assert!((g[2] - 1.0).abs() < 1e-6);
        assert!((g[1] - 1.5).abs() < 1e-6);
        assert!((g[0] - 1.75).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_of_parallel_vectors_is_one() {
        let a = Tensor::from_vec(1, 3, vec![1.0, 2.0, 3.0]).unwrap();
        let b = Tensor::from_vec(1, 3, vec![2.0, 4.0, 6.0]).unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        let c = Tensor::from_vec(1, 3, vec![0.0, 0.0, 0.0]).unwrap();
        assert_eq!(cosine_similarity(&a, &c), 0.0);
    }

    #[test]
    fn sma_tracks_the_window_mean() {
        let mut sma = Sma::new(2);
        sma.update(1.0);
        sma.update(3.0);
        assert!((sma.value() - 2.0).abs() < 1e-6);
        sma.update(5.0);
        assert!((sma.value() - 4.0).abs() < 1e-6);
    }

    #[test]
    fn ema_starts_at_the_first_sample() {
        let mut ema = Ema::new(0.5);
        assert_eq!(ema.update(4.0), 4.0);
        assert!((ema.update(0.0) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn wma_weighs_recent_samples_more() {
        let mut wma = Wma::new(3);
        wma.update(1.0);
        wma.update(1.0);
        let heavy = wma.update(10.0);
        assert!(heavy > 4.0);
    }

    #[test]
    fn slice_forms_match_the_incremental_ones() {
        let samples = [1.0, 3.0, 5.0, 2.0, -4.0];

        let by_slice = sma(&samples, 3);
        let mut state = Sma::new(3);
        for (&v, &s) in samples.iter().zip(&by_slice) {
            assert!((state.update(v) - s).abs() < 1e-6);
        }
        assert!((by_slice[1] - 2.0).abs() < 1e-6);
        assert!((by_slice[2] - 3.0).abs() < 1e-6);

        let by_slice = ema(&samples, 0.5);
        let mut state = Ema::new(0.5);
        for (&v, &s) in samples.iter().zip(&by_slice) {
            assert!((state.update(v) - s).abs() < 1e-6);
        }
        assert_eq!(by_slice[0], 1.0);

        let by_slice = wma(&samples, 3);
        let mut state = Wma::new(3);
        for (&v, &s) in samples.iter().zip(&by_slice) {
            assert!((state.update(v) - s).abs() < 1e-6);
        }
    }

    #[test]
    fn random_choice_respects_degenerate_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(random_choice(&mut rng, &[0.0, 1.0, 0.0]), Some(1));
        }
        assert_eq!(random_choice(&mut rng, &[0.0, 0.0]), None);
    }
}
