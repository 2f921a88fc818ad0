// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It drives neuron layout, parameter jitter and membrane noise, and its full
// state is part of the memory image so a resumed run draws the same numbers.

/// Complete generator state, including the cached second Gaussian deviate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrngState {
    pub state: u64,
    pub spare: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
    // Marsaglia polar draws come in pairs; the second one waits here.
    spare: Option<f64>,
}

const ZERO_STATE_REPLACEMENT: u64 = 0x9E3779B97F4A7C15;

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 {
            ZERO_STATE_REPLACEMENT
        } else {
            seed
        };
        Self {
            state: seed,
            spare: None,
        }
    }

    pub fn from_state(saved: PrngState) -> Self {
        let state = if saved.state == 0 {
            ZERO_STATE_REPLACEMENT
        } else {
            saved.state
        };
        Self {
            state,
            spare: saved.spare,
        }
    }

    pub fn state(&self) -> PrngState {
        PrngState {
            state: self.state,
            spare: self.spare,
        }
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform in [0, 1) with 53 bits of resolution.
    #[inline]
    pub fn next_f64_01(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    #[inline]
    pub fn gen_range_f64(&mut self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        low + (high - low) * self.next_f64_01()
    }

    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u64;
        let v = self.next_u64() % span;
        low + v as usize
    }

    /// Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.gen_range_usize(0, i + 1);
            items.swap(i, j);
        }
    }

    /// Standard normal deviate (mean 0, variance 1), Marsaglia polar method.
    pub fn next_gaussian(&mut self) -> f64 {
        if let Some(x2) = self.spare.take() {
            return x2;
        }
        loop {
            let v1 = 2.0 * self.next_f64_01() - 1.0;
            let v2 = 2.0 * self.next_f64_01() - 1.0;
            let w = v1 * v1 + v2 * v2;
            if w > 0.0 && w < 1.0 {
                let y = (-2.0 * w.ln() / w).sqrt();
                self.spare = Some(v2 * y);
                return v1 * y;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
            assert_eq!(a.next_gaussian().to_bits(), b.next_gaussian().to_bits());
        }
    }

    #[test]
    fn restored_state_continues_mid_pair() {
        let mut a = Prng::new(99);
        // Odd number of draws leaves a cached spare behind.
        a.next_gaussian();
        let saved = a.state();
        assert!(saved.spare.is_some());

        let mut b = Prng::from_state(saved);
        for _ in 0..17 {
            assert_eq!(a.next_gaussian().to_bits(), b.next_gaussian().to_bits());
        }
    }

    #[test]
    fn uniform_draws_stay_in_range() {
        let mut rng = Prng::new(3);
        for _ in 0..1000 {
            let x = rng.gen_range_f64(-2.0, 5.0);
            assert!((-2.0..5.0).contains(&x));
            let k = rng.gen_range_usize(4, 9);
            assert!((4..9).contains(&k));
        }
        assert_eq!(rng.gen_range_f64(1.5, 1.5), 1.5);
    }

    #[test]
    fn gaussian_moments_are_plausible() {
        let mut rng = Prng::new(11);
        let n = 20_000;
        let xs: Vec<f64> = (0..n).map(|_| rng.next_gaussian()).collect();
        let mean = xs.iter().sum::<f64>() / n as f64;
        let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "var {var}");
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = Prng::new(5);
        let mut v: Vec<usize> = (0..50).collect();
        rng.shuffle(&mut v);
        let mut sorted = v.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }
}
