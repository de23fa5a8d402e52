//! The Deterministic Draw Source.
//!
//! A single seeded stream of pseudorandom values owned by each grid and
//! threaded explicitly through the update engine. Replicas on different
//! machines must consume exactly the same values in exactly the same
//! order, so both the generator and the value derivations are pinned:
//!
//! - Generator: ChaCha8 (`rand_chacha`), seeded via `seed_from_u64`.
//!   Both are documented as value-stable across platforms and releases.
//! - Uniform: top 53 bits of one `u64` output, times 2^-53.
//! - Normal: Irwin-Hall sum of 12 uniforms minus 6. Only IEEE additions
//!   are involved, so the result is bit-identical everywhere (no `ln`,
//!   `cos` or table lookups whose last bit could differ per libm).

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// 2^-53, the spacing of the uniform draw lattice.
const UNIFORM_STEP: f64 = 1.0 / (1u64 << 53) as f64;

/// Number of uniforms summed per normal draw.
const IRWIN_HALL_TERMS: usize = 12;

/// Seeded, restartable-only-by-reseeding draw stream.
#[derive(Debug, Clone)]
pub struct DrawSource {
    /// Match seed this stream was created from
    seed: u32,

    /// Underlying generator
    rng: ChaCha8Rng,

    /// Number of logical draws handed out (uniform, normal and index each count once)
    consumed: u64,
}

impl DrawSource {
    /// Creates a draw source from a 32-bit match seed.
    pub fn new(seed: u32) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed as u64),
            consumed: 0,
        }
    }

    /// Returns the seed this source was created from.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Returns the number of logical draws consumed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Draws a uniform real in [0, 1).
    pub fn uniform(&mut self) -> f64 {
        self.consumed += 1;
        self.raw_uniform()
    }

    /// Draws an approximately standard-normal sample (mean 0, variance 1).
    ///
    /// Support is [-6, 6]; counts as one logical draw.
    pub fn normal(&mut self) -> f64 {
        self.consumed += 1;
        let mut sum = 0.0;
        for _ in 0..IRWIN_HALL_TERMS {
            sum += self.raw_uniform();
        }
        sum - 6.0
    }

    /// Draws an index in `0..len`. `len` must be non-zero.
    pub fn index(&mut self, len: usize) -> usize {
        debug_assert!(len > 0, "index draw over an empty range");
        let idx = (self.uniform() * len as f64) as usize;
        idx.min(len.saturating_sub(1))
    }

    fn raw_uniform(&mut self) -> f64 {
        (self.rng.next_u64() >> 11) as f64 * UNIFORM_STEP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = DrawSource::new(42);
        let mut b = DrawSource::new(42);

        for _ in 0..1000 {
            assert_eq!(a.uniform().to_bits(), b.uniform().to_bits());
            assert_eq!(a.normal().to_bits(), b.normal().to_bits());
            assert_eq!(a.index(7), b.index(7));
        }
        assert_eq!(a.consumed(), 3000);
    }

    #[test]
    fn test_different_seed_different_stream() {
        let mut a = DrawSource::new(1);
        let mut b = DrawSource::new(2);

        let same = (0..64).filter(|_| a.uniform() == b.uniform()).count();
        assert!(same < 2);
    }

    #[test]
    fn test_uniform_range() {
        let mut source = DrawSource::new(7);
        for _ in 0..10_000 {
            let u = source.uniform();
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn test_normal_moments() {
        let mut source = DrawSource::new(99);
        let n = 20_000;
        let samples: Vec<f64> = (0..n).map(|_| source.normal()).collect();

        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;

        assert!(mean.abs() < 0.05, "mean {}", mean);
        assert!((var - 1.0).abs() < 0.05, "variance {}", var);
        assert!(samples.iter().all(|x| x.abs() <= 6.0));
    }

    #[test]
    fn test_index_bounds() {
        let mut source = DrawSource::new(3);
        let mut seen = [false; 5];
        for _ in 0..500 {
            let i = source.index(5);
            assert!(i < 5);
            seen[i] = true;
        }
        assert!(seen.iter().all(|s| *s));
        assert_eq!(source.index(1), 0);
    }

    #[test]
    fn test_clone_forks_identically() {
        let mut original = DrawSource::new(11);
        original.uniform();
        let mut fork = original.clone();
        assert_eq!(original.uniform().to_bits(), fork.uniform().to_bits());
    }
}
