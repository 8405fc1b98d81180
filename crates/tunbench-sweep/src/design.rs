//! Latin hypercube designs with the centred criterion.
//!
//! For `S` samples every dimension is split into `S` equal strata and each
//! stratum is hit exactly once, at its centre `(k + 0.5) / S`. The order of
//! the centres is an independent seeded permutation per dimension.

use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

/// A `samples × dims` matrix of normalized coordinates in `(0, 1)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Design {
    dims: usize,
    rows: Vec<Vec<f64>>,
}

impl Design {
    /// Draw a centred Latin hypercube. `seed` fully determines the result.
    pub fn latin_hypercube(samples: usize, dims: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::latin_hypercube_with(samples, dims, &mut rng)
    }

    pub fn latin_hypercube_with(samples: usize, dims: usize, rng: &mut StdRng) -> Self {
        let mut rows = vec![Vec::with_capacity(dims); samples];
        for _ in 0..dims {
            let mut strata: Vec<usize> = (0..samples).collect();
            shuffle(&mut strata, rng);
            for (row, k) in rows.iter_mut().zip(strata) {
                row.push(stratum_centre(k, samples));
            }
        }
        Self { dims, rows }
    }

    pub fn samples(&self) -> usize {
        self.rows.len()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.rows.iter().map(Vec::as_slice)
    }
}

pub fn stratum_centre(k: usize, samples: usize) -> f64 {
    (k as f64 + 0.5) / samples as f64
}

/// Index of the stratum containing `c` when `(0, 1)` is cut into `samples`.
pub fn stratum_of(c: f64, samples: usize) -> usize {
    ((c * samples as f64).floor() as usize).min(samples.saturating_sub(1))
}

// Fisher-Yates.
fn shuffle<T>(items: &mut [T], rng: &mut StdRng) {
    for i in (1..items.len()).rev() {
        let j = rng.random_range(0..=i);
        items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn centres() {
        assert_eq!(stratum_centre(0, 4), 0.125);
        assert_eq!(stratum_centre(3, 4), 0.875);
        assert_eq!(stratum_of(0.125, 4), 0);
        assert_eq!(stratum_of(0.875, 4), 3);
    }

    #[test]
    fn single_sample_is_the_midpoint() {
        let d = Design::latin_hypercube(1, 3, 7);
        assert_eq!(d.row(0), Some(&[0.5, 0.5, 0.5][..]));
    }

    #[test]
    fn deterministic_for_seed() {
        let a = Design::latin_hypercube(50, 5, 42);
        let b = Design::latin_hypercube(50, 5, 42);
        let c = Design::latin_hypercube(50, 5, 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn empty_design() {
        let d = Design::latin_hypercube(0, 4, 1);
        assert_eq!(d.samples(), 0);
        assert!(d.row(0).is_none());
    }

    proptest! {
        #[test]
        fn one_sample_per_stratum_per_dimension(
            samples in 1usize..120,
            dims in 1usize..8,
            seed in any::<u64>(),
        ) {
            let d = Design::latin_hypercube(samples, dims, seed);
            prop_assert_eq!(d.samples(), samples);
            for dim in 0..dims {
                let mut hit = vec![false; samples];
                for row in d.rows() {
                    prop_assert_eq!(row.len(), dims);
                    let c = row[dim];
                    prop_assert!(c > 0.0 && c < 1.0);
                    let k = stratum_of(c, samples);
                    prop_assert!(!hit[k], "stratum {} hit twice in dim {}", k, dim);
                    hit[k] = true;
                }
                prop_assert!(hit.iter().all(|&h| h));
            }
        }
    }
}
