//! Weighted resampling via the alias method.
//!
//! O(k) preprocessing, O(1) per draw. Construction normalizes the weights so
//! the mean is 1, splits indices into "under one" and "over one" buckets,
//! and transfers probability mass until every slot holds an acceptance
//! threshold <= 1 plus at most one alias index.

use rand::Rng;

#[derive(Debug, Clone)]
pub struct AliasTable {
    thresholds: Vec<f64>,
    alias: Vec<usize>,
}

impl AliasTable {
    /// Build a table from nonnegative weights. Returns `None` for an empty
    /// slice or a non-finite/zero total.
    pub fn new(weights: &[f64]) -> Option<Self> {
        let n = weights.len();
        let total: f64 = weights.iter().sum();
        if n == 0 || !total.is_finite() || total <= 0.0 {
            return None;
        }

        let coef = n as f64 / total;
        let mut thresholds: Vec<f64> = weights.iter().map(|w| w * coef).collect();
        let mut alias = vec![0usize; n];
        let mut small = Vec::with_capacity(n);
        let mut large = Vec::with_capacity(n);
        for (i, threshold) in thresholds.iter().enumerate() {
            if *threshold <= 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        while let (Some(&i_small), Some(&i_large)) = (small.last(), large.last()) {
            small.pop();
            alias[i_small] = i_large;
            thresholds[i_large] += thresholds[i_small] - 1.0;
            if thresholds[i_large] <= 1.0 {
                large.pop();
                small.push(i_large);
            }
        }
        // Leftovers on either side are full slots; pin them to 1 to absorb
        // accumulated rounding error.
        for i in small {
            thresholds[i] = 1.0;
        }
        for i in large {
            thresholds[i] = 1.0;
        }

        Some(Self { thresholds, alias })
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    /// Draw one index, distributed proportionally to the construction
    /// weights.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let i = rng.gen_range(0..self.thresholds.len());
        if rng.r#gen::<f64>() < self.thresholds[i] {
            i
        } else {
            self.alias[i]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn rejects_degenerate_weights() {
        assert!(AliasTable::new(&[]).is_none());
        assert!(AliasTable::new(&[0.0, 0.0]).is_none());
        assert!(AliasTable::new(&[f64::NAN]).is_none());
    }

    #[test]
    fn single_weight_always_wins() {
        let table = AliasTable::new(&[3.5]).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert_eq!(table.sample(&mut rng), 0);
        }
    }

    #[test]
    fn frequencies_follow_weights() {
        // 1:2:3 within 5% over many draws.
        let table = AliasTable::new(&[1.0, 2.0, 3.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let n = 120_000;
        let mut counts = [0u32; 3];
        for _ in 0..n {
            counts[table.sample(&mut rng)] += 1;
        }
        for (i, expected) in [1.0 / 6.0, 2.0 / 6.0, 3.0 / 6.0].iter().enumerate() {
            let observed = counts[i] as f64 / n as f64;
            let relative = (observed - expected).abs() / expected;
            assert!(
                relative < 0.05,
                "index {i}: observed {observed:.4}, expected {expected:.4}"
            );
        }
    }

    #[test]
    fn extreme_skew_still_samples_everything() {
        let table = AliasTable::new(&[1e-6, 1.0, 1e6]).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut seen = [false; 3];
        for _ in 0..1_000_000 {
            seen[table.sample(&mut rng)] = true;
        }
        // The heavy index dominates; the middle one must still show up.
        assert!(seen[1]);
        assert!(seen[2]);
    }
}
