//! Model-jump kernel.
//!
//! A particle keeps its model with probability `K`; otherwise it jumps
//! uniformly to one of the other models that are still alive. Dead models
//! are never proposed.

use rand::Rng;

fn candidates(num_models: usize, old: usize, dead: &[usize]) -> usize {
    (0..num_models)
        .filter(|m| *m != old && !dead.contains(m))
        .count()
}

/// Probability of proposing model `new` for a particle of model `old`.
///
/// Summed over all `new` this is one for any `old`, and it is zero for every
/// dead model other than `old` itself.
pub fn jump_density(
    new: usize,
    old: usize,
    num_models: usize,
    kernel: f64,
    dead: &[usize],
) -> f64 {
    let others = candidates(num_models, old, dead);
    if new == old {
        if others == 0 {
            1.
        } else {
            kernel
        }
    } else if new < num_models && !dead.contains(&new) {
        (1. - kernel) / others as f64
    } else {
        0.
    }
}

/// Draw a model for a particle of model `old`.
pub fn sample_jump<R: Rng + ?Sized>(
    old: usize,
    num_models: usize,
    kernel: f64,
    dead: &[usize],
    rng: &mut R,
) -> usize {
    let others = candidates(num_models, old, dead);
    if others == 0 || rng.random::<f64>() < kernel {
        return old;
    }
    let pick = rng.random_range(0..others);
    (0..num_models)
        .filter(|m| *m != old && !dead.contains(m))
        .nth(pick)
        .unwrap_or(old)
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn single_model_never_jumps() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(sample_jump(0, 1, 0.3, &[], &mut rng), 0);
        }
        assert_eq!(jump_density(0, 0, 1, 0.3, &[]), 1.);
    }

    #[test]
    fn dead_models_are_never_proposed() {
        let mut rng = StdRng::seed_from_u64(42);
        let dead = [1];
        for _ in 0..2000 {
            assert_ne!(sample_jump(0, 3, 0.2, &dead, &mut rng), 1);
        }
        assert_eq!(jump_density(1, 0, 3, 0.2, &dead), 0.);
        assert_relative_eq!(jump_density(2, 0, 3, 0.2, &dead), 0.8);
    }

    #[test]
    fn sampling_frequencies_match_density() {
        let mut rng = StdRng::seed_from_u64(7);
        let draws = 40_000;
        let mut counts = [0usize; 3];
        for _ in 0..draws {
            counts[sample_jump(1, 3, 0.5, &[], &mut rng)] += 1;
        }
        for (m, &count) in counts.iter().enumerate() {
            assert_relative_eq!(
                count as f64 / draws as f64,
                jump_density(m, 1, 3, 0.5, &[]),
                epsilon = 0.01
            );
        }
    }

    proptest! {
        #[test]
        fn density_sums_to_one(
            num_models in prop::sample::select(vec![2usize, 3, 5]),
            kernel in prop::sample::select(vec![0.3f64, 0.7, 1.0]),
            old_seed in 0usize..5,
            dead_mask in 0u8..32,
        ) {
            let old = old_seed % num_models;
            let dead: Vec<usize> = (0..num_models)
                .filter(|&m| m != old && dead_mask & (1 << m) != 0)
                .collect();
            let total: f64 = (0..num_models)
                .map(|new| jump_density(new, old, num_models, kernel, &dead))
                .sum();
            prop_assert!((total - 1.).abs() < 1e-12);
            for &m in dead.iter() {
                prop_assert_eq!(jump_density(m, old, num_models, kernel, &dead), 0.);
            }
        }
    }
}
