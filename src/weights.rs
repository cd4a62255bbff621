//! Importance weights and model marginals.

use rayon::prelude::*;

use crate::{
    error::{AbcError, Result},
    model::Model,
    model_kernel::jump_density,
    population::{Particle, Population},
    prior::joint_density,
};

/// Models whose marginal falls below this are declared dead.
pub const DEAD_MODEL_THRESHOLD: f64 = 1e-6;

/// Un-normalized weights of newly accepted particles.
///
/// Without a previous population the weight is the acceptance count.
/// Otherwise it is the ratio of the target density (acceptances, model prior
/// and parameter prior) to the density of proposing the particle from the
/// whole previous population, scaled by the previous marginal of its model.
pub fn compute_weights(
    particles: &[Particle],
    models: &[Model],
    model_prior: &[f64],
    previous: Option<&Population>,
    model_kernel: f64,
) -> Result<Vec<f64>> {
    let Some(previous) = previous else {
        return Ok(particles.iter().map(|p| p.acceptances as f64).collect());
    };
    let num_models = models.len();

    particles
        .par_iter()
        .enumerate()
        .map(|(k, particle)| {
            let m = particle.model;
            let numerator = particle.acceptances as f64
                * model_prior[m]
                * joint_density(models[m].priors(), &particle.parameters);

            let s1: f64 = (0..num_models)
                .map(|i| {
                    previous.marginals[i]
                        * jump_density(m, i, num_models, model_kernel, &previous.dead_models)
                })
                .sum();
            let kernel = &previous.kernels[m];
            let s2: f64 = previous
                .model_particles(m)
                .map(|(j, prev)| {
                    prev.weight * kernel.density(&particle.parameters, &prev.parameters, &previous.aux[j])
                })
                .sum();

            if !(s1 > 0. && s2 > 0.) {
                return Err(AbcError::ZeroProposalDensity { particle: k, model: m });
            }
            Ok(previous.marginals[m] * numerator / (s1 * s2))
        })
        .collect()
}

/// Scale weights to sum to one.
pub fn normalize(weights: &[f64]) -> Result<Vec<f64>> {
    let total: f64 = weights.iter().sum();
    if !(total > 0. && total.is_finite()) {
        return Err(AbcError::DegeneratePopulation);
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

/// Sum of weights per model.
pub fn model_marginals(particles: &[Particle], num_models: usize) -> Vec<f64> {
    let mut marginals = vec![0.; num_models];
    for particle in particles.iter() {
        marginals[particle.model] += particle.weight;
    }
    marginals
}

pub fn dead_models(marginals: &[f64]) -> Vec<usize> {
    marginals
        .iter()
        .enumerate()
        .filter(|(_, &marginal)| marginal < DEAD_MODEL_THRESHOLD)
        .map(|(m, _)| m)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    use crate::{
        kernel::{auxiliary_info, rebuild_kernels, Kernel, KernelFamily},
        model::test_models::mean_model,
        prior::Prior,
    };

    fn particle(model: usize, parameters: &[f64], weight: f64) -> Particle {
        Particle {
            model,
            parameters: parameters.into(),
            weight,
            acceptances: 1,
        }
    }

    fn models() -> Vec<Model> {
        vec![
            mean_model("a", vec![Prior::Uniform { low: 0., high: 1. }]),
            mean_model("b", vec![Prior::Uniform { low: 0., high: 2. }]),
        ]
    }

    fn previous(models: &[Model], particles: Vec<Particle>) -> Population {
        let marginals = model_marginals(&particles, models.len());
        let assignments: Vec<usize> = particles.iter().map(|p| p.model).collect();
        let params: Vec<&[f64]> = particles.iter().map(|p| &p.parameters[..]).collect();
        let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();
        let fresh: Vec<Kernel> = models.iter().map(Kernel::new).collect();
        let kernels = rebuild_kernels(
            &fresh,
            KernelFamily::ComponentUniform,
            models,
            &assignments,
            &params,
            &weights,
            true,
        );
        let aux = auxiliary_info(&kernels, &particles);
        Population {
            generation: 0,
            epsilon: vec![1.],
            dead_models: dead_models(&marginals),
            marginals,
            particles,
            kernels,
            aux,
            sampled: 4,
            distances: vec![],
            trajectories: vec![],
        }
    }

    #[test]
    fn first_generation_uses_acceptances() {
        let mut p = particle(0, &[0.5], 0.);
        p.acceptances = 3;
        let weights = compute_weights(&[p], &models(), &[0.5, 0.5], None, 0.7).unwrap();
        assert_eq!(weights, vec![3.]);
    }

    #[test]
    fn recursion_matches_hand_computation() {
        let models = models();
        let prev = previous(
            &models,
            vec![
                particle(0, &[0.2], 0.25),
                particle(0, &[0.6], 0.25),
                particle(1, &[1.0], 0.25),
                particle(1, &[1.4], 0.25),
            ],
        );
        let new = particle(0, &[0.35], 0.);
        let weights = compute_weights(&[new], &models, &[0.5, 0.5], Some(&prev), 0.7).unwrap();

        // windows are +-0.2 around the old values, clipped to [0, 1], so only
        // the particle at 0.2 can reach 0.35
        let numerator = 1. * 0.5 * 1.;
        let s1 = 0.5 * 0.7 + 0.5 * 0.3;
        let s2 = 0.25 * 2.5;
        assert_relative_eq!(weights[0], 0.5 * numerator / (s1 * s2), epsilon = 1e-9);
    }

    #[test]
    fn unreachable_particle_is_an_error() {
        let models = models();
        let prev = previous(
            &models,
            vec![
                particle(0, &[0.2], 0.25),
                particle(0, &[0.3], 0.25),
                particle(1, &[1.0], 0.5),
            ],
        );
        let far = particle(0, &[0.9], 0.);
        let err = compute_weights(&[far], &models, &[0.5, 0.5], Some(&prev), 0.7).unwrap_err();
        assert!(matches!(err, AbcError::ZeroProposalDensity { particle: 0, model: 0 }));
    }

    #[test]
    fn normalization_and_marginals() {
        let weights = normalize(&[1., 3., 4.]).unwrap();
        assert_relative_eq!(weights.iter().sum::<f64>(), 1., epsilon = 1e-12);
        assert!(matches!(normalize(&[0., 0.]), Err(AbcError::DegeneratePopulation)));
        assert!(matches!(normalize(&[f64::NAN, 1.]), Err(AbcError::DegeneratePopulation)));

        let particles: Vec<Particle> = [0usize, 2, 2]
            .iter()
            .zip(weights)
            .map(|(&m, w)| particle(m, &[0.], w))
            .collect();
        let marginals = model_marginals(&particles, 3);
        assert_relative_eq!(marginals.iter().sum::<f64>(), 1., epsilon = 1e-12);
        assert_eq!(dead_models(&marginals), vec![1]);
        assert_eq!(dead_models(&[0.5, 5e-7, 0.5]), vec![1]);
    }
}
