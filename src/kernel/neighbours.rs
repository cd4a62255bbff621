use itertools::Itertools;
use rayon::prelude::*;

use super::{Kernel, KernelParams};
use crate::{
    math::{weighted_covariance, Gaussian},
    population::Particle,
};

/// Per-particle data some kernels need on top of their fitted state.
#[derive(Debug, Clone, Default)]
pub enum KernelAux {
    #[default]
    None,
    /// The `k` nearest particles of the same model and the local normal
    /// built from their covariance.
    Neighbourhood {
        neighbours: Vec<usize>,
        local: Gaussian,
    },
}

/// Compute the auxiliary information of every particle under the kernel of
/// its model. Kernels without per-particle state yield [`KernelAux::None`].
pub fn auxiliary_info(kernels: &[Kernel], particles: &[Particle]) -> Vec<KernelAux> {
    particles
        .par_iter()
        .map(|particle| match kernels.get(particle.model) {
            Some(kernel) => neighbourhood(kernel, &particle.parameters),
            None => KernelAux::None,
        })
        .collect()
}

fn neighbourhood(kernel: &Kernel, parameters: &[f64]) -> KernelAux {
    let KernelParams::NearestNeighbours {
        k,
        support,
        weights,
        fallback,
    } = &kernel.params
    else {
        return KernelAux::None;
    };
    let point = kernel.free_values(parameters);

    let neighbours: Vec<usize> = support
        .iter()
        .enumerate()
        .map(|(idx, other)| {
            let dist: f64 = point
                .iter()
                .zip(other)
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            (idx, dist)
        })
        .sorted_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
        .take(*k)
        .map(|(idx, _)| idx)
        .collect();

    let local = if neighbours.len() < 2 {
        fallback.clone()
    } else {
        let points: Vec<Vec<f64>> = neighbours.iter().map(|&i| support[i].clone()).collect();
        let local_weights: Vec<f64> = neighbours.iter().map(|&i| weights[i]).collect();
        let (_, cov) = weighted_covariance(&points, &local_weights);
        Gaussian::from_covariance(&cov)
    };
    KernelAux::Neighbourhood { neighbours, local }
}
