//! Batched simulation and acceptance.
//!
//! A batch of proposals is split by model and every model's simulator is
//! called once with its whole sub-batch. Sub-batches are independent, so
//! they can run on the rayon thread pool. Each gets its own random stream
//! derived from a single seed drawn before dispatch, which keeps results
//! identical between serial and parallel runs.

use faer::Mat;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    data::ObservedData,
    distance::Distance,
    error::{AbcError, Result},
    model::Model,
    sampler::Proposal,
};

/// A replicate is accepted iff every distance component lies in
/// `[0, epsilon]`. Negative components and NaN always reject.
pub fn evaluate_distance(distance: &[f64], epsilon: &[f64]) -> bool {
    distance.len() == epsilon.len()
        && distance
            .iter()
            .zip(epsilon)
            .all(|(&d, &eps)| d >= 0. && d <= eps)
}

/// Outcome of simulating one proposal.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Number of accepted replicates.
    pub acceptances: usize,
    /// One distance vector per replicate. Empty for pure sampling passes and
    /// failed simulations.
    pub distances: Vec<Vec<f64>>,
    /// Fitted trajectory per replicate, if requested.
    pub trajectories: Vec<Mat<f64>>,
}

pub struct Dispatcher<'a> {
    models: &'a [Model],
    data: &'a ObservedData,
    distance: &'a dyn Distance,
    beta: usize,
    parallel: bool,
    keep_trajectories: bool,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        models: &'a [Model],
        data: &'a ObservedData,
        distance: &'a dyn Distance,
        beta: usize,
    ) -> Self {
        Self {
            models,
            data,
            distance,
            beta,
            parallel: true,
            keep_trajectories: false,
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn keep_trajectories(mut self, keep: bool) -> Self {
        self.keep_trajectories = keep;
        self
    }

    /// Simulate a batch and compare it against the observed data.
    ///
    /// With `pure_sampling` no distances are computed and every replicate
    /// counts as accepted. The result has one entry per proposal, in batch
    /// order.
    pub fn dispatch<R: Rng + ?Sized>(
        &self,
        batch: &[Proposal],
        epsilon: &[f64],
        pure_sampling: bool,
        rng: &mut R,
    ) -> Result<Vec<Evaluation>> {
        let groups: Vec<(usize, Vec<usize>)> = (0..self.models.len())
            .map(|m| {
                let members = batch
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.model == m)
                    .map(|(i, _)| i)
                    .collect::<Vec<_>>();
                (m, members)
            })
            .filter(|(_, members)| !members.is_empty())
            .collect();

        let seed = rng.random::<u64>();
        let run = |(model, members): &(usize, Vec<usize>)| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(*model as u64);
            self.run_group(*model, members, batch, epsilon, pure_sampling, &mut rng)
        };
        let results: Vec<Result<Vec<Evaluation>>> = if self.parallel {
            groups.par_iter().map(run).collect()
        } else {
            groups.iter().map(run).collect()
        };

        let mut out: Vec<Evaluation> = (0..batch.len()).map(|_| Evaluation::default()).collect();
        for ((_, members), result) in groups.iter().zip(results) {
            for (&slot, eval) in members.iter().zip(result?) {
                out[slot] = eval;
            }
        }
        Ok(out)
    }

    fn run_group(
        &self,
        model_idx: usize,
        members: &[usize],
        batch: &[Proposal],
        epsilon: &[f64],
        pure_sampling: bool,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<Evaluation>> {
        let model = &self.models[model_idx];
        let parameters: Vec<&[f64]> = members.iter().map(|&i| &batch[i].parameters[..]).collect();
        for params in parameters.iter() {
            model.check_parameters(model_idx, params)?;
        }
        let timepoints = self.data.timepoints();

        let trajectories = match model
            .simulator()
            .simulate(&parameters, timepoints, self.beta, rng)
        {
            Ok(traj) => traj,
            Err(err) => {
                tracing::warn!(
                    model = model.name(),
                    particles = members.len(),
                    error = %err,
                    "simulation failed, rejecting sub-batch"
                );
                return Ok(vec![Evaluation::default(); members.len()]);
            }
        };
        let (particles, replicates, times, states) = trajectories.shape();
        if particles != members.len() || replicates != self.beta || times != timepoints.len() {
            tracing::warn!(
                model = model.name(),
                shape = ?trajectories.shape(),
                "simulator returned trajectories of the wrong shape, rejecting sub-batch"
            );
            return Ok(vec![Evaluation::default(); members.len()]);
        }
        // A fit that cannot read these states would reject every replicate forever.
        model.fit().check_states(states)?;

        parameters
            .iter()
            .enumerate()
            .map(|(p, params)| {
                let mut eval = Evaluation::default();
                for r in 0..self.beta {
                    let fitted = model.fit().apply(&trajectories.series(p, r))?;
                    if pure_sampling {
                        eval.acceptances += 1;
                    } else {
                        let distance =
                            self.distance
                                .distance(&fitted, self.data.values(), params, model_idx);
                        if distance.len() != epsilon.len() {
                            return Err(AbcError::DistanceDimension {
                                expected: epsilon.len(),
                                found: distance.len(),
                            });
                        }
                        if evaluate_distance(&distance, epsilon) {
                            eval.acceptances += 1;
                        }
                        eval.distances.push(distance);
                    }
                    if self.keep_trajectories {
                        eval.trajectories.push(fitted);
                    }
                }
                Ok(eval)
            })
            .collect()
    }
}
