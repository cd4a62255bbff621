use abc_smc::{
    jump_density, AbcSettings, AbcSmc, Fit, KernelFamily, MemoryStorage, Model, ObservedData,
    Prior, Schedule, Trajectories,
};
use anyhow::Result;
use faer::Mat;
use pretty_assertions::assert_eq;
use rand::RngCore;

fn abs_distance(sim: &Mat<f64>, obs: &Mat<f64>, _: &[f64], _: usize) -> Vec<f64> {
    vec![(sim[(0, 0)] - obs[(0, 0)]).abs()]
}

fn mean_of_two(name: &str) -> Result<Model> {
    Ok(Model::new(
        name,
        vec![Prior::Uniform { low: 0., high: 1. }; 2],
        Fit::Identity,
        |params: &[&[f64]],
         times: &[f64],
         reps: usize,
         _rng: &mut dyn RngCore|
         -> anyhow::Result<Trajectories> {
            Ok(Trajectories::from_fn(params.len(), reps, times.len(), 1, |p, _, _, _| {
                (params[p][0] + params[p][1]) / 2.
            }))
        },
    )?)
}

fn constant_output(name: &str, value: f64) -> Result<Model> {
    Ok(Model::new(
        name,
        vec![Prior::Uniform { low: 0., high: 1. }],
        Fit::Identity,
        move |params: &[&[f64]],
              times: &[f64],
              reps: usize,
              _rng: &mut dyn RngCore|
              -> anyhow::Result<Trajectories> {
            Ok(Trajectories::from_fn(params.len(), reps, times.len(), 1, |_, _, _, _| value))
        },
    )?)
}

fn observed() -> Result<ObservedData> {
    Ok(ObservedData::from_rows(vec![1.], &[vec![0.5]])?)
}

fn output(parameters: &[f64]) -> f64 {
    (parameters[0] + parameters[1]) / 2.
}

#[test]
fn single_model_fixed_schedule() -> Result<()> {
    let settings = AbcSettings {
        nparticles: 200,
        nbatch: 50,
        beta: 1,
        seed: 42,
        ..Default::default()
    };
    let smc = AbcSmc::new(vec![mean_of_two("mean")?], observed()?, settings)?
        .with_distance(abs_distance);
    let mut storage = MemoryStorage::new();
    let out = smc.run(
        Schedule::Fixed(vec![vec![0.5], vec![0.2], vec![0.05]]),
        &mut storage,
    )?;

    assert_eq!(out.reports.len(), 3);
    assert!(out.reports[0].acceptance_rate > 0.);
    for (generation, report) in out.reports.iter().enumerate() {
        assert_eq!(report.generation, generation);
        assert_eq!(report.accepted, 200);
        assert!((report.marginals.iter().sum::<f64>() - 1.).abs() < 1e-9);
    }
    for snapshot in storage.snapshots.iter() {
        assert_eq!(snapshot.particles.len(), 200);
    }

    let population = out.population;
    assert_eq!(population.epsilon, vec![0.05]);
    assert_eq!(population.len(), 200);
    for particle in population.particles.iter() {
        assert!((output(&particle.parameters) - 0.5).abs() <= 0.05);
        assert!(particle.parameters.iter().all(|p| (0. ..=1.).contains(p)));
    }
    let weight_sum: f64 = population.particles.iter().map(|p| p.weight).sum();
    assert!((weight_sum - 1.).abs() < 1e-9);
    Ok(())
}

#[test]
fn every_kernel_family_concentrates_the_posterior() -> Result<()> {
    for kernel in [
        KernelFamily::ComponentUniform,
        KernelFamily::ComponentNormal,
        KernelFamily::MultivariateNormal,
        KernelFamily::NearestNeighbours { k: None },
    ] {
        let settings = AbcSettings {
            nparticles: 100,
            nbatch: 50,
            kernel,
            seed: 3,
            ..Default::default()
        };
        let smc = AbcSmc::new(vec![mean_of_two("mean")?], observed()?, settings)?
            .with_distance(abs_distance);
        let out = smc.run(
            Schedule::Fixed(vec![vec![0.4], vec![0.2], vec![0.1]]),
            &mut (),
        )?;
        assert_eq!(out.population.len(), 100);
        for particle in out.population.particles.iter() {
            assert!((output(&particle.parameters) - 0.5).abs() <= 0.1);
        }
    }
    Ok(())
}

#[test]
fn model_that_cannot_fit_dies() -> Result<()> {
    let settings = AbcSettings {
        nparticles: 100,
        nbatch: 50,
        seed: 11,
        ..Default::default()
    };
    // the constant model is within 0.5 of the data but never within 0.2
    let smc = AbcSmc::new(
        vec![mean_of_two("mean")?, constant_output("constant", 0.9)?],
        observed()?,
        settings,
    )?
    .with_distance(abs_distance);
    let out = smc.run(
        Schedule::Fixed(vec![vec![0.5], vec![0.2], vec![0.1]]),
        &mut (),
    )?;

    assert!(out.reports[0].marginals[1] > 0.1);
    assert!(out.reports[0].dead_models.is_empty());
    assert!(out.reports[1].marginals[1] < 1e-6);
    assert_eq!(out.reports[1].dead_models, vec![1]);

    let population = out.population;
    assert_eq!(population.dead_models, vec![1]);
    assert!(population.particles.iter().all(|p| p.model == 0));
    assert!((population.marginals[0] - 1.).abs() < 1e-9);
    assert_eq!(
        jump_density(1, 0, 2, smc.settings().model_kernel, &population.dead_models),
        0.
    );
    Ok(())
}

#[test]
fn adaptive_schedule_reaches_target() -> Result<()> {
    let settings = AbcSettings {
        nparticles: 100,
        nbatch: 50,
        seed: 5,
        ..Default::default()
    };
    let smc = AbcSmc::new(vec![mean_of_two("mean")?], observed()?, settings)?
        .with_distance(abs_distance);
    let out = smc.run(
        Schedule::Adaptive {
            target: vec![0.05],
            alpha: 0.3,
        },
        &mut (),
    )?;

    assert_eq!(out.reports[0].epsilon, vec![1e10]);
    for pair in out.reports.windows(2) {
        assert!(pair[1].epsilon[0] <= pair[0].epsilon[0]);
    }
    let at_target = out
        .reports
        .iter()
        .filter(|report| report.epsilon == vec![0.05])
        .count();
    assert_eq!(at_target, 1);
    assert_eq!(out.population.epsilon, vec![0.05]);
    for particle in out.population.particles.iter() {
        assert!((output(&particle.parameters) - 0.5).abs() <= 0.05);
    }
    Ok(())
}

#[test]
fn failing_simulator_only_costs_batches() -> Result<()> {
    let flaky = Model::new(
        "flaky",
        vec![Prior::Uniform { low: 0., high: 1. }; 2],
        Fit::Identity,
        |params: &[&[f64]],
         times: &[f64],
         reps: usize,
         rng: &mut dyn RngCore|
         -> anyhow::Result<Trajectories> {
            if rng.next_u32() % 3 == 0 {
                anyhow::bail!("step size underflow");
            }
            Ok(Trajectories::from_fn(params.len(), reps, times.len(), 1, |p, _, _, _| {
                (params[p][0] + params[p][1]) / 2.
            }))
        },
    )?;
    let settings = AbcSettings {
        nparticles: 50,
        nbatch: 10,
        seed: 1,
        ..Default::default()
    };
    let smc = AbcSmc::new(vec![flaky], observed()?, settings)?.with_distance(abs_distance);
    let out = smc.run(Schedule::Fixed(vec![vec![0.5], vec![0.3]]), &mut ())?;
    assert_eq!(out.population.len(), 50);
    Ok(())
}
