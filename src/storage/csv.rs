//! CSV storage backend.
//!
//! Writes one `population_<generation>.csv` snapshot per generation and a
//! `report.csv` with one row per generation. Snapshots store floats with
//! full precision, so a run resumed from a snapshot sees exactly the
//! particles and kernels that were written.
//!
//! Kernels are stored as one `# kernel` line per model ahead of the particle
//! rows: model index, kind, perturbed parameter indices, then the fitted
//! values. List fields are separated by `;`, Gaussians are stored as their
//! row-major Cholesky factor.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use itertools::Itertools;

use faer::Mat;

use super::PopulationStorage;
use crate::{
    kernel::{Kernel, KernelParams},
    math::Gaussian,
    population::{GenerationReport, Particle, Population, Snapshot},
};

const GENERATION_TAG: &str = "# generation";
const EPSILON_TAG: &str = "# epsilon";
const KERNEL_TAG: &str = "# kernel";
const PARTICLE_HEADER: &str = "model,weight,acceptances,parameters";
const REPORT_HEADER: &str = "generation,sampled,accepted,acceptance_rate,epsilon,marginals,dead_models";

/// Stores populations and generation reports as CSV files in a directory.
pub struct CsvStorage {
    output_dir: PathBuf,
    report: BufWriter<File>,
}

impl CsvStorage {
    /// Create the output directory if needed and start a new `report.csv`.
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

        let report_path = output_dir.join("report.csv");
        let file = File::create(&report_path)
            .with_context(|| format!("Failed to create CSV file: {:?}", report_path))?;
        let mut report = BufWriter::new(file);
        writeln!(report, "{REPORT_HEADER}")?;

        Ok(Self { output_dir, report })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path of the snapshot file of one generation.
    pub fn snapshot_path(&self, generation: usize) -> PathBuf {
        self.output_dir.join(format!("population_{generation}.csv"))
    }
}

impl PopulationStorage for CsvStorage {
    fn write_population_snapshot(&mut self, generation: usize, population: &Population) -> Result<()> {
        let path = self.snapshot_path(generation);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create CSV file: {:?}", path))?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "{GENERATION_TAG},{generation}")?;
        writeln!(writer, "{EPSILON_TAG},{}", population.epsilon.iter().join(","))?;
        for (model, kernel) in population.kernels.iter().enumerate() {
            writeln!(writer, "{KERNEL_TAG},{model},{}", format_kernel(kernel))?;
        }
        writeln!(writer, "{PARTICLE_HEADER}")?;
        for particle in population.particles.iter() {
            write!(
                writer,
                "{},{},{}",
                particle.model, particle.weight, particle.acceptances
            )?;
            for value in particle.parameters.iter() {
                write!(writer, ",{}", value)?;
            }
            writeln!(writer)?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to write CSV file: {:?}", path))
    }

    fn write_generation_report(&mut self, generation: usize, report: &GenerationReport) -> Result<()> {
        writeln!(
            self.report,
            "{},{},{},{},{},{},{}",
            generation,
            report.sampled,
            report.accepted,
            report.acceptance_rate,
            report.epsilon.iter().join(";"),
            report.marginals.iter().join(";"),
            report.dead_models.iter().join(";"),
        )?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.report.flush().context("Failed to flush report.csv")
    }
}

fn parse_floats<'a>(fields: impl Iterator<Item = &'a str>, line: usize) -> Result<Vec<f64>> {
    fields
        .map(|field| {
            field
                .trim()
                .parse::<f64>()
                .with_context(|| format!("Invalid number `{field}` on line {line}"))
        })
        .collect()
}

fn list(field: &str) -> impl Iterator<Item = &str> {
    field.split(';').filter(|item| !item.trim().is_empty())
}

fn flat_pairs(pairs: &[(f64, f64)]) -> String {
    pairs.iter().flat_map(|&(a, b)| [a, b]).join(";")
}

fn flat_factor(gaussian: &Gaussian) -> String {
    let factor = gaussian.factor();
    (0..factor.nrows())
        .flat_map(|i| (0..factor.ncols()).map(move |j| factor[(i, j)]))
        .join(";")
}

fn format_kernel(kernel: &Kernel) -> String {
    let indices = kernel.indices().iter().join(";");
    match kernel.params() {
        KernelParams::Unfitted => format!("unfitted,{indices}"),
        KernelParams::Uniform { windows } => format!("uniform,{indices},{}", flat_pairs(windows)),
        KernelParams::BoundedUniform { windows, bounds } => format!(
            "bounded_uniform,{indices},{},{}",
            flat_pairs(windows),
            flat_pairs(bounds)
        ),
        KernelParams::Normal { std_devs } => {
            format!("normal,{indices},{}", std_devs.iter().join(";"))
        }
        KernelParams::MultivariateNormal { gaussian } => {
            format!("multivariate_normal,{indices},{}", flat_factor(gaussian))
        }
        KernelParams::NearestNeighbours {
            k,
            support,
            weights,
            fallback,
        } => format!(
            "nearest_neighbours,{indices},{k},{},{},{}",
            weights.iter().join(";"),
            support.iter().flatten().join(";"),
            flat_factor(fallback)
        ),
    }
}

fn parse_pairs(values: Vec<f64>, dim: usize, line: usize) -> Result<Vec<(f64, f64)>> {
    if values.len() != 2 * dim {
        bail!("Expected {} window bounds on line {line}, found {}", 2 * dim, values.len());
    }
    Ok(values.chunks(2).map(|pair| (pair[0], pair[1])).collect())
}

fn parse_factor(values: Vec<f64>, dim: usize, line: usize) -> Result<Gaussian> {
    if values.len() != dim * dim {
        bail!("Expected a {dim}x{dim} factor on line {line}, found {} values", values.len());
    }
    Ok(Gaussian::from_factor(Mat::from_fn(dim, dim, |i, j| {
        values[i * dim + j]
    })))
}

/// Parse the fields of a `# kernel` line after the tag.
fn parse_kernel(rest: &str, line: usize) -> Result<(usize, Kernel)> {
    let fields: Vec<&str> = rest.split(',').collect();
    let [model, kind, indices, values @ ..] = fields.as_slice() else {
        bail!("Line {line} is not a kernel row");
    };
    let model = model
        .trim()
        .parse::<usize>()
        .with_context(|| format!("Invalid model index `{model}` on line {line}"))?;
    let indices = list(indices)
        .map(|idx| {
            idx.trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid parameter index `{idx}` on line {line}"))
        })
        .collect::<Result<Vec<_>>>()?;
    let dim = indices.len();
    let floats = |field: &str| parse_floats(list(field), line);

    let params = match (kind.trim(), values) {
        ("unfitted", []) => KernelParams::Unfitted,
        ("uniform", [windows]) => KernelParams::Uniform {
            windows: parse_pairs(floats(*windows)?, dim, line)?,
        },
        ("bounded_uniform", [windows, bounds]) => KernelParams::BoundedUniform {
            windows: parse_pairs(floats(*windows)?, dim, line)?,
            bounds: parse_pairs(floats(*bounds)?, dim, line)?,
        },
        ("normal", [std_devs]) => {
            let std_devs = floats(*std_devs)?;
            if std_devs.len() != dim {
                bail!("Expected {dim} standard deviations on line {line}");
            }
            KernelParams::Normal { std_devs }
        }
        ("multivariate_normal", [factor]) => KernelParams::MultivariateNormal {
            gaussian: parse_factor(floats(*factor)?, dim, line)?,
        },
        ("nearest_neighbours", [k, weights, support, fallback]) => {
            let k = k
                .trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid neighbour count `{k}` on line {line}"))?;
            let weights = floats(*weights)?;
            let flat = floats(*support)?;
            if flat.len() != weights.len() * dim {
                bail!("Support of {} points does not match its weights on line {line}", flat.len());
            }
            let support = if dim == 0 {
                vec![Vec::new(); weights.len()]
            } else {
                flat.chunks(dim).map(<[f64]>::to_vec).collect()
            };
            KernelParams::NearestNeighbours {
                k,
                support,
                weights,
                fallback: parse_factor(floats(*fallback)?, dim, line)?,
            }
        }
        (kind, _) => bail!("Invalid kernel `{kind}` on line {line}"),
    };
    Ok((model, Kernel::from_parts(indices, params)))
}

/// Read a snapshot written by [`CsvStorage`].
pub fn read_population_snapshot<P: AsRef<Path>>(path: P) -> Result<Snapshot> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read CSV file: {:?}", path))?;

    let mut generation = None;
    let mut epsilon = None;
    let mut particles = Vec::new();
    let mut kernels = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.trim();
        if line.is_empty() || line == PARTICLE_HEADER {
            continue;
        }
        let mut fields = line.split(',');
        if let Some(rest) = line.strip_prefix(GENERATION_TAG) {
            let value = rest.trim_start_matches(',').trim();
            generation = Some(
                value
                    .parse::<usize>()
                    .with_context(|| format!("Invalid generation `{value}` on line {lineno}"))?,
            );
            continue;
        }
        if line.starts_with(EPSILON_TAG) {
            epsilon = Some(parse_floats(fields.skip(1), lineno)?);
            continue;
        }
        if let Some(rest) = line.strip_prefix(KERNEL_TAG) {
            let (model, kernel) = parse_kernel(rest.trim_start_matches(','), lineno)?;
            if model != kernels.len() {
                bail!("Kernel of model {model} out of order on line {lineno}");
            }
            kernels.push(kernel);
            continue;
        }

        let (Some(model), Some(weight), Some(acceptances)) =
            (fields.next(), fields.next(), fields.next())
        else {
            bail!("Line {lineno} of {:?} is not a particle row", path);
        };
        particles.push(Particle {
            model: model
                .trim()
                .parse()
                .with_context(|| format!("Invalid model index `{model}` on line {lineno}"))?,
            weight: weight
                .trim()
                .parse()
                .with_context(|| format!("Invalid weight `{weight}` on line {lineno}"))?,
            acceptances: acceptances
                .trim()
                .parse()
                .with_context(|| format!("Invalid acceptance count `{acceptances}` on line {lineno}"))?,
            parameters: parse_floats(fields, lineno)?.into(),
        });
    }

    Ok(Snapshot {
        generation: generation.with_context(|| format!("{:?} has no generation line", path))?,
        epsilon: epsilon.with_context(|| format!("{:?} has no epsilon line", path))?,
        particles,
        kernels,
    })
}
