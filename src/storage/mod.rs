mod csv;
mod memory;

use anyhow::Result;

use crate::population::{GenerationReport, Population};

pub use csv::{read_population_snapshot, CsvStorage};
pub use memory::MemoryStorage;

/// Trait for persisting the results of a run.
///
/// Called once per finished generation, first with the population and then
/// with its report. A stored snapshot must contain enough to resume the run
/// with [`AbcSmc::restore`](crate::AbcSmc::restore).
pub trait PopulationStorage {
    fn write_population_snapshot(&mut self, generation: usize, population: &Population)
        -> Result<()>;

    fn write_generation_report(&mut self, generation: usize, report: &GenerationReport)
        -> Result<()>;

    /// Flush any buffered data.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Discard everything.
impl PopulationStorage for () {
    fn write_population_snapshot(&mut self, _generation: usize, _population: &Population) -> Result<()> {
        Ok(())
    }

    fn write_generation_report(&mut self, _generation: usize, _report: &GenerationReport) -> Result<()> {
        Ok(())
    }
}
