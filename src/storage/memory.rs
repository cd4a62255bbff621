use anyhow::Result;

use super::PopulationStorage;
use crate::population::{GenerationReport, Population, Snapshot};

/// Keeps snapshots and reports of every generation in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    pub snapshots: Vec<Snapshot>,
    pub reports: Vec<GenerationReport>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the latest generation, if any.
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }
}

impl PopulationStorage for MemoryStorage {
    fn write_population_snapshot(&mut self, _generation: usize, population: &Population) -> Result<()> {
        self.snapshots.push(population.snapshot());
        Ok(())
    }

    fn write_generation_report(&mut self, _generation: usize, report: &GenerationReport) -> Result<()> {
        self.reports.push(report.clone());
        Ok(())
    }
}
