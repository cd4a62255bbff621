//! Observed time series and simulated trajectory tensors.

use faer::Mat;

use crate::error::{AbcError, Result};

/// Observed data: one row per timepoint, one column per observed series.
#[derive(Debug, Clone)]
pub struct ObservedData {
    timepoints: Box<[f64]>,
    values: Mat<f64>,
}

impl ObservedData {
    pub fn new(timepoints: Vec<f64>, values: Mat<f64>) -> Result<Self> {
        if timepoints.is_empty() {
            return Err(AbcError::InvalidConfig(
                "observed data needs at least one timepoint".into(),
            ));
        }
        if values.nrows() != timepoints.len() {
            return Err(AbcError::InvalidConfig(format!(
                "observed data has {} rows but {} timepoints",
                values.nrows(),
                timepoints.len()
            )));
        }
        if values.ncols() == 0 {
            return Err(AbcError::InvalidConfig(
                "observed data needs at least one series".into(),
            ));
        }
        if timepoints.iter().any(|t| !t.is_finite()) {
            return Err(AbcError::InvalidConfig(
                "timepoints must be finite".into(),
            ));
        }
        Ok(Self {
            timepoints: timepoints.into(),
            values,
        })
    }

    /// Build observed data from row slices, one per timepoint.
    pub fn from_rows(timepoints: Vec<f64>, rows: &[Vec<f64>]) -> Result<Self> {
        let ncols = rows.first().map(|row| row.len()).unwrap_or(0);
        if rows.iter().any(|row| row.len() != ncols) {
            return Err(AbcError::InvalidConfig(
                "observed rows have different lengths".into(),
            ));
        }
        let values = Mat::from_fn(rows.len(), ncols, |i, j| rows[i][j]);
        Self::new(timepoints, values)
    }

    pub fn timepoints(&self) -> &[f64] {
        &self.timepoints
    }

    pub fn values(&self) -> &Mat<f64> {
        &self.values
    }

    pub fn num_series(&self) -> usize {
        self.values.ncols()
    }
}

/// Simulator output indexed by (particle, replicate, timepoint, state).
#[derive(Debug, Clone)]
pub struct Trajectories {
    particles: usize,
    replicates: usize,
    timepoints: usize,
    states: usize,
    data: Vec<f64>,
}

impl Trajectories {
    pub fn zeros(particles: usize, replicates: usize, timepoints: usize, states: usize) -> Self {
        Self {
            particles,
            replicates,
            timepoints,
            states,
            data: vec![0.; particles * replicates * timepoints * states],
        }
    }

    pub fn from_fn(
        particles: usize,
        replicates: usize,
        timepoints: usize,
        states: usize,
        mut value: impl FnMut(usize, usize, usize, usize) -> f64,
    ) -> Self {
        let mut out = Self::zeros(particles, replicates, timepoints, states);
        for p in 0..particles {
            for r in 0..replicates {
                for t in 0..timepoints {
                    for s in 0..states {
                        let idx = out.offset(p, r, t) + s;
                        out.data[idx] = value(p, r, t, s);
                    }
                }
            }
        }
        out
    }

    pub fn shape(&self) -> (usize, usize, usize, usize) {
        (self.particles, self.replicates, self.timepoints, self.states)
    }

    fn offset(&self, particle: usize, replicate: usize, timepoint: usize) -> usize {
        ((particle * self.replicates + replicate) * self.timepoints + timepoint) * self.states
    }

    /// The state vector of one particle and replicate at one timepoint.
    pub fn state(&self, particle: usize, replicate: usize, timepoint: usize) -> &[f64] {
        let start = self.offset(particle, replicate, timepoint);
        &self.data[start..start + self.states]
    }

    pub fn state_mut(&mut self, particle: usize, replicate: usize, timepoint: usize) -> &mut [f64] {
        let start = self.offset(particle, replicate, timepoint);
        &mut self.data[start..start + self.states]
    }

    /// The full (timepoint × state) matrix of one particle and replicate.
    pub fn series(&self, particle: usize, replicate: usize) -> Mat<f64> {
        Mat::from_fn(self.timepoints, self.states, |t, s| {
            self.state(particle, replicate, t)[s]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trajectory_indexing() {
        let traj = Trajectories::from_fn(2, 3, 4, 2, |p, r, t, s| {
            (1000 * p + 100 * r + 10 * t + s) as f64
        });
        assert_eq!(traj.shape(), (2, 3, 4, 2));
        assert_eq!(traj.state(1, 2, 3), &[1230., 1231.]);
        let series = traj.series(1, 0);
        assert_eq!(series.nrows(), 4);
        assert_eq!(series.ncols(), 2);
        assert_eq!(series[(2, 1)], 1021.);
    }

    #[test]
    fn observed_shape_is_checked() {
        assert!(ObservedData::from_rows(vec![0., 1.], &[vec![1.]]).is_err());
        assert!(ObservedData::from_rows(vec![], &[]).is_err());
        assert!(ObservedData::from_rows(vec![0., 1.], &[vec![1., 2.], vec![3.]]).is_err());
        let data = ObservedData::from_rows(vec![0., 1.], &[vec![1., 2.], vec![3., 4.]]).unwrap();
        assert_eq!(data.num_series(), 2);
        assert_eq!(data.values()[(1, 0)], 3.);
    }
}
