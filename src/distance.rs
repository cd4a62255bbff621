use faer::Mat;

/// Compare a fitted simulation with the observed data.
///
/// Both matrices are (timepoint × series). The returned vector has one
/// component per tolerance dimension. A replicate is accepted only if every
/// component is non-negative and at most its tolerance, so implementations
/// may return a negative value or NaN to force a rejection.
pub trait Distance: Send + Sync {
    fn distance(
        &self,
        simulated: &Mat<f64>,
        observed: &Mat<f64>,
        parameters: &[f64],
        model: usize,
    ) -> Vec<f64>;
}

impl<F> Distance for F
where
    F: Fn(&Mat<f64>, &Mat<f64>, &[f64], usize) -> Vec<f64> + Send + Sync,
{
    fn distance(
        &self,
        simulated: &Mat<f64>,
        observed: &Mat<f64>,
        parameters: &[f64],
        model: usize,
    ) -> Vec<f64> {
        self(simulated, observed, parameters, model)
    }
}

fn same_shape(a: &Mat<f64>, b: &Mat<f64>) -> bool {
    a.nrows() == b.nrows() && a.ncols() == b.ncols()
}

/// Euclidean norm of the difference over all timepoints and series, as a
/// single tolerance dimension.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanDistance;

impl Distance for EuclideanDistance {
    fn distance(
        &self,
        simulated: &Mat<f64>,
        observed: &Mat<f64>,
        _parameters: &[f64],
        _model: usize,
    ) -> Vec<f64> {
        if !same_shape(simulated, observed) {
            return vec![f64::NAN];
        }
        let mut sum = 0f64;
        for j in 0..observed.ncols() {
            for t in 0..observed.nrows() {
                let diff = simulated[(t, j)] - observed[(t, j)];
                sum += diff * diff;
            }
        }
        vec![sum.sqrt()]
    }
}

/// One Euclidean distance per observed series, so each series gets its own
/// tolerance.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeriesEuclideanDistance;

impl Distance for SeriesEuclideanDistance {
    fn distance(
        &self,
        simulated: &Mat<f64>,
        observed: &Mat<f64>,
        _parameters: &[f64],
        _model: usize,
    ) -> Vec<f64> {
        if !same_shape(simulated, observed) {
            return vec![f64::NAN; observed.ncols()];
        }
        (0..observed.ncols())
            .map(|j| {
                (0..observed.nrows())
                    .map(|t| {
                        let diff = simulated[(t, j)] - observed[(t, j)];
                        diff * diff
                    })
                    .sum::<f64>()
                    .sqrt()
            })
            .collect()
    }
}
