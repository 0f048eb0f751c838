use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};

use crate::error::{Result, RomError};

fn argmax_abs<'a>(values: impl Iterator<Item = &'a f64>) -> usize {
    values
        .enumerate()
        .max_by(|(_, a), (_, b)| a.abs().total_cmp(&b.abs()))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

/// Greedy DEIM index selection over the columns of `modes`.
///
/// The first point is the largest entry of the first mode; every further point
/// is where the next mode is worst interpolated by the modes before it.
pub fn magic_points(term: &str, modes: &DMatrix<f64>) -> Result<Vec<usize>> {
    let (rows, count) = modes.shape();
    if count == 0 || rows < count {
        return Err(RomError::DimensionMismatch(format!(
            "{term}: cannot select {count} interpolation points among {rows} entries"
        )));
    }

    let mut points = Vec::with_capacity(count);
    points.push(argmax_abs(modes.column(0).iter()));
    for l in 1..count {
        let sampled = DMatrix::from_fn(l, l, |i, j| modes[(points[i], j)]);
        let target = DVector::from_fn(l, |i, _| modes[(points[i], l)]);
        let coefficients = sampled.lu().solve(&target).ok_or_else(|| {
            RomError::LinearSolveFailed(format!("{term}: singular DEIM system at point {l}"))
        })?;
        let residual = modes.column(l) - modes.columns(0, l) * coefficients;
        let next = argmax_abs(residual.iter());
        if points.contains(&next) {
            return Err(RomError::DegenerateMode {
                term: term.to_string(),
                index: l,
                norm: residual.amax(),
            });
        }
        points.push(next);
    }
    Ok(points)
}

/// Recovers mode coefficients from values sampled at the magic points.
#[derive(Debug, Clone)]
pub struct DeimInterpolator {
    modes: DMatrix<f64>,
    points: Vec<usize>,
    sampled: LU<f64, Dyn, Dyn>,
}

impl DeimInterpolator {
    pub fn new(modes: DMatrix<f64>, points: Vec<usize>) -> Result<Self> {
        if points.len() != modes.ncols() || points.iter().any(|&p| p >= modes.nrows()) {
            return Err(RomError::DimensionMismatch(format!(
                "{} interpolation points for {} modes of length {}",
                points.len(),
                modes.ncols(),
                modes.nrows()
            )));
        }
        let sampled = DMatrix::from_fn(points.len(), points.len(), |i, j| modes[(points[i], j)]).lu();
        if !sampled.is_invertible() {
            return Err(RomError::LinearSolveFailed(
                "interpolation matrix at the magic points is singular".to_string(),
            ));
        }
        Ok(Self {
            modes,
            points,
            sampled,
        })
    }

    pub fn points(&self) -> &[usize] {
        &self.points
    }

    pub fn modes(&self) -> &DMatrix<f64> {
        &self.modes
    }

    /// Picks the magic-point entries out of a full-length vector.
    pub fn sample(&self, full: &DVector<f64>) -> Result<DVector<f64>> {
        if full.len() != self.modes.nrows() {
            return Err(RomError::DimensionMismatch(format!(
                "vector of length {} sampled by an interpolator of length {}",
                full.len(),
                self.modes.nrows()
            )));
        }
        Ok(DVector::from_iterator(
            self.points.len(),
            self.points.iter().map(|&p| full[p]),
        ))
    }

    pub fn coefficients(&self, samples: &DVector<f64>) -> Result<DVector<f64>> {
        if samples.len() != self.points.len() {
            return Err(RomError::DimensionMismatch(format!(
                "{} samples for {} interpolation points",
                samples.len(),
                self.points.len()
            )));
        }
        self.sampled
            .solve(samples)
            .ok_or_else(|| RomError::LinearSolveFailed("DEIM coefficient solve".to_string()))
    }

    pub fn reconstruct(&self, samples: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(&self.modes * self.coefficients(samples)?)
    }
}
