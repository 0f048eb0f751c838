use std::path::PathBuf;

use log::info;
use nalgebra::DVector;
use serde::Serialize;

use crate::cache::{ArtifactStore, FsArtifactStore};
use crate::error::{Result, RomError};
use crate::online::Trajectory;
use crate::pod::Basis;
use crate::snapshot::{PayloadRecord, SnapshotPayload};

/// Receives reconstructed full-order fields.
pub trait FieldSink<P> {
    fn write(&mut self, index: usize, time: f64, field: &P) -> Result<()>;
}

impl<P: Clone> FieldSink<P> for Vec<(usize, f64, P)> {
    fn write(&mut self, index: usize, time: f64, field: &P) -> Result<()> {
        self.push((index, time, field.clone()));
        Ok(())
    }
}

#[derive(Serialize)]
struct FieldRecord {
    index: usize,
    time: f64,
    field: PayloadRecord,
}

/// Writes `<folder>/<name>/<name>_<index>.json` for every field.
#[derive(Debug, Clone)]
pub struct JsonFieldWriter {
    store: FsArtifactStore,
    name: String,
}

impl JsonFieldWriter {
    pub fn new(folder: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            store: FsArtifactStore::new(folder),
            name: name.into(),
        }
    }

    pub fn path_of(&self, index: usize) -> PathBuf {
        self.store.path_of(&self.name, &format!("{}_{index}", self.name))
    }
}

impl<P: SnapshotPayload> FieldSink<P> for JsonFieldWriter {
    fn write(&mut self, index: usize, time: f64, field: &P) -> Result<()> {
        let record = FieldRecord {
            index,
            time,
            field: field.to_record(),
        };
        self.store
            .save(&self.name, &format!("{}_{index}", self.name), &record)?;
        Ok(())
    }
}

/// Expands reduced states back into full-order fields.
#[derive(Debug, Default)]
pub struct Reconstructor;

impl Reconstructor {
    /// `Σ_m state[offset + m] · mode[m]` over every mode of `basis`.
    pub fn reconstruct_state<P: SnapshotPayload>(
        state: &DVector<f64>,
        basis: &Basis<P>,
        offset: usize,
    ) -> Result<P> {
        if offset + basis.len() > state.len() {
            return Err(RomError::DimensionMismatch(format!(
                "reduced state of length {} has no coefficients {}..{} for {}",
                state.len(),
                offset,
                offset + basis.len(),
                basis.term()
            )));
        }
        basis.expand(&state.as_slice()[offset..offset + basis.len()])
    }

    /// Hands every `stride`-th state of the trajectory (the initial state
    /// included) to `sink`; returns how many fields were written.
    pub fn reconstruct<P, K>(
        trajectory: &Trajectory,
        basis: &Basis<P>,
        offset: usize,
        stride: usize,
        sink: &mut K,
    ) -> Result<usize>
    where
        P: SnapshotPayload,
        K: FieldSink<P> + ?Sized,
    {
        let stride = stride.max(1);
        let mut written = 0;
        for (index, (time, state)) in trajectory.iter().enumerate().step_by(stride) {
            let field = Self::reconstruct_state(state, basis, offset)?;
            sink.write(index, time, &field)?;
            written += 1;
        }
        info!("reconstructed {written} {} fields", basis.term());
        Ok(written)
    }

    pub fn reconstruct_states<P: SnapshotPayload>(states: &[DVector<f64>], basis: &Basis<P>) -> Result<Vec<P>> {
        states
            .iter()
            .map(|state| Self::reconstruct_state(state, basis, 0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectral::EnergyProfile;

    fn basis() -> Basis<DVector<f64>> {
        Basis::from_parts(
            "U",
            0,
            vec![
                DVector::from_vec(vec![1.0, 0.0, 0.0]),
                DVector::from_vec(vec![0.0, 0.0, 1.0]),
            ],
            EnergyProfile::new(&[2.0, 1.0], 3.0),
            vec![1.0, 1.0],
        )
        .expect("basis")
    }

    #[test]
    fn stride_skips_states() {
        let states: Vec<DVector<f64>> = (0..5).map(|k| DVector::from_vec(vec![k as f64, 1.0, -1.0])).collect();
        let times = (0..5).map(|k| k as f64 * 0.1).collect();
        let trajectory = Trajectory::from_states(times, states).expect("trajectory");
        let mut sink: Vec<(usize, f64, DVector<f64>)> = Vec::new();
        let written = Reconstructor::reconstruct(&trajectory, &basis(), 1, 2, &mut sink).expect("reconstruct");
        assert_eq!(written, 3);
        assert_eq!(sink.iter().map(|(i, _, _)| *i).collect::<Vec<_>>(), vec![0, 2, 4]);
        assert_eq!(sink[1].2, DVector::from_vec(vec![1.0, 0.0, -1.0]));
    }

    #[test]
    fn short_state_is_rejected() {
        let state = DVector::from_vec(vec![1.0]);
        assert!(matches!(
            Reconstructor::reconstruct_state(&state, &basis(), 0),
            Err(RomError::DimensionMismatch(_))
        ));
    }
}
