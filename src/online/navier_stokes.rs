use std::sync::Arc;

use log::info;
use nalgebra::DVector;

use crate::config::OnlineConfig;
use crate::error::{Result, RomError};
use crate::online::stepper::{OnlineRun, Trajectory};
use crate::online::system::NavierStokesSystem;
use crate::pod::Basis;
use crate::reduced::NavierStokesOperators;
use crate::snapshot::{SnapshotPayload, SnapshotSet};

/// Reduced unsteady Navier-Stokes problem: projected operators plus the
/// reduced coordinates of every offline snapshot, used as initial states.
#[derive(Debug, Clone)]
pub struct ReducedNavierStokes {
    operators: Arc<NavierStokesOperators>,
    initial_states: Vec<DVector<f64>>,
    config: OnlineConfig,
}

impl ReducedNavierStokes {
    /// Projects every velocity and pressure snapshot onto its basis.
    pub fn new<U: SnapshotPayload, Q: SnapshotPayload>(
        operators: NavierStokesOperators,
        velocity_basis: &Basis<U>,
        pressure_basis: &Basis<Q>,
        velocity: &SnapshotSet<U>,
        pressure: &SnapshotSet<Q>,
        config: OnlineConfig,
    ) -> Result<Self> {
        if velocity_basis.len() != operators.velocity_dim() || pressure_basis.len() != operators.pressure_dim() {
            return Err(RomError::DimensionMismatch(format!(
                "bases of {}/{} modes for reduced operators of order {}/{}",
                velocity_basis.len(),
                pressure_basis.len(),
                operators.velocity_dim(),
                operators.pressure_dim()
            )));
        }
        if velocity.len() != pressure.len() {
            return Err(RomError::DimensionMismatch(format!(
                "{} velocity snapshots but {} pressure snapshots",
                velocity.len(),
                pressure.len()
            )));
        }
        let initial_states = velocity
            .iter()
            .zip(pressure.iter())
            .map(|(u, p)| {
                let a = velocity_basis.project(&u.payload);
                let b = pressure_basis.project(&p.payload);
                DVector::from_iterator(a.len() + b.len(), a.iter().chain(b.iter()).copied())
            })
            .collect();
        Self::from_initial_states(operators, initial_states, config)
    }

    pub fn from_initial_states(
        operators: NavierStokesOperators,
        initial_states: Vec<DVector<f64>>,
        config: OnlineConfig,
    ) -> Result<Self> {
        operators.validate(config.stabilization)?;
        let order = operators.velocity_dim() + operators.pressure_dim();
        if let Some((index, state)) = initial_states.iter().enumerate().find(|(_, s)| s.len() != order) {
            return Err(RomError::ShapeMismatch {
                field: "reduced state".to_string(),
                index,
                expected: (order, 1),
                found: (state.len(), 1),
            });
        }
        Ok(Self {
            operators: Arc::new(operators),
            initial_states,
            config,
        })
    }

    pub fn operators(&self) -> &NavierStokesOperators {
        &self.operators
    }

    pub fn config(&self) -> &OnlineConfig {
        &self.config
    }

    pub fn initial_states(&self) -> &[DVector<f64>] {
        &self.initial_states
    }

    /// Prepares a run from snapshot `start_index`; the leading velocity
    /// coefficients are replaced by `parameters`.
    pub fn start(&self, parameters: &DVector<f64>, start_index: usize) -> Result<OnlineRun<NavierStokesSystem>> {
        let mut initial = self
            .initial_states
            .get(start_index)
            .cloned()
            .ok_or_else(|| {
                RomError::DimensionMismatch(format!(
                    "start index {start_index} outside {} projected snapshots",
                    self.initial_states.len()
                ))
            })?;
        let system = NavierStokesSystem::new(
            self.config.stabilization,
            Arc::clone(&self.operators),
            parameters.len(),
            self.config.nu,
            self.config.dt,
        )?;
        initial.rows_mut(0, parameters.len()).copy_from(parameters);
        OnlineRun::new(system, &self.config, parameters.clone(), initial)
    }

    /// Runs the whole time interval and returns the accepted states.
    pub fn solve_online(&self, parameters: &DVector<f64>, start_index: usize) -> Result<Trajectory> {
        info!(
            "solving the reduced problem ({:?}, {} velocity + {} pressure modes) from snapshot {start_index}",
            self.config.stabilization,
            self.operators.velocity_dim(),
            self.operators.pressure_dim()
        );
        let mut run = self.start(parameters, start_index)?;
        run.run_to_end()?;
        Ok(run.into_trajectory())
    }
}
