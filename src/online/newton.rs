use log::debug;
use nalgebra::DVector;

use crate::config::NewtonConfig;
use crate::error::{Result, RomError};
use crate::online::system::{ReducedSystem, StepContext};

#[derive(Debug, Clone)]
pub struct NewtonOutcome {
    pub state: DVector<f64>,
    /// Number of Newton updates applied; 0 when the guess already converged.
    pub iterations: u32,
    pub residual: f64,
}

/// Undamped Newton iteration over a [`ReducedSystem`].
#[derive(Debug, Clone, Default)]
pub struct NewtonSolver {
    config: NewtonConfig,
}

impl NewtonSolver {
    pub fn new(config: NewtonConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NewtonConfig {
        &self.config
    }

    pub fn solve<S: ReducedSystem + ?Sized>(
        &self,
        system: &S,
        initial_guess: DVector<f64>,
        ctx: &StepContext<'_>,
    ) -> Result<NewtonOutcome> {
        let mut state = initial_guess;
        let mut residual = system.residual(&state, ctx)?;
        let initial = residual.norm();
        let mut norm = initial;
        let mut applied = 0;

        for iteration in 0..=self.config.max_iterations {
            debug!(
                "step {} newton {iteration:>3} | residual {norm:>10.3e} | fraction {:>10.3e}",
                ctx.step,
                if initial > 0.0 { norm / initial } else { 0.0 }
            );
            if norm == 0.0 || self.config.tolerance.is_met(norm, initial) {
                return Ok(NewtonOutcome {
                    state,
                    iterations: iteration,
                    residual: norm,
                });
            }
            if iteration == self.config.max_iterations {
                break;
            }

            let jacobian = system.jacobian(&state, ctx)?;
            let delta = jacobian.lu().solve(&-&residual).ok_or_else(|| {
                RomError::LinearSolveFailed(format!(
                    "singular reduced Jacobian at step {} (t = {}), newton iteration {iteration}",
                    ctx.step, ctx.time
                ))
            })?;
            state += delta;
            applied += 1;
            residual = system.residual(&state, ctx)?;
            norm = residual.norm();
            if !norm.is_finite() {
                break;
            }
        }

        Err(RomError::NonConvergence {
            step: ctx.step,
            time: ctx.time,
            iterations: applied,
            residual: norm,
        })
    }
}
