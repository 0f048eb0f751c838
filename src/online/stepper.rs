use log::{debug, info};
use nalgebra::DVector;

use crate::config::OnlineConfig;
use crate::error::{Result, RomError};
use crate::online::newton::{NewtonOutcome, NewtonSolver};
use crate::online::system::{ReducedSystem, StepContext};

/// Accepted reduced states in time order; the first entry is the initial
/// condition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    times: Vec<f64>,
    states: Vec<DVector<f64>>,
}

impl Trajectory {
    pub fn new(time: f64, initial: DVector<f64>) -> Self {
        Self {
            times: vec![time],
            states: vec![initial],
        }
    }

    pub fn from_states(times: Vec<f64>, states: Vec<DVector<f64>>) -> Result<Self> {
        if times.len() != states.len() {
            return Err(RomError::DimensionMismatch(format!(
                "{} times for {} states",
                times.len(),
                states.len()
            )));
        }
        Ok(Self { times, states })
    }

    pub fn push(&mut self, time: f64, state: DVector<f64>) {
        self.times.push(time);
        self.states.push(state);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn states(&self) -> &[DVector<f64>] {
        &self.states
    }

    pub fn last(&self) -> Option<&DVector<f64>> {
        self.states.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &DVector<f64>)> {
        self.times.iter().copied().zip(self.states.iter())
    }
}

/// Implicit time stepping over a reduced system, one Newton solve per step.
///
/// A failed step leaves the run untouched so the caller can abort or call
/// [`OnlineRun::retry_with`] with another initial guess.
#[derive(Debug)]
pub struct OnlineRun<S> {
    system: S,
    solver: NewtonSolver,
    boundary: DVector<f64>,
    trajectory: Trajectory,
    t_start: f64,
    dt: f64,
    step_count: usize,
    print_every: usize,
}

impl<S: ReducedSystem> OnlineRun<S> {
    pub fn new(system: S, config: &OnlineConfig, boundary: DVector<f64>, initial: DVector<f64>) -> Result<Self> {
        if !(config.dt > 0.0) || config.t_end < config.t_start {
            return Err(RomError::DimensionMismatch(format!(
                "time window [{}, {}] with step {}",
                config.t_start, config.t_end, config.dt
            )));
        }
        if initial.len() != system.dimension() {
            return Err(RomError::DimensionMismatch(format!(
                "initial state of length {} for a reduced system of order {}",
                initial.len(),
                system.dimension()
            )));
        }
        Ok(Self {
            system,
            solver: NewtonSolver::new(config.newton.clone()),
            boundary,
            trajectory: Trajectory::new(config.t_start, initial),
            t_start: config.t_start,
            dt: config.dt,
            step_count: config.step_count(),
            print_every: config.print_every.max(1),
        })
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn into_trajectory(self) -> Trajectory {
        self.trajectory
    }

    /// Number of accepted steps so far.
    pub fn steps_taken(&self) -> usize {
        self.trajectory.len() - 1
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn is_finished(&self) -> bool {
        self.steps_taken() >= self.step_count
    }

    pub fn current_time(&self) -> f64 {
        self.t_start + self.steps_taken() as f64 * self.dt
    }

    /// Solves the next step starting from the last accepted state.
    pub fn advance(&mut self) -> Result<Option<&DVector<f64>>> {
        let guess = match self.trajectory.last() {
            Some(state) => state.clone(),
            None => return Ok(None),
        };
        self.retry_with(guess)
    }

    /// Solves the next step from an explicit initial guess.
    pub fn retry_with(&mut self, guess: DVector<f64>) -> Result<Option<&DVector<f64>>> {
        if self.is_finished() {
            return Ok(None);
        }
        let step = self.steps_taken() + 1;
        let time = self.t_start + step as f64 * self.dt;
        let outcome = {
            let previous = self.trajectory.last().ok_or_else(|| {
                RomError::DimensionMismatch("online run has no initial state".to_string())
            })?;
            let ctx = StepContext {
                step,
                time,
                previous,
                boundary: &self.boundary,
            };
            self.solver.solve(&self.system, guess, &ctx)?
        };
        self.accept(step, time, outcome);
        Ok(self.trajectory.last())
    }

    fn accept(&mut self, step: usize, time: f64, outcome: NewtonOutcome) {
        if step % self.print_every == 0 {
            info!(
                "step {step:>5} | t = {time:.4e} | newton iterations = {} | residual = {:.3e}",
                outcome.iterations, outcome.residual
            );
        } else {
            debug!("step {step} accepted after {} iterations", outcome.iterations);
        }
        self.trajectory.push(time, outcome.state);
    }

    /// Advances until the final time, stopping at the first failed step.
    pub fn run_to_end(&mut self) -> Result<&Trajectory> {
        info!(
            "online run: {} steps of dt = {:.3e} from t = {:.3e}",
            self.step_count, self.dt, self.t_start
        );
        while !self.is_finished() {
            self.advance()?;
        }
        Ok(&self.trajectory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::online::system::LinearSystem;
    use nalgebra::DMatrix;

    fn config(steps: usize) -> OnlineConfig {
        OnlineConfig {
            t_start: 0.0,
            dt: 0.5,
            t_end: 0.5 * steps as f64,
            ..OnlineConfig::default()
        }
    }

    #[test]
    fn trajectory_grows_one_state_per_step() {
        let system = LinearSystem::new(DMatrix::identity(2, 2) * 2.0, DVector::from_vec(vec![2.0, 4.0]))
            .expect("system");
        let mut run = OnlineRun::new(system, &config(3), DVector::zeros(0), DVector::zeros(2)).expect("run");
        let trajectory = run.run_to_end().expect("trajectory");
        assert_eq!(trajectory.len(), 4);
        assert_eq!(trajectory.times(), &[0.0, 0.5, 1.0, 1.5]);
        assert_eq!(trajectory.states()[3], DVector::from_vec(vec![1.0, 2.0]));
        assert!(run.advance().expect("finished run").is_none());
    }

    #[test]
    fn mismatched_initial_state_is_rejected() {
        let system = LinearSystem::new(DMatrix::identity(2, 2), DVector::zeros(2)).expect("system");
        let result = OnlineRun::new(system, &config(1), DVector::zeros(0), DVector::zeros(3));
        assert!(matches!(result, Err(RomError::DimensionMismatch(_))));
    }

    #[test]
    fn non_positive_time_step_is_rejected() {
        let system = LinearSystem::new(DMatrix::identity(2, 2), DVector::zeros(2)).expect("system");
        let config = OnlineConfig {
            dt: 0.0,
            ..config(1)
        };
        let result = OnlineRun::new(system, &config, DVector::zeros(0), DVector::zeros(2));
        assert!(matches!(result, Err(RomError::DimensionMismatch(_))));
    }
}
