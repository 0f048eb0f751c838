pub mod affine;
pub mod navier_stokes;
pub mod newton;
pub mod stepper;
pub mod system;

pub use affine::AffineLinearProblem;
pub use navier_stokes::ReducedNavierStokes;
pub use newton::{NewtonOutcome, NewtonSolver};
pub use stepper::{OnlineRun, Trajectory};
pub use system::{
    LinearSystem, ModePartition, NavierStokesSystem, PpeSystem, ReducedSystem, StepContext, SupremizerSystem,
};
