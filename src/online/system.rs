use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::config::Stabilization;
use crate::error::{Result, RomError};
use crate::reduced::NavierStokesOperators;

/// What a residual evaluation needs to know about the current time step.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub step: usize,
    pub time: f64,
    /// Accepted state of the previous step.
    pub previous: &'a DVector<f64>,
    /// Boundary coefficients imposed on the leading velocity modes.
    pub boundary: &'a DVector<f64>,
}

/// A reduced nonlinear system `R(x) = 0` solved once per time step.
pub trait ReducedSystem: Send + Sync {
    fn dimension(&self) -> usize;

    fn residual(&self, state: &DVector<f64>, ctx: &StepContext<'_>) -> Result<DVector<f64>>;

    fn jacobian(&self, state: &DVector<f64>, ctx: &StepContext<'_>) -> Result<DMatrix<f64>>;
}

impl<S: ReducedSystem + ?Sized> ReducedSystem for &S {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn residual(&self, state: &DVector<f64>, ctx: &StepContext<'_>) -> Result<DVector<f64>> {
        (**self).residual(state, ctx)
    }

    fn jacobian(&self, state: &DVector<f64>, ctx: &StepContext<'_>) -> Result<DMatrix<f64>> {
        (**self).jacobian(state, ctx)
    }
}

/// Layout of a reduced state: `n_u` velocity coefficients (lift, POD and any
/// supremizer modes) followed by `n_p` pressure coefficients. The first
/// `n_bc` velocity coefficients are fixed by the boundary vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModePartition {
    pub velocity: usize,
    pub pressure: usize,
    pub boundary: usize,
}

impl ModePartition {
    pub fn new(velocity: usize, pressure: usize, boundary: usize) -> Result<Self> {
        if boundary > velocity {
            return Err(RomError::DimensionMismatch(format!(
                "{boundary} boundary coefficients for {velocity} velocity modes"
            )));
        }
        Ok(Self {
            velocity,
            pressure,
            boundary,
        })
    }

    pub fn total(&self) -> usize {
        self.velocity + self.pressure
    }

    pub fn split(&self, state: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        (
            state.rows(0, self.velocity).into_owned(),
            state.rows(self.velocity, self.pressure).into_owned(),
        )
    }
}

/// `aᵀ C a` and its gradient `aᵀ (C + Cᵀ)`.
fn quadratic(c: &DMatrix<f64>, a: &DVector<f64>) -> f64 {
    a.dot(&(c * a))
}

fn quadratic_gradient(c: &DMatrix<f64>, a: &DVector<f64>) -> DVector<f64> {
    c * a + c.tr_mul(a)
}

/// Terms shared by both stabilizations: the implicit Euler momentum balance
/// `-M(a - a_old)/dt + ν B a - aᵀ C_i a - K b`.
#[derive(Debug, Clone)]
struct Momentum {
    ops: Arc<NavierStokesOperators>,
    partition: ModePartition,
    nu: f64,
    dt: f64,
}

impl Momentum {
    fn new(ops: Arc<NavierStokesOperators>, boundary: usize, nu: f64, dt: f64) -> Result<Self> {
        if dt <= 0.0 {
            return Err(RomError::DimensionMismatch(format!("time step must be positive, got {dt}")));
        }
        let partition = ModePartition::new(ops.velocity_dim(), ops.pressure_dim(), boundary)?;
        Ok(Self {
            ops,
            partition,
            nu,
            dt,
        })
    }

    fn check(&self, state: &DVector<f64>, ctx: &StepContext<'_>) -> Result<()> {
        let n = self.partition.total();
        if state.len() != n || ctx.previous.len() != n {
            return Err(RomError::DimensionMismatch(format!(
                "reduced state of length {} (previous {}), expected {n}",
                state.len(),
                ctx.previous.len()
            )));
        }
        if ctx.boundary.len() != self.partition.boundary {
            return Err(RomError::DimensionMismatch(format!(
                "{} boundary values for {} boundary modes",
                ctx.boundary.len(),
                self.partition.boundary
            )));
        }
        Ok(())
    }

    fn residual(&self, a: &DVector<f64>, b: &DVector<f64>, ctx: &StepContext<'_>) -> DVector<f64> {
        let ops = &self.ops;
        let a_old = ctx.previous.rows(0, self.partition.velocity);
        let mut r = -(&ops.mass * (a - a_old)) / self.dt + &ops.diffusion * a * self.nu - &ops.gradient * b;
        for (i, c) in ops.convection.iter().enumerate() {
            r[i] -= quadratic(c, a);
        }
        for j in 0..self.partition.boundary {
            r[j] = a[j] - ctx.boundary[j];
        }
        r
    }

    /// Fills the momentum rows of the full Jacobian.
    fn jacobian(&self, a: &DVector<f64>, jac: &mut DMatrix<f64>) {
        let ops = &self.ops;
        let (nu_dim, np_dim) = (self.partition.velocity, self.partition.pressure);
        let velocity_block = &ops.diffusion * self.nu - &ops.mass / self.dt;
        jac.view_mut((0, 0), (nu_dim, nu_dim)).copy_from(&velocity_block);
        jac.view_mut((0, nu_dim), (nu_dim, np_dim)).copy_from(&(-&ops.gradient));
        for (i, c) in ops.convection.iter().enumerate() {
            let gradient = quadratic_gradient(c, a);
            for k in 0..nu_dim {
                jac[(i, k)] -= gradient[k];
            }
        }
        for j in 0..self.partition.boundary {
            jac.row_mut(j).fill(0.0);
            jac[(j, j)] = 1.0;
        }
    }
}

/// Velocity basis enriched with supremizer modes; pressure rows enforce the
/// reduced continuity equation `P a = 0`.
#[derive(Debug, Clone)]
pub struct SupremizerSystem {
    momentum: Momentum,
    divergence: DMatrix<f64>,
}

impl SupremizerSystem {
    pub fn new(ops: Arc<NavierStokesOperators>, boundary: usize, nu: f64, dt: f64) -> Result<Self> {
        ops.validate(Stabilization::Supremizer)?;
        let divergence = ops
            .divergence
            .clone()
            .ok_or_else(|| RomError::DimensionMismatch("missing reduced divergence".to_string()))?;
        Ok(Self {
            momentum: Momentum::new(ops, boundary, nu, dt)?,
            divergence,
        })
    }

    pub fn partition(&self) -> ModePartition {
        self.momentum.partition
    }
}

impl ReducedSystem for SupremizerSystem {
    fn dimension(&self) -> usize {
        self.momentum.partition.total()
    }

    fn residual(&self, state: &DVector<f64>, ctx: &StepContext<'_>) -> Result<DVector<f64>> {
        self.momentum.check(state, ctx)?;
        let (a, b) = self.momentum.partition.split(state);
        let momentum = self.momentum.residual(&a, &b, ctx);
        let continuity = &self.divergence * &a;
        Ok(DVector::from_iterator(
            self.dimension(),
            momentum.iter().chain(continuity.iter()).copied(),
        ))
    }

    fn jacobian(&self, state: &DVector<f64>, ctx: &StepContext<'_>) -> Result<DMatrix<f64>> {
        self.momentum.check(state, ctx)?;
        let partition = self.momentum.partition;
        let (a, _) = partition.split(state);
        let mut jac = DMatrix::zeros(partition.total(), partition.total());
        self.momentum.jacobian(&a, &mut jac);
        jac.view_mut((partition.velocity, 0), (partition.pressure, partition.velocity))
            .copy_from(&self.divergence);
        Ok(jac)
    }
}

/// Pressure rows come from the reduced pressure Poisson equation
/// `D b + aᵀ G_j a - ν BC3 a = 0`.
#[derive(Debug, Clone)]
pub struct PpeSystem {
    momentum: Momentum,
    laplacian: DMatrix<f64>,
    boundary_term: DMatrix<f64>,
}

impl PpeSystem {
    pub fn new(ops: Arc<NavierStokesOperators>, boundary: usize, nu: f64, dt: f64) -> Result<Self> {
        ops.validate(Stabilization::Ppe)?;
        let laplacian = ops
            .pressure_laplacian
            .clone()
            .ok_or_else(|| RomError::DimensionMismatch("missing reduced pressure Laplacian".to_string()))?;
        let boundary_term = ops
            .pressure_boundary
            .clone()
            .unwrap_or_else(|| DMatrix::zeros(ops.pressure_dim(), ops.velocity_dim()));
        Ok(Self {
            momentum: Momentum::new(ops, boundary, nu, dt)?,
            laplacian,
            boundary_term,
        })
    }

    pub fn partition(&self) -> ModePartition {
        self.momentum.partition
    }
}

impl ReducedSystem for PpeSystem {
    fn dimension(&self) -> usize {
        self.momentum.partition.total()
    }

    fn residual(&self, state: &DVector<f64>, ctx: &StepContext<'_>) -> Result<DVector<f64>> {
        self.momentum.check(state, ctx)?;
        let (a, b) = self.momentum.partition.split(state);
        let momentum = self.momentum.residual(&a, &b, ctx);
        let mut pressure = &self.laplacian * &b - &self.boundary_term * &a * self.momentum.nu;
        for (j, g) in self.momentum.ops.pressure_convection.iter().enumerate() {
            pressure[j] += quadratic(g, &a);
        }
        Ok(DVector::from_iterator(
            self.dimension(),
            momentum.iter().chain(pressure.iter()).copied(),
        ))
    }

    fn jacobian(&self, state: &DVector<f64>, ctx: &StepContext<'_>) -> Result<DMatrix<f64>> {
        self.momentum.check(state, ctx)?;
        let partition = self.momentum.partition;
        let (nu_dim, np_dim) = (partition.velocity, partition.pressure);
        let (a, _) = partition.split(state);
        let mut jac = DMatrix::zeros(partition.total(), partition.total());
        self.momentum.jacobian(&a, &mut jac);

        let mut coupling = -&self.boundary_term * self.momentum.nu;
        for (j, g) in self.momentum.ops.pressure_convection.iter().enumerate() {
            let gradient = quadratic_gradient(g, &a);
            for k in 0..nu_dim {
                coupling[(j, k)] += gradient[k];
            }
        }
        jac.view_mut((nu_dim, 0), (np_dim, nu_dim)).copy_from(&coupling);
        jac.view_mut((nu_dim, nu_dim), (np_dim, np_dim))
            .copy_from(&self.laplacian);
        Ok(jac)
    }
}

/// The Navier-Stokes reduced system, with the stabilization picked at
/// construction.
#[derive(Debug, Clone)]
pub enum NavierStokesSystem {
    Supremizer(SupremizerSystem),
    Ppe(PpeSystem),
}

impl NavierStokesSystem {
    pub fn new(
        stabilization: Stabilization,
        ops: Arc<NavierStokesOperators>,
        boundary: usize,
        nu: f64,
        dt: f64,
    ) -> Result<Self> {
        Ok(match stabilization {
            Stabilization::Supremizer => Self::Supremizer(SupremizerSystem::new(ops, boundary, nu, dt)?),
            Stabilization::Ppe => Self::Ppe(PpeSystem::new(ops, boundary, nu, dt)?),
        })
    }

    pub fn partition(&self) -> ModePartition {
        match self {
            Self::Supremizer(system) => system.partition(),
            Self::Ppe(system) => system.partition(),
        }
    }
}

impl ReducedSystem for NavierStokesSystem {
    fn dimension(&self) -> usize {
        match self {
            Self::Supremizer(system) => system.dimension(),
            Self::Ppe(system) => system.dimension(),
        }
    }

    fn residual(&self, state: &DVector<f64>, ctx: &StepContext<'_>) -> Result<DVector<f64>> {
        match self {
            Self::Supremizer(system) => system.residual(state, ctx),
            Self::Ppe(system) => system.residual(state, ctx),
        }
    }

    fn jacobian(&self, state: &DVector<f64>, ctx: &StepContext<'_>) -> Result<DMatrix<f64>> {
        match self {
            Self::Supremizer(system) => system.jacobian(state, ctx),
            Self::Ppe(system) => system.jacobian(state, ctx),
        }
    }
}

/// `R(x) = A x - b`, independent of the time step.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    pub matrix: DMatrix<f64>,
    pub rhs: DVector<f64>,
}

impl LinearSystem {
    pub fn new(matrix: DMatrix<f64>, rhs: DVector<f64>) -> Result<Self> {
        if !matrix.is_square() || matrix.nrows() != rhs.len() {
            return Err(RomError::DimensionMismatch(format!(
                "{}x{} system with a right-hand side of length {}",
                matrix.nrows(),
                matrix.ncols(),
                rhs.len()
            )));
        }
        Ok(Self { matrix, rhs })
    }
}

impl ReducedSystem for LinearSystem {
    fn dimension(&self) -> usize {
        self.rhs.len()
    }

    fn residual(&self, state: &DVector<f64>, _ctx: &StepContext<'_>) -> Result<DVector<f64>> {
        if state.len() != self.dimension() {
            return Err(RomError::DimensionMismatch(format!(
                "state of length {} for a system of order {}",
                state.len(),
                self.dimension()
            )));
        }
        Ok(&self.matrix * state - &self.rhs)
    }

    fn jacobian(&self, _state: &DVector<f64>, _ctx: &StepContext<'_>) -> Result<DMatrix<f64>> {
        Ok(self.matrix.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operators(np: usize) -> NavierStokesOperators {
        let nu = 3;
        NavierStokesOperators {
            mass: DMatrix::identity(nu, nu),
            diffusion: DMatrix::from_fn(nu, nu, |i, j| if i == j { -2.0 } else { 0.3 }),
            convection: (0..nu)
                .map(|i| DMatrix::from_fn(nu, nu, |j, k| 0.1 * (i + j) as f64 - 0.05 * k as f64))
                .collect(),
            gradient: DMatrix::from_fn(nu, np, |i, j| 0.2 * (i + 2 * j) as f64),
            divergence: Some(DMatrix::from_fn(np, nu, |i, j| (i + j) as f64 * 0.5 + 0.1)),
            pressure_laplacian: Some(DMatrix::from_fn(np, np, |i, j| if i == j { 1.5 } else { 0.1 })),
            pressure_convection: (0..np)
                .map(|j| DMatrix::from_fn(nu, nu, |k, l| 0.02 * (j + k * l) as f64))
                .collect(),
            pressure_boundary: Some(DMatrix::from_element(np, nu, 0.4)),
        }
    }

    /// Central differences of the residual, column by column.
    fn finite_difference<S: ReducedSystem>(system: &S, state: &DVector<f64>, ctx: &StepContext<'_>) -> DMatrix<f64> {
        let h = 1e-6;
        let n = system.dimension();
        let mut jac = DMatrix::zeros(n, n);
        for k in 0..n {
            let mut plus = state.clone();
            let mut minus = state.clone();
            plus[k] += h;
            minus[k] -= h;
            let column = (system.residual(&plus, ctx).expect("residual")
                - system.residual(&minus, ctx).expect("residual"))
                / (2.0 * h);
            jac.set_column(k, &column);
        }
        jac
    }

    fn check_jacobian(stabilization: Stabilization) {
        let ops = Arc::new(operators(2));
        let system = NavierStokesSystem::new(stabilization, ops, 1, 0.05, 0.1).expect("system");
        let previous = DVector::from_vec(vec![1.0, 0.2, -0.3, 0.1, 0.0]);
        let boundary = DVector::from_vec(vec![1.0]);
        let ctx = StepContext {
            step: 1,
            time: 0.1,
            previous: &previous,
            boundary: &boundary,
        };
        let state = DVector::from_vec(vec![0.9, 0.4, -0.1, 0.3, -0.2]);
        let analytic = system.jacobian(&state, &ctx).expect("jacobian");
        let numeric = finite_difference(&system, &state, &ctx);
        assert!((analytic - numeric).amax() < 1e-6);
    }

    #[test]
    fn supremizer_jacobian_matches_finite_differences() {
        check_jacobian(Stabilization::Supremizer);
    }

    #[test]
    fn ppe_jacobian_matches_finite_differences() {
        check_jacobian(Stabilization::Ppe);
    }

    #[test]
    fn boundary_rows_pin_leading_coefficients() {
        let ops = Arc::new(operators(2));
        let system = NavierStokesSystem::new(Stabilization::Supremizer, ops, 2, 0.05, 0.1).expect("system");
        let previous = DVector::zeros(5);
        let boundary = DVector::from_vec(vec![1.0, -1.0]);
        let ctx = StepContext {
            step: 1,
            time: 0.1,
            previous: &previous,
            boundary: &boundary,
        };
        let state = DVector::from_vec(vec![1.5, -1.0, 0.0, 0.0, 0.0]);
        let residual = system.residual(&state, &ctx).expect("residual");
        assert_eq!(residual[0], 0.5);
        assert_eq!(residual[1], 0.0);
    }

    #[test]
    fn wrong_boundary_length_is_rejected() {
        let system = NavierStokesSystem::new(Stabilization::Ppe, Arc::new(operators(2)), 1, 0.05, 0.1)
            .expect("system");
        let previous = DVector::zeros(5);
        let boundary = DVector::zeros(3);
        let ctx = StepContext {
            step: 1,
            time: 0.1,
            previous: &previous,
            boundary: &boundary,
        };
        assert!(matches!(
            system.residual(&previous, &ctx),
            Err(RomError::DimensionMismatch(_))
        ));
    }
}
