//! Bounded L-BFGS minimisation on top of argmin.
//!
//! Box constraints are enforced by clamping the parameters before every
//! evaluation and projecting the gradient at active bounds.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use hs_core::{Error, Result};

/// Minimiser settings.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Maximum number of iterations
    pub max_iter: u64,
    /// Convergence tolerance for gradient norm
    pub tol: f64,
    /// Number of corrections to approximate inverse Hessian
    pub m: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 1000, tol: 1e-6, m: 10 }
    }
}

/// Outcome of a minimisation.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best parameters found (inside the bounds)
    pub parameters: Vec<f64>,
    /// Function value at the best parameters
    pub fval: f64,
    /// Number of iterations
    pub n_iter: u64,
    /// Number of objective (cost) evaluations.
    pub n_fev: usize,
    /// Number of gradient evaluations.
    pub n_gev: usize,
    /// Whether the solver reported convergence
    pub converged: bool,
    /// Termination message
    pub message: String,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizationResult(fval={:.6}, n_iter={}, n_fev={}, n_gev={}, converged={})",
            self.fval, self.n_iter, self.n_fev, self.n_gev, self.converged
        )
    }
}

/// Function to minimise.
pub trait ObjectiveFunction: Send + Sync {
    /// Evaluate function at given parameters
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Gradient; central differences unless overridden.
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; params.len()];
        let mut work = params.to_vec();
        for i in 0..params.len() {
            let eps = 1e-8 * params[i].abs().max(1.0);
            work[i] = params[i] + eps;
            let f_plus = self.eval(&work)?;
            work[i] = params[i] - eps;
            let f_minus = self.eval(&work)?;
            work[i] = params[i];
            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }
        Ok(grad)
    }
}

pub(crate) fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

#[derive(Default)]
struct FuncCounts {
    cost: AtomicUsize,
    grad: AtomicUsize,
}

/// Adapter exposing an [`ObjectiveFunction`] to argmin.
struct ArgminProblem<'a> {
    objective: &'a dyn ObjectiveFunction,
    bounds: &'a [(f64, f64)],
    counts: Arc<FuncCounts>,
}

impl CostFunction for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.counts.cost.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        self.objective.eval(&clamped).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

impl Gradient for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        params: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        self.counts.grad.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        let mut g = self
            .objective
            .gradient(&clamped)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?;

        // Zero components that push further outside an active bound.
        const EPS: f64 = 1e-12;
        for (gi, (&x, &(lo, hi))) in g.iter_mut().zip(clamped.iter().zip(self.bounds)) {
            if (x <= lo + EPS && *gi > 0.0) || (x >= hi - EPS && *gi < 0.0) {
                *gi = 0.0;
            }
        }
        Ok(g)
    }
}

/// L-BFGS with box constraints.
#[derive(Debug, Clone, Default)]
pub struct LbfgsbOptimizer {
    config: OptimizerConfig,
}

impl LbfgsbOptimizer {
    /// Optimiser with the given configuration.
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Configuration in use.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Minimise `objective` starting at `init_params` within `bounds`.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init_params: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<OptimizationResult> {
        if init_params.len() != bounds.len() {
            return Err(Error::Validation(format!(
                "Parameter and bounds length mismatch: {} != {}",
                init_params.len(),
                bounds.len()
            )));
        }
        if let Some((i, b)) = bounds.iter().enumerate().find(|(_, (lo, hi))| !(lo <= hi)) {
            return Err(Error::Validation(format!("invalid bounds for parameter {i}: {b:?}")));
        }

        let init_clamped = clamp_params(init_params, bounds);
        let counts = Arc::new(FuncCounts::default());
        let problem = ArgminProblem { objective, bounds, counts: counts.clone() };

        // argmin's default cost tolerance (~EPS) is too strict for NLL scales.
        let tol_cost =
            if self.config.tol == 0.0 { 0.0 } else { (0.1 * self.config.tol).max(1e-12) };
        let solver = LBFGS::new(MoreThuenteLineSearch::new(), self.config.m)
            .with_tolerance_grad(self.config.tol)
            .and_then(|s| s.with_tolerance_cost(tol_cost))
            .map_err(|e| Error::Validation(format!("invalid optimizer configuration: {e}")))?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.param(init_clamped).max_iters(self.config.max_iter))
            .run()
            .map_err(|e| Error::Computation(format!("minimisation failed: {e}")))?;

        let state = res.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| Error::Computation("minimiser returned no parameters".into()))?;
        let termination = state.get_termination_status();
        let converged = matches!(
            termination,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        );

        Ok(OptimizationResult {
            parameters: clamp_params(best, bounds),
            fval: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_fev: counts.cost.load(Ordering::Relaxed),
            n_gev: counts.grad.load(Ordering::Relaxed),
            converged,
            message: termination.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // f(x, y) = (x - 2)^2 + (y - 3)^2
    struct QuadraticFunction;

    impl ObjectiveFunction for QuadraticFunction {
        fn eval(&self, params: &[f64]) -> Result<f64> {
            Ok((params[0] - 2.0).powi(2) + (params[1] - 3.0).powi(2))
        }

        fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![2.0 * (params[0] - 2.0), 2.0 * (params[1] - 3.0)])
        }
    }

    // Uses the numerical default gradient.
    struct Rosenbrock;

    impl ObjectiveFunction for Rosenbrock {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok((1.0 - p[0]).powi(2) + 100.0 * (p[1] - p[0] * p[0]).powi(2))
        }
    }

    #[test]
    fn test_optimizer_quadratic() {
        let optimizer = LbfgsbOptimizer::new(OptimizerConfig { max_iter: 100, tol: 1e-6, m: 10 });
        let result =
            optimizer.minimize(&QuadraticFunction, &[0.0, 0.0], &[(-10.0, 10.0), (-10.0, 10.0)]);
        let result = result.unwrap();
        assert!(result.converged, "Optimizer should converge: {}", result.message);
        assert_relative_eq!(result.parameters[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[1], 3.0, epsilon = 1e-4);
        assert_relative_eq!(result.fval, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_optimizer_with_bounds() {
        let optimizer = LbfgsbOptimizer::default();
        // Optimal within bounds: x=3, y=2
        let result =
            optimizer.minimize(&QuadraticFunction, &[4.0, 1.5], &[(3.0, 5.0), (1.0, 2.0)]).unwrap();
        assert_relative_eq!(result.parameters[0], 3.0, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[1], 2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_optimizer_numerical_gradient() {
        let optimizer = LbfgsbOptimizer::default();
        let result =
            optimizer.minimize(&Rosenbrock, &[-1.2, 1.0], &[(-5.0, 5.0), (-5.0, 5.0)]).unwrap();
        assert_relative_eq!(result.parameters[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(result.parameters[1], 1.0, epsilon = 2e-3);
        assert!(result.n_fev > 0 && result.n_gev > 0);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let optimizer = LbfgsbOptimizer::default();
        assert!(optimizer.minimize(&QuadraticFunction, &[0.0], &[(0.0, 1.0), (0.0, 1.0)]).is_err());
        assert!(optimizer.minimize(&QuadraticFunction, &[0.0, 0.0], &[(1.0, 0.0), (0.0, 1.0)]).is_err());
    }
}
