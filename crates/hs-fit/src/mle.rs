//! Maximum likelihood estimation.
//!
//! The minimiser works on the free parameters only, each rescaled to the unit
//! interval `u = (x - lo) / (hi - lo)`. Mass-fit parameters span very
//! different scales (a peak position in GeV next to a width in MeV next to
//! event counts in the thousands), and the rescaling keeps the L-BFGS
//! line search and the finite-difference Hessian well conditioned.

use hs_core::{Error, FitResult, LogDensityModel, Result};
use nalgebra::DMatrix;

use crate::optimizer::{LbfgsbOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};

/// NLL of a model as a function of its free parameters in unit-box coordinates.
struct UnitBoxObjective<'a, M: LogDensityModel + ?Sized> {
    model: &'a M,
    template: Vec<f64>,
    free: Vec<usize>,
    lo: Vec<f64>,
    span: Vec<f64>,
}

impl<'a, M: LogDensityModel + ?Sized> UnitBoxObjective<'a, M> {
    fn new(model: &'a M, init: &[f64]) -> Result<Self> {
        let bounds = model.parameter_bounds();
        if init.len() != bounds.len() || bounds.len() != model.dim() {
            return Err(Error::Validation(format!(
                "model dimension mismatch: dim={}, bounds={}, init={}",
                model.dim(),
                bounds.len(),
                init.len()
            )));
        }
        let template: Vec<f64> =
            init.iter().zip(&bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect();
        let free = model.free_parameters();
        let lo = free.iter().map(|&i| bounds[i].0).collect();
        let span = free.iter().map(|&i| bounds[i].1 - bounds[i].0).collect();
        Ok(Self { model, template, free, lo, span })
    }

    fn to_unit(&self, full: &[f64]) -> Vec<f64> {
        self.free
            .iter()
            .enumerate()
            .map(|(k, &i)| ((full[i] - self.lo[k]) / self.span[k]).clamp(0.0, 1.0))
            .collect()
    }

    fn to_full(&self, u: &[f64]) -> Vec<f64> {
        let mut full = self.template.clone();
        for (k, &i) in self.free.iter().enumerate() {
            full[i] = self.lo[k] + u[k] * self.span[k];
        }
        full
    }
}

impl<M: LogDensityModel + ?Sized> ObjectiveFunction for UnitBoxObjective<'_, M> {
    fn eval(&self, u: &[f64]) -> Result<f64> {
        self.model.nll(&self.to_full(u))
    }

    fn gradient(&self, u: &[f64]) -> Result<Vec<f64>> {
        let g = self.model.grad_nll(&self.to_full(u))?;
        Ok(self.free.iter().zip(&self.span).map(|(&i, s)| g[i] * s).collect())
    }
}

/// Maximum Likelihood Estimator
///
/// Fits statistical models by minimizing negative log-likelihood.
#[derive(Debug, Clone, Default)]
pub struct MaximumLikelihoodEstimator {
    config: OptimizerConfig,
}

impl MaximumLikelihoodEstimator {
    /// Create a new MLE with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create MLE with custom optimizer configuration
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Access the optimizer configuration.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Fit any [`LogDensityModel`] from its suggested initial values.
    pub fn fit<M: LogDensityModel + ?Sized>(&self, model: &M) -> Result<FitResult> {
        self.fit_from(model, &model.parameter_init())
    }

    /// Fit from an explicit starting point, with Hessian-based uncertainties.
    ///
    /// Frozen parameters (`lo == hi`) keep their value and report zero
    /// uncertainty and zero covariance.
    pub fn fit_from<M: LogDensityModel + ?Sized>(
        &self,
        model: &M,
        init: &[f64],
    ) -> Result<FitResult> {
        let objective = UnitBoxObjective::new(model, init)?;
        let names = model.parameter_names();
        let n = objective.template.len();

        if objective.free.is_empty() {
            let nll = model.nll(&objective.template)?;
            return Ok(FitResult {
                names,
                parameters: objective.template.clone(),
                uncertainties: vec![0.0; n],
                covariance: Some(vec![0.0; n * n]),
                nll,
                converged: true,
                n_iter: 0,
                n_evaluations: 1,
                message: "no free parameters".into(),
            });
        }

        let u0 = objective.to_unit(&objective.template);
        let start = objective.eval(&u0)?;
        if !start.is_finite() {
            return Err(Error::Computation(format!("NLL is not finite at the initial point: {start}")));
        }

        let optimizer = LbfgsbOptimizer::new(self.config.clone());
        let unit_bounds = vec![(0.0, 1.0); u0.len()];
        let opt = optimizer.minimize(&objective, &u0, &unit_bounds)?;
        log_status(&opt, start);

        let hessian = self.compute_hessian(&objective, &opt.parameters)?;
        let m = objective.free.len();
        let (cov_u, cov_ok) = match self.invert_hessian(&hessian, m) {
            Some(cov) => (cov, true),
            None => {
                log::warn!("Hessian inversion failed, using diagonal approximation");
                let sig = self.diagonal_uncertainties(&hessian, m);
                (DMatrix::from_fn(m, m, |i, j| if i == j { sig[i] * sig[i] } else { 0.0 }), false)
            }
        };

        let mut covariance = vec![0.0; n * n];
        let mut uncertainties = vec![0.0; n];
        for (a, &i) in objective.free.iter().enumerate() {
            for (b, &j) in objective.free.iter().enumerate() {
                covariance[i * n + j] = cov_u[(a, b)] * objective.span[a] * objective.span[b];
            }
            uncertainties[i] = covariance[i * n + i].max(0.0).sqrt();
        }

        let mut message = opt.message.clone();
        if !cov_ok {
            message.push_str("; diagonal uncertainties");
        }

        Ok(FitResult {
            names,
            parameters: objective.to_full(&opt.parameters),
            uncertainties,
            covariance: cov_ok.then_some(covariance),
            nll: opt.fval,
            converged: opt.converged,
            n_iter: opt.n_iter as usize,
            n_evaluations: opt.n_fev + opt.n_gev,
            message,
        })
    }

    /// Hessian of the unit-box objective by forward differences of the gradient.
    ///
    /// A backward step is taken for coordinates sitting at the upper bound.
    fn compute_hessian(
        &self,
        objective: &dyn ObjectiveFunction,
        best: &[f64],
    ) -> Result<DMatrix<f64>> {
        let m = best.len();
        let grad_center = objective.gradient(best)?;
        let mut hessian = DMatrix::zeros(m, m);

        for j in 0..m {
            let eps = if best[j] + 1e-4 > 1.0 { -1e-4 } else { 1e-4 };
            let mut shifted = best.to_vec();
            shifted[j] += eps;
            let grad_shift = objective.gradient(&shifted)?;
            for i in 0..m {
                hessian[(i, j)] = (grad_shift[i] - grad_center[i]) / eps;
            }
        }

        let ht = hessian.transpose();
        Ok((&hessian + &ht) * 0.5)
    }

    /// Invert the Hessian with a damped Cholesky solve, then LU.
    ///
    /// Returns `None` when no positive variances come out.
    fn invert_hessian(&self, hessian: &DMatrix<f64>, n: usize) -> Option<DMatrix<f64>> {
        let identity = DMatrix::identity(n, n);
        let diag_scale = (0..n).map(|i| hessian[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);

        let mut h_damped = hessian.clone();
        let mut damping = 0.0_f64;
        let max_attempts = 10;

        for attempt in 0..max_attempts {
            if let Some(chol) = nalgebra::linalg::Cholesky::new(h_damped.clone()) {
                if attempt > 0 {
                    log::debug!("Hessian needed diagonal damping {damping:.3e}");
                }
                return Some(chol.solve(&identity));
            }
            if attempt + 1 == max_attempts {
                break;
            }
            let next = if damping == 0.0 { diag_scale * 1e-9 } else { damping * 10.0 };
            for i in 0..n {
                h_damped[(i, i)] += next - damping;
            }
            damping = next;
        }

        let cov = h_damped.lu().try_inverse()?;
        (0..n).all(|i| cov[(i, i)].is_finite() && cov[(i, i)] > 0.0).then_some(cov)
    }

    /// `1 / sqrt(|H_ii|)` per parameter.
    fn diagonal_uncertainties(&self, hessian: &DMatrix<f64>, n: usize) -> Vec<f64> {
        (0..n).map(|i| 1.0 / hessian[(i, i)].abs().max(1e-12).sqrt()).collect()
    }
}

fn log_status(opt: &OptimizationResult, start: f64) {
    if opt.converged {
        log::debug!("fit converged: {opt} (start nll {start:.6})");
    } else {
        log::warn!("fit did not converge: {} ({opt})", opt.message);
    }
}
