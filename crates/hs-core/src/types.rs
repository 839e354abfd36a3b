//! Common data types for hyperspec

use serde::{Deserialize, Serialize};

/// Fit result containing parameter estimates and uncertainties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Parameter names, same order as `parameters`
    pub names: Vec<String>,

    /// Best-fit parameter values
    pub parameters: Vec<f64>,

    /// Parameter uncertainties (sqrt of covariance diagonal). Frozen parameters report 0.
    pub uncertainties: Vec<f64>,

    /// Covariance matrix (row-major, N×N). `None` if Hessian inversion failed.
    pub covariance: Option<Vec<f64>>,

    /// Negative log-likelihood at minimum
    pub nll: f64,

    /// Convergence status reported by the minimiser
    pub converged: bool,

    /// Minimiser iterations
    pub n_iter: usize,

    /// Number of function evaluations
    pub n_evaluations: usize,

    /// Minimiser termination message
    pub message: String,
}

impl FitResult {
    /// Value of the named parameter.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.index(name).map(|i| self.parameters[i])
    }

    /// Uncertainty of the named parameter.
    pub fn error(&self, name: &str) -> Option<f64> {
        self.index(name).map(|i| self.uncertainties[i])
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Covariance element (i, j). Returns `None` if covariance is unavailable.
    pub fn covariance_at(&self, i: usize, j: usize) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let n = self.parameters.len();
        if i >= n || j >= n {
            return None;
        }
        Some(cov[i * n + j])
    }

    /// Get correlation matrix element (i, j). Returns `None` if covariance is unavailable.
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        let c = self.covariance_at(i, j)?;
        let sigma_i = self.uncertainties[i];
        let sigma_j = self.uncertainties[j];
        if sigma_i <= 0.0 || sigma_j <= 0.0 {
            return None;
        }
        Some(c / (sigma_i * sigma_j))
    }
}

/// A value with a symmetric uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Measurement {
    /// Central value
    pub value: f64,
    /// One-sigma uncertainty
    pub error: f64,
}

impl Measurement {
    /// Construct from value and error.
    pub const fn new(value: f64, error: f64) -> Self {
        Self { value, error }
    }

    /// Relative uncertainty, 0 when the value is 0.
    pub fn relative_error(&self) -> f64 {
        if self.value == 0.0 { 0.0 } else { (self.error / self.value).abs() }
    }
}

impl std::fmt::Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6} ± {:.6}", self.value, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn result() -> FitResult {
        FitResult {
            names: vec!["mu".into(), "sigma".into()],
            parameters: vec![1.0, 2.0],
            uncertainties: vec![0.1, 0.2],
            covariance: Some(vec![0.01, 0.01, 0.01, 0.04]),
            nll: 123.45,
            converged: true,
            n_iter: 12,
            n_evaluations: 100,
            message: "ok".into(),
        }
    }

    #[test]
    fn test_fit_result_lookup() {
        let r = result();
        assert_eq!(r.value("sigma"), Some(2.0));
        assert_eq!(r.error("mu"), Some(0.1));
        assert_eq!(r.value("nope"), None);
    }

    #[test]
    fn test_correlation() {
        let r = result();
        assert_relative_eq!(r.correlation(0, 1).unwrap(), 0.5, epsilon = 1e-12);
        assert!(r.correlation(0, 5).is_none());
    }

    #[test]
    fn test_measurement_relative_error() {
        assert_relative_eq!(Measurement::new(10.0, 1.0).relative_error(), 0.1);
        assert_eq!(Measurement::new(0.0, 1.0).relative_error(), 0.0);
    }
}
