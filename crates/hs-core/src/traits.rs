//! Core traits for hyperspec
//!
//! The inference layer (`hs-fit::mle`) depends only on [`LogDensityModel`],
//! never on a concrete mass model.

use crate::Result;

/// Model interface consumed by the maximum-likelihood estimator.
pub trait LogDensityModel: Send + Sync {
    /// Number of parameters.
    fn dim(&self) -> usize;

    /// Parameter names (stable order).
    fn parameter_names(&self) -> Vec<String>;

    /// Parameter bounds (min, max) (stable order). `min == max` marks a frozen parameter.
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;

    /// Suggested initial values (stable order).
    fn parameter_init(&self) -> Vec<f64>;

    /// Negative log-likelihood.
    fn nll(&self, params: &[f64]) -> Result<f64>;

    /// Gradient of NLL.
    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>>;

    /// Indices of parameters that are free to float (bounds not collapsed).
    fn free_parameters(&self) -> Vec<usize> {
        self.parameter_bounds()
            .iter()
            .enumerate()
            .filter(|(_, (lo, hi))| hi > lo)
            .map(|(i, _)| i)
            .collect()
    }
}
