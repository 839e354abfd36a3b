//! One-dimensional probability densities for invariant-mass fits.
//!
//! Every PDF is normalised on a finite support `[lo, hi]` (the fit window)
//! and exposes analytic gradients, sub-range probability content and a
//! sampler. Shape parameters are passed as flat slices in the order given by
//! [`UnbinnedPdf::parameter_names`].

use hs_core::{Error, Result};
use rand::RngCore;

mod chebyshev;
mod crystal_ball;
mod gaussian;

pub use chebyshev::ChebyshevPdf;
pub use crystal_ball::DoubleCrystalBallPdf;
pub use gaussian::GaussianPdf;

/// Normalised 1D density on a bounded support.
pub trait UnbinnedPdf: Send + Sync + std::fmt::Debug {
    /// Short identifier (`"dscb"`, `"gaus"`, `"pol1"`, ...).
    fn name(&self) -> &'static str;

    /// Shape parameter names (stable order).
    fn parameter_names(&self) -> Vec<String>;

    /// Number of shape parameters.
    fn n_params(&self) -> usize {
        self.parameter_names().len()
    }

    /// Evaluate `log p(x | params)` for every `x` in `xs`.
    fn log_prob_batch(
        &self,
        xs: &[f64],
        support: (f64, f64),
        params: &[f64],
        out: &mut [f64],
    ) -> Result<()>;

    /// Evaluate `log p(x|params)` and its gradient w.r.t the shape parameters.
    ///
    /// `out_grad` is row-major `[event0_param0, event0_param1, ..., event1_param0, ...]`.
    fn log_prob_grad_batch(
        &self,
        xs: &[f64],
        support: (f64, f64),
        params: &[f64],
        out_logp: &mut [f64],
        out_grad: &mut [f64],
    ) -> Result<()>;

    /// Probability content of `[range.0, range.1] ∩ support`.
    fn integral_fraction(&self, params: &[f64], support: (f64, f64), range: (f64, f64))
    -> Result<f64>;

    /// Draw `n` values on `support`.
    fn sample(
        &self,
        params: &[f64],
        n: usize,
        support: (f64, f64),
        rng: &mut dyn RngCore,
    ) -> Result<Vec<f64>>;

    /// Normalised density at a single point.
    fn density(&self, x: f64, support: (f64, f64), params: &[f64]) -> Result<f64> {
        let mut out = [0.0];
        self.log_prob_batch(&[x], support, params, &mut out)?;
        Ok(out[0].exp())
    }
}

pub(crate) fn check_params(name: &str, params: &[f64], expected: usize) -> Result<()> {
    if params.len() != expected {
        return Err(Error::Validation(format!(
            "{name} expects {expected} params, got {}",
            params.len()
        )));
    }
    if params.iter().any(|p| !p.is_finite()) {
        return Err(Error::Validation(format!("{name} params must be finite, got {params:?}")));
    }
    Ok(())
}

pub(crate) fn check_support(name: &str, support: (f64, f64)) -> Result<()> {
    let (a, b) = support;
    if !(a.is_finite() && b.is_finite() && a < b) {
        return Err(Error::Validation(format!(
            "{name}: support must be finite with low < high, got ({a}, {b})"
        )));
    }
    Ok(())
}

pub(crate) fn check_out_len(name: &str, what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(Error::Validation(format!(
            "{name} {what} length mismatch: expected {expected}, got {got}"
        )));
    }
    Ok(())
}

/// Intersection of `range` with `support`; `None` when empty.
pub(crate) fn clip_range(support: (f64, f64), range: (f64, f64)) -> Option<(f64, f64)> {
    let lo = range.0.max(support.0);
    let hi = range.1.min(support.1);
    (hi > lo).then_some((lo, hi))
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::UnbinnedPdf;

    /// Compare analytic gradients with central finite differences of `log_prob_batch`.
    pub fn check_gradient(pdf: &dyn UnbinnedPdf, xs: &[f64], support: (f64, f64), params: &[f64]) {
        let n = xs.len();
        let p = params.len();
        let mut logp = vec![0.0; n];
        let mut grad = vec![0.0; n * p];
        pdf.log_prob_grad_batch(xs, support, params, &mut logp, &mut grad).unwrap();

        let mut plain = vec![0.0; n];
        pdf.log_prob_batch(xs, support, params, &mut plain).unwrap();
        for (a, b) in logp.iter().zip(&plain) {
            assert!((a - b).abs() < 1e-10, "logp mismatch {a} vs {b}");
        }

        for j in 0..p {
            let h = 1e-6 * params[j].abs().max(1e-3);
            let mut up = params.to_vec();
            up[j] += h;
            let mut dn = params.to_vec();
            dn[j] -= h;
            let mut lu = vec![0.0; n];
            let mut ld = vec![0.0; n];
            pdf.log_prob_batch(xs, support, &up, &mut lu).unwrap();
            pdf.log_prob_batch(xs, support, &dn, &mut ld).unwrap();
            for i in 0..n {
                let fd = (lu[i] - ld[i]) / (2.0 * h);
                let an = grad[i * p + j];
                let tol = 1e-4 * fd.abs().max(1.0);
                assert!((fd - an).abs() < tol, "param {j} event {i}: analytic {an} vs numeric {fd}");
            }
        }
    }

    /// Trapezoid integral of the density over the support.
    pub fn integrate_density(pdf: &dyn UnbinnedPdf, support: (f64, f64), params: &[f64]) -> f64 {
        let n = 20_000;
        let h = (support.1 - support.0) / n as f64;
        let xs: Vec<f64> = (0..=n).map(|i| support.0 + h * i as f64).collect();
        let mut lp = vec![0.0; xs.len()];
        pdf.log_prob_batch(&xs, support, params, &mut lp).unwrap();
        let f: Vec<f64> = lp.iter().map(|v| v.exp()).collect();
        h * (f.iter().sum::<f64>() - 0.5 * (f[0] + f[n]))
    }
}
