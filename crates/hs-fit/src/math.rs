//! Small numerical helpers shared by the PDFs and fit diagnostics.

use std::f64::consts::SQRT_2;

use statrs::distribution::{ChiSquared, ContinuousCDF};

/// `log(exp(a) + exp(b))`, stable for large magnitudes.
#[inline]
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    if m == f64::NEG_INFINITY {
        return m;
    }
    m + ((a - m).exp() + (b - m).exp()).ln()
}

#[inline]
pub(crate) fn standard_normal_logpdf(z: f64) -> f64 {
    // -0.5*ln(2π)
    const LOG_INV_SQRT_2PI: f64 = -0.918_938_533_204_672_7;
    LOG_INV_SQRT_2PI - 0.5 * z * z
}

#[inline]
pub(crate) fn standard_normal_pdf(z: f64) -> f64 {
    standard_normal_logpdf(z).exp()
}

#[inline]
pub(crate) fn standard_normal_cdf(z: f64) -> f64 {
    0.5 * statrs::function::erf::erfc(-z / SQRT_2)
}

/// Upper-tail probability of a χ² with `ndf` degrees of freedom.
///
/// Returns 0 for `ndf == 0` or a non-finite χ².
pub fn chi2_probability(chi2: f64, ndf: usize) -> f64 {
    if ndf == 0 || !chi2.is_finite() {
        return 0.0;
    }
    match ChiSquared::new(ndf as f64) {
        Ok(d) => d.sf(chi2.max(0.0)),
        Err(_) => 0.0,
    }
}

/// Uniform draw in the open interval (0, 1).
#[inline]
pub(crate) fn u01(rng: &mut dyn rand::RngCore) -> f64 {
    let v = rng.next_u64();
    (v as f64 + 0.5) * (1.0 / 18446744073709551616.0_f64)
}
