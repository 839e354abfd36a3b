use hs_core::{Error, Result};
use statrs::distribution::{ContinuousCDF, Normal};

use super::{UnbinnedPdf, check_out_len, check_params, check_support, clip_range};
use crate::math::{standard_normal_cdf, standard_normal_logpdf, standard_normal_pdf, u01};

/// Truncated Gaussian `N(μ, σ)` normalised on the support.
///
/// Parameters: `mu`, `sigma`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianPdf;

impl GaussianPdf {
    fn unpack(params: &[f64]) -> Result<(f64, f64)> {
        check_params("GaussianPdf", params, 2)?;
        let (mu, sigma) = (params[0], params[1]);
        if sigma <= 0.0 {
            return Err(Error::Validation(format!("GaussianPdf sigma must be > 0, got {sigma}")));
        }
        Ok((mu, sigma))
    }

    /// `Φ(z_b) - Φ(z_a)`, floored to keep the cost finite under extreme truncation.
    fn norm(z_a: f64, z_b: f64) -> f64 {
        let z = standard_normal_cdf(z_b) - standard_normal_cdf(z_a);
        if z.is_finite() && z > 0.0 { z } else { f64::MIN_POSITIVE }
    }
}

impl UnbinnedPdf for GaussianPdf {
    fn name(&self) -> &'static str {
        "gaus"
    }

    fn parameter_names(&self) -> Vec<String> {
        vec!["mu".into(), "sigma".into()]
    }

    fn log_prob_batch(
        &self,
        xs: &[f64],
        support: (f64, f64),
        params: &[f64],
        out: &mut [f64],
    ) -> Result<()> {
        let (mu, sigma) = Self::unpack(params)?;
        check_support("GaussianPdf", support)?;
        check_out_len("GaussianPdf", "out", out.len(), xs.len())?;

        let inv_sigma = 1.0 / sigma;
        let log_z = Self::norm((support.0 - mu) * inv_sigma, (support.1 - mu) * inv_sigma).ln();
        let log_sigma = sigma.ln();
        for (o, &x) in out.iter_mut().zip(xs) {
            *o = standard_normal_logpdf((x - mu) * inv_sigma) - log_sigma - log_z;
        }
        Ok(())
    }

    fn log_prob_grad_batch(
        &self,
        xs: &[f64],
        support: (f64, f64),
        params: &[f64],
        out_logp: &mut [f64],
        out_grad: &mut [f64],
    ) -> Result<()> {
        let (mu, sigma) = Self::unpack(params)?;
        check_support("GaussianPdf", support)?;
        check_out_len("GaussianPdf", "out_logp", out_logp.len(), xs.len())?;
        check_out_len("GaussianPdf", "out_grad", out_grad.len(), xs.len() * 2)?;

        let inv_sigma = 1.0 / sigma;
        let z_a = (support.0 - mu) * inv_sigma;
        let z_b = (support.1 - mu) * inv_sigma;
        let z = Self::norm(z_a, z_b);
        let log_z = z.ln();

        // Derivatives of logZ.
        let phi_a = standard_normal_pdf(z_a);
        let phi_b = standard_normal_pdf(z_b);
        let dlogz_dmu = (phi_a - phi_b) * inv_sigma / z;
        let dlogz_dsigma = (z_a * phi_a - z_b * phi_b) * inv_sigma / z;
        let log_sigma = sigma.ln();

        for (i, &x) in xs.iter().enumerate() {
            let z_x = (x - mu) * inv_sigma;
            out_logp[i] = standard_normal_logpdf(z_x) - log_sigma - log_z;
            out_grad[2 * i] = z_x * inv_sigma - dlogz_dmu;
            out_grad[2 * i + 1] = (z_x * z_x - 1.0) * inv_sigma - dlogz_dsigma;
        }
        Ok(())
    }

    fn integral_fraction(
        &self,
        params: &[f64],
        support: (f64, f64),
        range: (f64, f64),
    ) -> Result<f64> {
        let (mu, sigma) = Self::unpack(params)?;
        check_support("GaussianPdf", support)?;
        let Some((lo, hi)) = clip_range(support, range) else {
            return Ok(0.0);
        };
        let z = Self::norm((support.0 - mu) / sigma, (support.1 - mu) / sigma);
        let part = standard_normal_cdf((hi - mu) / sigma) - standard_normal_cdf((lo - mu) / sigma);
        Ok((part / z).clamp(0.0, 1.0))
    }

    fn sample(
        &self,
        params: &[f64],
        n: usize,
        support: (f64, f64),
        rng: &mut dyn rand::RngCore,
    ) -> Result<Vec<f64>> {
        let (mu, sigma) = Self::unpack(params)?;
        check_support("GaussianPdf", support)?;
        let (a, b) = support;

        let stdn = Normal::new(0.0, 1.0).map_err(|e| {
            Error::Computation(format!("failed to construct standard normal distribution: {e}"))
        })?;
        // Avoid inverse_cdf(0/1) infinities.
        let eps = 1e-15;
        let u_lo = stdn.cdf((a - mu) / sigma).clamp(eps, 1.0 - eps);
        let u_hi = stdn.cdf((b - mu) / sigma).clamp(eps, 1.0 - eps);
        if u_lo >= u_hi {
            return Err(Error::Validation(format!(
                "GaussianPdf sample has degenerate truncated CDF range: [{u_lo}, {u_hi}]"
            )));
        }

        Ok((0..n)
            .map(|_| {
                let u = u_lo + (u_hi - u_lo) * u01(rng);
                (mu + sigma * stdn.inverse_cdf(u)).clamp(a, b)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::test_util::{check_gradient, integrate_density};
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    const WINDOW: (f64, f64) = (2.96, 3.04);

    #[test]
    fn normalised_on_window() {
        let p = [2.991, 0.0025];
        assert_relative_eq!(integrate_density(&GaussianPdf, WINDOW, &p), 1.0, epsilon = 1e-6);
        // Strongly truncated: peak near the edge.
        let p = [2.962, 0.01];
        assert_relative_eq!(integrate_density(&GaussianPdf, WINDOW, &p), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let xs = [2.97, 2.985, 2.991, 2.994, 3.03];
        check_gradient(&GaussianPdf, &xs, WINDOW, &[2.99, 0.004]);
    }

    #[test]
    fn three_sigma_fraction() {
        let p = [2.991, 0.0025];
        let f = GaussianPdf
            .integral_fraction(&p, WINDOW, (2.991 - 3.0 * 0.0025, 2.991 + 3.0 * 0.0025))
            .unwrap();
        assert_relative_eq!(f, 0.997_300_2, epsilon = 1e-6);
        assert_eq!(GaussianPdf.integral_fraction(&p, WINDOW, (3.1, 3.2)).unwrap(), 0.0);
    }

    #[test]
    fn sample_stays_in_support() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let xs = GaussianPdf.sample(&[2.991, 0.0025], 5000, WINDOW, &mut rng).unwrap();
        assert!(xs.iter().all(|&x| (WINDOW.0..=WINDOW.1).contains(&x)));
        let mean = xs.iter().sum::<f64>() / xs.len() as f64;
        assert_relative_eq!(mean, 2.991, epsilon = 2e-4);
    }

    #[test]
    fn rejects_bad_sigma() {
        let mut out = [0.0];
        assert!(GaussianPdf.log_prob_batch(&[3.0], WINDOW, &[3.0, 0.0], &mut out).is_err());
        assert!(GaussianPdf.log_prob_batch(&[3.0], (3.0, 2.0), &[3.0, 0.1], &mut out).is_err());
    }
}
