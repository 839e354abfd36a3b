use hs_core::{Error, Result};

use super::{UnbinnedPdf, check_out_len, check_params, check_support, clip_range};
use crate::math::{standard_normal_cdf, u01};

/// Double-sided Crystal Ball: Gaussian core with independent power-law tails.
///
/// Parameters:
/// - `mu`, `sigma`
/// - `alpha_l`, `n_l` for the left tail (must be `> 0`, `> 1`)
/// - `alpha_r`, `n_r` for the right tail (must be `> 0`, `> 1`)
#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleCrystalBallPdf;

#[derive(Debug, Clone, Copy)]
struct CbTail {
    alpha: f64,
    n: f64,
    log_a: f64,
    b: f64,
}

impl CbTail {
    fn new(alpha: f64, n: f64) -> Result<Self> {
        if !alpha.is_finite() || alpha <= 0.0 {
            return Err(Error::Validation(format!(
                "CrystalBall alpha must be finite and > 0, got {alpha}"
            )));
        }
        if !n.is_finite() || n <= 1.0 {
            return Err(Error::Validation(format!(
                "CrystalBall n must be finite and > 1, got {n}"
            )));
        }
        let log_a = n * (n / alpha).ln() - 0.5 * alpha * alpha;
        let b = n / alpha - alpha;
        Ok(Self { alpha, n, log_a, b })
    }

    /// Tail shape at distance `s >= alpha` from the core, in units of sigma.
    #[inline]
    fn logf(&self, s: f64) -> f64 {
        self.log_a - self.n * (self.b + s).ln()
    }

    #[inline]
    fn dlogf_ds(&self, s: f64) -> f64 {
        -self.n / (self.b + s)
    }

    #[inline]
    fn dlogf_dalpha(&self, s: f64) -> f64 {
        let (alpha, n) = (self.alpha, self.n);
        let dln_a = -(n / alpha + alpha);
        let db = -(n / (alpha * alpha) + 1.0);
        dln_a - n * db / (self.b + s)
    }

    #[inline]
    fn dlogf_dn(&self, s: f64) -> f64 {
        let (alpha, n) = (self.alpha, self.n);
        let dln_a = 1.0 + (n / alpha).ln();
        let db = 1.0 / alpha;
        dln_a - (self.b + s).ln() - n * db / (self.b + s)
    }

    /// `∫ f(s) ds` over `[s1, s2]` with `alpha <= s1 <= s2`, plus d/dalpha and d/dn.
    fn integral_and_derivatives(&self, s1: f64, s2: f64) -> Result<(f64, f64, f64)> {
        let (alpha, n) = (self.alpha, self.n);
        let m = n - 1.0;
        let a = self.log_a.exp();

        let b1 = self.b + s1;
        let b2 = self.b + s2;
        let u1 = b1.powf(-m);
        let u2 = b2.powf(-m);
        let i = a / m * (u1 - u2);
        if !i.is_finite() || i < 0.0 {
            return Err(Error::Validation(format!(
                "CrystalBall tail integral is not finite/non-negative: {i}"
            )));
        }

        let dln_a_dalpha = -(n / alpha + alpha);
        let dln_a_dn = 1.0 + (n / alpha).ln();
        let db_dalpha = -(n / (alpha * alpha) + 1.0);
        let db_dn = 1.0 / alpha;

        let v1 = b1.powf(-n);
        let v2 = b2.powf(-n);
        let di_dalpha = i * dln_a_dalpha - a * db_dalpha * (v1 - v2);

        let du1_dn = u1 * (-b1.ln() - m * db_dn / b1);
        let du2_dn = u2 * (-b2.ln() - m * db_dn / b2);
        let di_dn = i * dln_a_dn - i / m + (a / m) * (du1_dn - du2_dn);

        Ok((i, di_dalpha, di_dn))
    }
}

#[inline]
fn gauss_integral(t1: f64, t2: f64) -> f64 {
    let sqrt_2pi = (2.0 * std::f64::consts::PI).sqrt();
    sqrt_2pi * (standard_normal_cdf(t2) - standard_normal_cdf(t1))
}

/// Unnormalised DSCB in the standardised variable `t = (x - mu) / sigma`.
#[derive(Debug, Clone, Copy)]
struct Shape {
    left: CbTail,
    right: CbTail,
}

/// `∫ f dt` over a range and its derivatives w.r.t. (alpha_l, n_l, alpha_r, n_r).
#[derive(Debug, Clone, Copy, Default)]
struct SegmentIntegral {
    value: f64,
    d_alpha_l: f64,
    d_n_l: f64,
    d_alpha_r: f64,
    d_n_r: f64,
}

impl Shape {
    fn new(params: &[f64]) -> Result<(f64, f64, Self)> {
        check_params("DoubleCrystalBallPdf", params, 6)?;
        let (mu, sigma) = (params[0], params[1]);
        if sigma <= 0.0 {
            return Err(Error::Validation(format!(
                "DoubleCrystalBallPdf sigma must be > 0, got {sigma}"
            )));
        }
        let left = CbTail::new(params[2], params[3])?;
        let right = CbTail::new(params[4], params[5])?;
        Ok((mu, sigma, Self { left, right }))
    }

    #[inline]
    fn logf(&self, t: f64) -> f64 {
        if t < -self.left.alpha {
            self.left.logf(-t)
        } else if t > self.right.alpha {
            self.right.logf(t)
        } else {
            -0.5 * t * t
        }
    }

    /// Integral over `[t1, t2]`, split into left tail, core and right tail.
    fn integral(&self, t1: f64, t2: f64) -> Result<SegmentIntegral> {
        let mut out = SegmentIntegral::default();
        if t2 <= t1 {
            return Ok(out);
        }
        let t_l = -self.left.alpha;
        let t_r = self.right.alpha;

        if t1 < t_l {
            // Left tail mirrored to s = -t in [max(-t2, alpha_l), -t1].
            let s_lo = (-t2).max(self.left.alpha);
            let (i, da, dn) = self.left.integral_and_derivatives(s_lo, -t1)?;
            out.value += i;
            out.d_alpha_l += da;
            out.d_n_l += dn;
        }
        let core_lo = t1.max(t_l);
        let core_hi = t2.min(t_r);
        if core_hi > core_lo {
            out.value += gauss_integral(core_lo, core_hi);
        }
        if t2 > t_r {
            let s_lo = t1.max(t_r);
            let (i, da, dn) = self.right.integral_and_derivatives(s_lo, t2)?;
            out.value += i;
            out.d_alpha_r += da;
            out.d_n_r += dn;
        }
        Ok(out)
    }

    fn normalization(&self, t_a: f64, t_b: f64) -> Result<SegmentIntegral> {
        let norm = self.integral(t_a, t_b)?;
        if !norm.value.is_finite() || norm.value <= 0.0 {
            return Err(Error::Validation(format!(
                "DoubleCrystalBallPdf normalization integral is not finite/positive: {}",
                norm.value
            )));
        }
        Ok(norm)
    }
}

impl UnbinnedPdf for DoubleCrystalBallPdf {
    fn name(&self) -> &'static str {
        "dscb"
    }

    fn parameter_names(&self) -> Vec<String> {
        ["mu", "sigma", "alpha_l", "n_l", "alpha_r", "n_r"].iter().map(|s| s.to_string()).collect()
    }

    fn log_prob_batch(
        &self,
        xs: &[f64],
        support: (f64, f64),
        params: &[f64],
        out: &mut [f64],
    ) -> Result<()> {
        let (mu, sigma, shape) = Shape::new(params)?;
        check_support("DoubleCrystalBallPdf", support)?;
        check_out_len("DoubleCrystalBallPdf", "out", out.len(), xs.len())?;

        let inv_sigma = 1.0 / sigma;
        let norm = shape.normalization((support.0 - mu) * inv_sigma, (support.1 - mu) * inv_sigma)?;
        let offset = sigma.ln() + norm.value.ln();
        for (o, &x) in out.iter_mut().zip(xs) {
            *o = shape.logf((x - mu) * inv_sigma) - offset;
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
        let (mu, sigma, shape) = Shape::new(params)?;
        check_support("DoubleCrystalBallPdf", support)?;
        check_out_len("DoubleCrystalBallPdf", "out_logp", out_logp.len(), xs.len())?;
        check_out_len("DoubleCrystalBallPdf", "out_grad", out_grad.len(), xs.len() * 6)?;

        let inv_sigma = 1.0 / sigma;
        let t_a = (support.0 - mu) * inv_sigma;
        let t_b = (support.1 - mu) * inv_sigma;
        let norm = shape.normalization(t_a, t_b)?;
        let i = norm.value;
        let offset = sigma.ln() + i.ln();

        let dlogi_dalpha_l = norm.d_alpha_l / i;
        let dlogi_dn_l = norm.d_n_l / i;
        let dlogi_dalpha_r = norm.d_alpha_r / i;
        let dlogi_dn_r = norm.d_n_r / i;

        // Support edges move in t when mu or sigma change.
        let f_a = shape.logf(t_a).exp();
        let f_b = shape.logf(t_b).exp();
        let dlogi_dmu = (f_a - f_b) * inv_sigma / i;
        let dlogi_dsigma = (f_a * t_a - f_b * t_b) * inv_sigma / i;

        let (left, right) = (shape.left, shape.right);
        for (k, &x) in xs.iter().enumerate() {
            let t = (x - mu) * inv_sigma;
            let (logf, dlogf_dt, da_l, dn_l, da_r, dn_r) = if t < -left.alpha {
                let s = -t;
                (
                    left.logf(s),
                    -left.dlogf_ds(s),
                    left.dlogf_dalpha(s),
                    left.dlogf_dn(s),
                    0.0,
                    0.0,
                )
            } else if t > right.alpha {
                (
                    right.logf(t),
                    right.dlogf_ds(t),
                    0.0,
                    0.0,
                    right.dlogf_dalpha(t),
                    right.dlogf_dn(t),
                )
            } else {
                (-0.5 * t * t, -t, 0.0, 0.0, 0.0, 0.0)
            };

            out_logp[k] = logf - offset;

            let g = &mut out_grad[k * 6..k * 6 + 6];
            g[0] = -inv_sigma * dlogf_dt - dlogi_dmu;
            g[1] = -t * inv_sigma * dlogf_dt - inv_sigma - dlogi_dsigma;
            g[2] = da_l - dlogi_dalpha_l;
            g[3] = dn_l - dlogi_dn_l;
            g[4] = da_r - dlogi_dalpha_r;
            g[5] = dn_r - dlogi_dn_r;
        }
        Ok(())
    }

    fn integral_fraction(
        &self,
        params: &[f64],
        support: (f64, f64),
        range: (f64, f64),
    ) -> Result<f64> {
        let (mu, sigma, shape) = Shape::new(params)?;
        check_support("DoubleCrystalBallPdf", support)?;
        let Some((lo, hi)) = clip_range(support, range) else {
            return Ok(0.0);
        };
        let t = |x: f64| (x - mu) / sigma;
        let norm = shape.normalization(t(support.0), t(support.1))?;
        let part = shape.integral(t(lo), t(hi))?;
        Ok((part.value / norm.value).clamp(0.0, 1.0))
    }

    fn sample(
        &self,
        params: &[f64],
        n: usize,
        support: (f64, f64),
        rng: &mut dyn rand::RngCore,
    ) -> Result<Vec<f64>> {
        let (mu, sigma, shape) = Shape::new(params)?;
        check_support("DoubleCrystalBallPdf", support)?;
        let (a, b) = support;
        let t_a = (a - mu) / sigma;
        let t_b = (b - mu) / sigma;

        // Rejection sampling from uniform on [t_a, t_b] with envelope 1.0.
        let mut xs = Vec::with_capacity(n);
        for _ in 0..n {
            let mut tries = 0usize;
            loop {
                let t = t_a + (t_b - t_a) * u01(rng);
                if u01(rng) <= shape.logf(t).exp() {
                    xs.push((mu + sigma * t).clamp(a, b));
                    break;
                }
                tries += 1;
                if tries > 100_000 {
                    return Err(Error::Computation(
                        "DoubleCrystalBallPdf sample rejection loop exceeded max iterations".into(),
                    ));
                }
            }
        }
        Ok(xs)
    }
}
