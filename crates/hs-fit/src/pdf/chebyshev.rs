use hs_core::{Error, Result};

use super::{UnbinnedPdf, check_out_len, check_params, check_support, clip_range};
use crate::math::u01;

/// Smallest unnormalised density used when a coefficient set dips below zero.
const F_FLOOR: f64 = 1e-12;

/// Chebyshev polynomial background, normalised on the support.
///
/// `f(x) = 1 + Σ_{k=1..m} c_k T_k(x')` with `x' = (2x - (a+b)) / (b-a)`.
/// Coefficient sets that make `f` negative somewhere are floored at a tiny
/// positive value during evaluation so the minimiser can step back out.
#[derive(Debug, Clone, Copy)]
pub struct ChebyshevPdf {
    order: usize,
}

impl ChebyshevPdf {
    /// Chebyshev background of the given order (`pol1` = 1, `pol2` = 2).
    pub fn new(order: usize) -> Result<Self> {
        if order == 0 {
            return Err(Error::Validation(
                "ChebyshevPdf order must be >= 1 (provide at least one coefficient)".into(),
            ));
        }
        Ok(Self { order })
    }

    /// Polynomial order.
    pub fn order(&self) -> usize {
        self.order
    }

    #[inline]
    fn xprime(x: f64, a: f64, b: f64) -> f64 {
        ((2.0 * x - (a + b)) / (b - a)).clamp(-1.0, 1.0)
    }

    /// Fill `out[k] = T_k(xp)` for `k = 0..out.len()`.
    fn fill_t(xp: f64, out: &mut [f64]) {
        if out.is_empty() {
            return;
        }
        out[0] = 1.0;
        if out.len() > 1 {
            out[1] = xp;
        }
        for k in 2..out.len() {
            out[k] = 2.0 * xp * out[k - 1] - out[k - 2];
        }
    }

    fn unnorm(params: &[f64], t: &[f64]) -> f64 {
        1.0 + params.iter().zip(&t[1..]).map(|(c, tk)| c * tk).sum::<f64>()
    }

    /// `∫ f dx'` from -1 to `xp`.
    fn antiderivative(&self, params: &[f64], xp: f64) -> f64 {
        let mut t = vec![0.0; self.order + 2];
        Self::fill_t(xp, &mut t);
        // ∫T_0 = x, ∫T_1 = x²/2, ∫T_k = T_{k+1}/(2(k+1)) - T_{k-1}/(2(k-1)) for k >= 2.
        let prim = |k: usize| -> f64 {
            match k {
                0 => xp,
                1 => 0.5 * xp * xp,
                _ => t[k + 1] / (2.0 * (k + 1) as f64) - t[k - 1] / (2.0 * (k - 1) as f64),
            }
        };
        let prim_lo = |k: usize| -> f64 {
            // Same primitive evaluated at x' = -1, where T_k(-1) = (-1)^k.
            let sign = |j: usize| if j % 2 == 0 { 1.0 } else { -1.0 };
            match k {
                0 => -1.0,
                1 => 0.5,
                _ => sign(k + 1) / (2.0 * (k + 1) as f64) - sign(k - 1) / (2.0 * (k - 1) as f64),
            }
        };
        let mut acc = prim(0) - prim_lo(0);
        for (idx, &c) in params.iter().enumerate() {
            let k = idx + 1;
            acc += c * (prim(k) - prim_lo(k));
        }
        acc
    }

    /// Normalisation `I = ∫_a^b f dx` and `d log I / d c_k`.
    fn normalization(&self, params: &[f64], a: f64, b: f64) -> Result<(f64, Vec<f64>)> {
        let w = b - a;
        // I = w + w * Σ_{k even} c_k / (1-k^2)
        let mut i = w;
        let mut di = vec![0.0; self.order];
        for (idx, &c) in params.iter().enumerate() {
            let k = idx + 1;
            if k % 2 == 0 {
                let denom = 1.0 - (k as f64) * (k as f64);
                i += w * c / denom;
                di[idx] = w / denom;
            }
        }
        if !i.is_finite() || i <= 0.0 {
            return Err(Error::Validation(format!(
                "ChebyshevPdf normalization integral is not finite/positive: {i}"
            )));
        }
        di.iter_mut().for_each(|d| *d /= i);
        Ok((i, di))
    }

    /// Whether `f > 0` on a fixed grid across the support.
    pub fn is_positive(&self, params: &[f64]) -> bool {
        let n_grid = 128usize;
        let mut t = vec![0.0; self.order + 1];
        (0..=n_grid).all(|i| {
            let xp = -1.0 + 2.0 * (i as f64) / (n_grid as f64);
            Self::fill_t(xp, &mut t);
            Self::unnorm(params, &t) > 0.0
        })
    }
}

impl UnbinnedPdf for ChebyshevPdf {
    fn name(&self) -> &'static str {
        match self.order {
            1 => "pol1",
            2 => "pol2",
            _ => "chebyshev",
        }
    }

    fn parameter_names(&self) -> Vec<String> {
        (1..=self.order).map(|k| format!("c{k}")).collect()
    }

    fn n_params(&self) -> usize {
        self.order
    }

    fn log_prob_batch(
        &self,
        xs: &[f64],
        support: (f64, f64),
        params: &[f64],
        out: &mut [f64],
    ) -> Result<()> {
        check_params("ChebyshevPdf", params, self.order)?;
        check_support("ChebyshevPdf", support)?;
        check_out_len("ChebyshevPdf", "out", out.len(), xs.len())?;
        let (a, b) = support;
        let (i, _) = self.normalization(params, a, b)?;
        let log_i = i.ln();
        let mut t = vec![0.0; self.order + 1];
        for (o, &x) in out.iter_mut().zip(xs) {
            Self::fill_t(Self::xprime(x, a, b), &mut t);
            *o = Self::unnorm(params, &t).max(F_FLOOR).ln() - log_i;
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
        check_params("ChebyshevPdf", params, self.order)?;
        check_support("ChebyshevPdf", support)?;
        check_out_len("ChebyshevPdf", "out_logp", out_logp.len(), xs.len())?;
        check_out_len("ChebyshevPdf", "out_grad", out_grad.len(), xs.len() * self.order)?;
        let (a, b) = support;
        let (i, dlogi) = self.normalization(params, a, b)?;
        let log_i = i.ln();
        let m = self.order;
        let mut t = vec![0.0; m + 1];
        for (e, &x) in xs.iter().enumerate() {
            Self::fill_t(Self::xprime(x, a, b), &mut t);
            let f = Self::unnorm(params, &t);
            let floored = f <= F_FLOOR;
            out_logp[e] = f.max(F_FLOOR).ln() - log_i;
            for j in 0..m {
                let dlogf = if floored { 0.0 } else { t[j + 1] / f };
                out_grad[e * m + j] = dlogf - dlogi[j];
            }
        }
        Ok(())
    }

    fn integral_fraction(
        &self,
        params: &[f64],
        support: (f64, f64),
        range: (f64, f64),
    ) -> Result<f64> {
        check_params("ChebyshevPdf", params, self.order)?;
        check_support("ChebyshevPdf", support)?;
        let Some((lo, hi)) = clip_range(support, range) else {
            return Ok(0.0);
        };
        let (a, b) = support;
        let (i, _) = self.normalization(params, a, b)?;
        let half_w = 0.5 * (b - a);
        let part = half_w
            * (self.antiderivative(params, Self::xprime(hi, a, b))
                - self.antiderivative(params, Self::xprime(lo, a, b)));
        Ok((part / i).clamp(0.0, 1.0))
    }

    fn sample(
        &self,
        params: &[f64],
        n: usize,
        support: (f64, f64),
        rng: &mut dyn rand::RngCore,
    ) -> Result<Vec<f64>> {
        check_params("ChebyshevPdf", params, self.order)?;
        check_support("ChebyshevPdf", support)?;
        if !self.is_positive(params) {
            return Err(Error::Validation(format!(
                "ChebyshevPdf is non-positive on the support for params {params:?}"
            )));
        }
        let (a, b) = support;
        // |T_k| <= 1 on [-1, 1].
        let envelope = 1.0 + params.iter().map(|c| c.abs()).sum::<f64>();
        let mut t = vec![0.0; self.order + 1];
        let mut xs = Vec::with_capacity(n);
        while xs.len() < n {
            let xp = -1.0 + 2.0 * u01(rng);
            Self::fill_t(xp, &mut t);
            if u01(rng) * envelope <= Self::unnorm(params, &t) {
                xs.push(a + 0.5 * (xp + 1.0) * (b - a));
            }
        }
        Ok(xs)
    }
}
