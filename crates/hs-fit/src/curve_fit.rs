//! Least-squares fits of a parametric curve to histogram bin contents.
//!
//! The χ² is minimised with the same bounded estimator as the likelihood
//! fits, using `χ²/2` as the objective so that the inverse Hessian is the
//! parameter covariance. Bins with non-positive error are skipped.

use std::collections::BTreeMap;
use std::fmt::Debug;

use hs_core::{Error, LogDensityModel, Result};
use hs_data::Histogram1D;
use serde::{Deserialize, Serialize};

use crate::math::chi2_probability;
use crate::mle::MaximumLikelihoodEstimator;

/// A parametric curve `y = f(x; θ)`.
pub trait CurveShape: Send + Sync + Debug {
    /// Identifier (`"gaus"`, `"expo_ct"`, ...).
    fn name(&self) -> &str;

    /// Parameter names (stable order).
    fn parameter_names(&self) -> Vec<String>;

    /// Curve value.
    fn eval(&self, x: f64, params: &[f64]) -> f64;

    /// Start values and bounds derived from the points to be fit.
    fn initial(&self, points: &[CurvePoint]) -> Vec<(f64, (f64, f64))>;
}

/// One histogram bin as seen by the fitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvePoint {
    /// Lower edge
    pub lo: f64,
    /// Upper edge
    pub hi: f64,
    /// Content
    pub y: f64,
    /// Error
    pub err: f64,
}

impl CurvePoint {
    /// Bin centre.
    pub fn x(&self) -> f64 {
        0.5 * (self.lo + self.hi)
    }
}

/// Options of a curve fit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurveFitOptions {
    /// Restrict to bins whose centre lies in `[lo, hi]`
    pub range: Option<(f64, f64)>,
    /// Parameters held at fixed values
    pub fixed: BTreeMap<String, f64>,
    /// Start values overriding the shape's guesses
    pub init: BTreeMap<String, f64>,
    /// Compare with the bin average of the curve instead of its centre value
    pub integral: bool,
}

/// Result of a curve fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveFitResult {
    /// Shape identifier
    pub shape: String,
    /// Parameter names
    pub names: Vec<String>,
    /// Best-fit values
    pub parameters: Vec<f64>,
    /// Uncertainties (0 for fixed parameters)
    pub errors: Vec<f64>,
    /// χ² at the minimum
    pub chi2: f64,
    /// Degrees of freedom
    pub ndf: usize,
    /// χ² upper-tail probability
    pub probability: f64,
    /// Minimiser convergence flag
    pub converged: bool,
    /// Fitted x range
    pub range: (f64, f64),
}

impl CurveFitResult {
    /// Value of the named parameter.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.names.iter().position(|n| n == name).map(|i| self.parameters[i])
    }

    /// Uncertainty of the named parameter.
    pub fn error(&self, name: &str) -> Option<f64> {
        self.names.iter().position(|n| n == name).map(|i| self.errors[i])
    }
}

/// Mean of `f` over `[lo, hi]` by composite Simpson.
fn bin_average(f: impl Fn(f64) -> f64, lo: f64, hi: f64) -> f64 {
    const N: usize = 8;
    let h = (hi - lo) / N as f64;
    let mut acc = f(lo) + f(hi);
    for k in 1..N {
        let w = if k % 2 == 1 { 4.0 } else { 2.0 };
        acc += w * f(lo + h * k as f64);
    }
    acc * h / 3.0 / (hi - lo)
}

struct ChiSquare<'a> {
    shape: &'a dyn CurveShape,
    points: &'a [CurvePoint],
    names: Vec<String>,
    init: Vec<f64>,
    bounds: Vec<(f64, f64)>,
    integral: bool,
}

impl ChiSquare<'_> {
    fn predict(&self, p: &CurvePoint, params: &[f64]) -> f64 {
        if self.integral {
            bin_average(|x| self.shape.eval(x, params), p.lo, p.hi)
        } else {
            self.shape.eval(p.x(), params)
        }
    }

    fn chi2(&self, params: &[f64]) -> f64 {
        self.points.iter().map(|p| ((p.y - self.predict(p, params)) / p.err).powi(2)).sum()
    }
}

impl LogDensityModel for ChiSquare<'_> {
    fn dim(&self) -> usize {
        self.names.len()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        self.bounds.clone()
    }

    fn parameter_init(&self) -> Vec<f64> {
        self.init.clone()
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        let v = 0.5 * self.chi2(params);
        if v.is_nan() {
            return Err(Error::Computation(format!(
                "{} curve is not finite at {params:?}",
                self.shape.name()
            )));
        }
        Ok(v)
    }

    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; params.len()];
        let mut work = params.to_vec();
        for (i, (lo, hi)) in self.bounds.iter().copied().enumerate() {
            if hi <= lo {
                continue;
            }
            let eps = 1e-6 * params[i].abs().max((hi - lo) * 1e-3);
            let up = (params[i] + eps).min(hi);
            let dn = (params[i] - eps).max(lo);
            work[i] = up;
            let f_up = self.nll(&work)?;
            work[i] = dn;
            let f_dn = self.nll(&work)?;
            work[i] = params[i];
            grad[i] = (f_up - f_dn) / (up - dn);
        }
        Ok(grad)
    }
}

/// Fit `shape` to the bins of `hist`.
pub fn fit_histogram(
    hist: &Histogram1D,
    shape: &dyn CurveShape,
    options: &CurveFitOptions,
) -> Result<CurveFitResult> {
    let (lo, hi) = options.range.unwrap_or((hist.x_min(), hist.x_max()));
    let points: Vec<CurvePoint> = (0..hist.n_bins())
        .map(|i| CurvePoint {
            lo: hist.bin_low_edge(i),
            hi: hist.bin_low_edge(i) + hist.bin_width(i),
            y: hist.content(i),
            err: hist.error(i),
        })
        .filter(|p| p.x() >= lo && p.x() <= hi && p.err > 0.0 && p.y.is_finite())
        .collect();
    if points.is_empty() {
        return Err(Error::EmptySample(format!(
            "no bins with positive error in [{lo}, {hi}] of '{}'",
            hist.name
        )));
    }

    let names = shape.parameter_names();
    for key in options.fixed.keys().chain(options.init.keys()) {
        if !names.contains(key) {
            return Err(Error::Config(format!(
                "'{key}' is not a parameter of {} (expected one of {names:?})",
                shape.name()
            )));
        }
    }

    let guesses = shape.initial(&points);
    let mut init = Vec::with_capacity(names.len());
    let mut bounds = Vec::with_capacity(names.len());
    for (name, (guess, b)) in names.iter().zip(guesses) {
        if let Some(&v) = options.fixed.get(name) {
            init.push(v);
            bounds.push((v, v));
        } else {
            init.push(options.init.get(name).copied().unwrap_or(guess).clamp(b.0, b.1));
            bounds.push(b);
        }
    }

    let model = ChiSquare { shape, points: &points, names, init, bounds, integral: options.integral };
    let n_free = model.free_parameters().len();
    let fit = MaximumLikelihoodEstimator::new().fit(&model)?;
    let chi2 = model.chi2(&fit.parameters);
    let ndf = points.len().saturating_sub(n_free);
    log::debug!("{} fit: chi2/ndf = {chi2:.2}/{ndf}", shape.name());

    Ok(CurveFitResult {
        shape: shape.name().to_string(),
        names: fit.names,
        parameters: fit.parameters,
        errors: fit.uncertainties,
        chi2,
        ndf,
        probability: chi2_probability(chi2, ndf),
        converged: fit.converged,
        range: (lo, hi),
    })
}

/// Gaussian curve `A · exp(-(x-μ)²/(2σ²))`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianCurve;

impl CurveShape for GaussianCurve {
    fn name(&self) -> &str {
        "gaus"
    }

    fn parameter_names(&self) -> Vec<String> {
        vec!["constant".into(), "mean".into(), "sigma".into()]
    }

    fn eval(&self, x: f64, p: &[f64]) -> f64 {
        p[0] * (-0.5 * ((x - p[1]) / p[2]).powi(2)).exp()
    }

    fn initial(&self, points: &[CurvePoint]) -> Vec<(f64, (f64, f64))> {
        let lo = points.first().map_or(0.0, |p| p.lo);
        let hi = points.last().map_or(1.0, |p| p.hi);
        let sum: f64 = points.iter().map(|p| p.y.max(0.0)).sum();
        let peak = points.iter().map(|p| p.y).fold(0.0_f64, f64::max);
        let (mean, sd) = if sum > 0.0 {
            let m = points.iter().map(|p| p.y.max(0.0) * p.x()).sum::<f64>() / sum;
            let v = points.iter().map(|p| p.y.max(0.0) * (p.x() - m).powi(2)).sum::<f64>() / sum;
            (m, v.sqrt())
        } else {
            (0.5 * (lo + hi), 0.25 * (hi - lo))
        };
        let min_width = points.iter().map(|p| p.hi - p.lo).fold(f64::INFINITY, f64::min) * 0.1;
        vec![
            (peak, (0.0, 10.0 * peak.max(1e-300))),
            (mean, (lo, hi)),
            (sd.max(min_width), (min_width, hi - lo)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gaussian_hist() -> Histogram1D {
        let mut h = Histogram1D::uniform("h", "", 40, -4.0, 4.0).unwrap();
        for i in 0..h.n_bins() {
            let x = h.bin_center(i);
            let y = 200.0 * (-0.5 * ((x - 0.3) / 0.9_f64).powi(2)).exp();
            h.set_bin(i, y, y.sqrt().max(1.0));
        }
        h
    }

    #[test]
    fn gaussian_fit_recovers_exact_curve() {
        let r = fit_histogram(&gaussian_hist(), &GaussianCurve, &CurveFitOptions::default()).unwrap();
        assert_relative_eq!(r.value("constant").unwrap(), 200.0, max_relative = 1e-3);
        assert_relative_eq!(r.value("mean").unwrap(), 0.3, epsilon = 1e-3);
        assert_relative_eq!(r.value("sigma").unwrap(), 0.9, max_relative = 1e-3);
        assert!(r.chi2 < 1e-3);
        assert_eq!(r.ndf, 37);
    }

    #[test]
    fn fixed_parameter_stays_and_range_restricts_bins() {
        let options = CurveFitOptions {
            range: Some((-1.0, 1.0)),
            fixed: [("sigma".to_string(), 0.9)].into_iter().collect(),
            ..Default::default()
        };
        let r = fit_histogram(&gaussian_hist(), &GaussianCurve, &options).unwrap();
        assert_eq!(r.value("sigma"), Some(0.9));
        assert_eq!(r.error("sigma"), Some(0.0));
        // Centres -0.9 .. 0.9 in steps of 0.2.
        assert_eq!(r.ndf, 10 - 2);
    }

    #[test]
    fn unknown_fixed_parameter_is_config_error() {
        let options = CurveFitOptions {
            fixed: [("tau".to_string(), 1.0)].into_iter().collect(),
            ..Default::default()
        };
        assert!(matches!(
            fit_histogram(&gaussian_hist(), &GaussianCurve, &options),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn empty_histogram_is_rejected() {
        let h = Histogram1D::uniform("h", "", 5, 0.0, 1.0).unwrap();
        assert!(matches!(
            fit_histogram(&h, &GaussianCurve, &CurveFitOptions::default()),
            Err(Error::EmptySample(_))
        ));
    }

    #[test]
    fn bin_average_of_linear_is_centre_value() {
        assert_relative_eq!(bin_average(|x| 2.0 * x + 1.0, 1.0, 3.0), 5.0, epsilon = 1e-12);
    }
}
