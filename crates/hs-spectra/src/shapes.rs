//! Physics shapes for corrected spectra.
//!
//! All shapes implement [`CurveShape`] so they can be fitted with
//! [`hs_fit::fit_histogram`] and used as reweighting references. The pT
//! shapes are normalised so that their integral over `[0, ∞)` is `dN/dy`.

use std::fmt;
use std::str::FromStr;

use hs_core::{Error, Result};
use hs_fit::{CurvePoint, CurveShape, GaussianCurve};
use serde::{Deserialize, Serialize};

/// Speed of light in cm/ps.
pub const SPEED_OF_LIGHT: f64 = 0.029979245800;

/// ³ΛH mass in GeV/c², the default mass of the pT shapes.
pub const HYPERTRITON_MASS: f64 = 2.99131;

fn integral_of(points: &[CurvePoint]) -> f64 {
    points.iter().map(|p| p.y.max(0.0) * (p.hi - p.lo)).sum()
}

fn norm_guess(points: &[CurvePoint], scale: f64) -> (f64, (f64, f64)) {
    let guess = (integral_of(points) * scale).max(1e-300);
    (guess, (0.0, 1e3 * guess))
}

/// Exponential decay in ct, normalised to `norm` over `[ct_min, ct_max]`:
///
/// `norm · exp(-x/(τc)) / ((exp(-ct_min/(τc)) - exp(-ct_max/(τc))) · τc)`
///
/// with τ in ps and ct in cm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpoCt {
    /// Allowed lifetime range in ps
    pub tau_range: (f64, f64),
}

impl Default for ExpoCt {
    fn default() -> Self {
        Self { tau_range: (230.0, 500.0) }
    }
}

impl CurveShape for ExpoCt {
    fn name(&self) -> &str {
        "expo_ct"
    }

    fn parameter_names(&self) -> Vec<String> {
        vec!["norm".into(), "tau".into(), "ct_min".into(), "ct_max".into()]
    }

    fn eval(&self, x: f64, p: &[f64]) -> f64 {
        let tc = p[1] * SPEED_OF_LIGHT;
        let den = ((-p[2] / tc).exp() - (-p[3] / tc).exp()) * tc;
        p[0] * (-x / tc).exp() / den
    }

    fn initial(&self, points: &[CurvePoint]) -> Vec<(f64, (f64, f64))> {
        let lo = points.first().map_or(0.0, |p| p.lo);
        let hi = points.last().map_or(1.0, |p| p.hi);
        let (t0, t1) = self.tau_range;
        vec![
            norm_guess(points, 1.0),
            ((0.5 * (t0 + t1)).clamp(t0, t1), (t0, t1)),
            (lo, (lo, lo)),
            (hi, (hi, hi)),
        ]
    }
}

/// Lévy–Tsallis pT shape:
///
/// `dN/dy · pT · (n-1)(n-2) / (nT(nT + m(n-2))) · (1 + (mT - m)/(nT))^(-n)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevyTsallis {
    /// Particle mass in GeV/c²
    pub mass: f64,
}

impl CurveShape for LevyTsallis {
    fn name(&self) -> &str {
        "levy_tsallis"
    }

    fn parameter_names(&self) -> Vec<String> {
        vec!["dNdy".into(), "n".into(), "T".into()]
    }

    fn eval(&self, pt: f64, p: &[f64]) -> f64 {
        let (dndy, n, t) = (p[0], p[1], p[2]);
        let m = self.mass;
        let mt = (m * m + pt * pt).sqrt();
        let nt = n * t;
        dndy * pt * (n - 1.0) * (n - 2.0) / (nt * (nt + m * (n - 2.0)))
            * (1.0 + (mt - m) / nt).powf(-n)
    }

    fn initial(&self, points: &[CurvePoint]) -> Vec<(f64, (f64, f64))> {
        vec![norm_guess(points, 1.5), (10.0, (2.1, 100.0)), (0.3, (0.05, 2.0))]
    }
}

/// Boltzmann pT shape `dN/dy · pT · mT · exp(-mT/T) / (T(m² + 2mT + 2T²)·exp(-m/T))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Boltzmann {
    /// Particle mass in GeV/c²
    pub mass: f64,
}

impl CurveShape for Boltzmann {
    fn name(&self) -> &str {
        "boltzmann"
    }

    fn parameter_names(&self) -> Vec<String> {
        vec!["dNdy".into(), "T".into()]
    }

    fn eval(&self, pt: f64, p: &[f64]) -> f64 {
        let (dndy, t) = (p[0], p[1]);
        let m = self.mass;
        let mt = (m * m + pt * pt).sqrt();
        let norm = t * (m * m + 2.0 * m * t + 2.0 * t * t);
        dndy * pt * mt * (-(mt - m) / t).exp() / norm
    }

    fn initial(&self, points: &[CurvePoint]) -> Vec<(f64, (f64, f64))> {
        vec![norm_guess(points, 1.5), (0.3, (0.05, 2.0))]
    }
}

/// mT-exponential pT shape `dN/dy · pT · exp(-mT/T) / (T(m + T)·exp(-m/T))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MtExponential {
    /// Particle mass in GeV/c²
    pub mass: f64,
}

impl CurveShape for MtExponential {
    fn name(&self) -> &str {
        "mt_exponential"
    }

    fn parameter_names(&self) -> Vec<String> {
        vec!["dNdy".into(), "T".into()]
    }

    fn eval(&self, pt: f64, p: &[f64]) -> f64 {
        let (dndy, t) = (p[0], p[1]);
        let m = self.mass;
        let mt = (m * m + pt * pt).sqrt();
        dndy * pt * (-(mt - m) / t).exp() / (t * (m + t))
    }

    fn initial(&self, points: &[CurvePoint]) -> Vec<(f64, (f64, f64))> {
        vec![norm_guess(points, 1.5), (0.3, (0.05, 2.0))]
    }
}

/// Shape identifier used in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectrumShape {
    /// [`ExpoCt`]
    ExpoCt,
    /// [`LevyTsallis`]
    LevyTsallis,
    /// [`Boltzmann`]
    Boltzmann,
    /// [`MtExponential`]
    MtExponential,
    /// Plain Gaussian
    Gaus,
}

impl SpectrumShape {
    /// Identifier as written in configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            SpectrumShape::ExpoCt => "expo_ct",
            SpectrumShape::LevyTsallis => "levy_tsallis",
            SpectrumShape::Boltzmann => "boltzmann",
            SpectrumShape::MtExponential => "mt_exponential",
            SpectrumShape::Gaus => "gaus",
        }
    }

    /// Curve implementation; `mass` is used by the pT shapes.
    pub fn curve(self, mass: f64) -> Box<dyn CurveShape> {
        match self {
            SpectrumShape::ExpoCt => Box::new(ExpoCt::default()),
            SpectrumShape::LevyTsallis => Box::new(LevyTsallis { mass }),
            SpectrumShape::Boltzmann => Box::new(Boltzmann { mass }),
            SpectrumShape::MtExponential => Box::new(MtExponential { mass }),
            SpectrumShape::Gaus => Box::new(GaussianCurve),
        }
    }
}

impl FromStr for SpectrumShape {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "expo_ct" | "expo" => Ok(SpectrumShape::ExpoCt),
            "levy_tsallis" | "levy" => Ok(SpectrumShape::LevyTsallis),
            "boltzmann" => Ok(SpectrumShape::Boltzmann),
            "mt_exponential" | "mt_expo" => Ok(SpectrumShape::MtExponential),
            "gaus" => Ok(SpectrumShape::Gaus),
            other => Err(Error::Config(format!(
                "unknown spectrum shape '{other}' (expected expo_ct, levy_tsallis, boltzmann, mt_exponential or gaus)"
            ))),
        }
    }
}

impl fmt::Display for SpectrumShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn trapezoid(shape: &dyn CurveShape, p: &[f64], lo: f64, hi: f64) -> f64 {
        let n = 200_000;
        let h = (hi - lo) / n as f64;
        let mut acc = 0.5 * (shape.eval(lo, p) + shape.eval(hi, p));
        for k in 1..n {
            acc += shape.eval(lo + h * k as f64, p);
        }
        acc * h
    }

    #[test]
    fn test_expo_ct_normalised_over_range() {
        let s = ExpoCt::default();
        let p = [150.0, 250.0, 1.0, 35.0];
        assert_relative_eq!(trapezoid(&s, &p, 1.0, 35.0), 150.0, max_relative = 1e-6);
    }

    #[test]
    fn test_pt_shapes_integrate_to_dndy() {
        let m = HYPERTRITON_MASS;
        let cases: Vec<(Box<dyn CurveShape>, Vec<f64>)> = vec![
            (Box::new(LevyTsallis { mass: m }), vec![2.0e-5, 12.0, 0.25]),
            (Box::new(Boltzmann { mass: m }), vec![2.0e-5, 0.35]),
            (Box::new(MtExponential { mass: m }), vec![2.0e-5, 0.35]),
        ];
        for (shape, p) in cases {
            assert_relative_eq!(trapezoid(shape.as_ref(), &p, 0.0, 40.0), 2.0e-5, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_expo_ct_initial_freezes_range() {
        let pts = [
            CurvePoint { lo: 1.0, hi: 4.0, y: 10.0, err: 1.0 },
            CurvePoint { lo: 4.0, hi: 8.0, y: 5.0, err: 1.0 },
        ];
        let init = ExpoCt::default().initial(&pts);
        assert_eq!(init[2], (1.0, (1.0, 1.0)));
        assert_eq!(init[3], (8.0, (8.0, 8.0)));
        assert_relative_eq!(init[0].0, 50.0);
    }

    #[test]
    fn test_shape_names() {
        for s in ["expo_ct", "levy_tsallis", "boltzmann", "mt_exponential", "gaus"] {
            let shape: SpectrumShape = s.parse().unwrap();
            assert_eq!(shape.to_string(), s);
            assert_eq!(shape.curve(HYPERTRITON_MASS).name(), s);
        }
        assert!(matches!("expo2".parse::<SpectrumShape>(), Err(Error::Config(_))));
    }
}
