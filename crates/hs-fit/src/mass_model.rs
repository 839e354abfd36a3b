//! Unbinned signal + background likelihood over an invariant-mass window.
//!
//! Parameter layout: signal shape parameters, then background shape
//! parameters, then the yield parameters of the [`YieldMode`].

use std::sync::Arc;

use hs_core::{Error, LogDensityModel, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::math::log_add_exp;
use crate::pdf::UnbinnedPdf;

/// Events per parallel work unit. Partial sums are combined in chunk order,
/// so the NLL does not depend on the thread count.
const CHUNK: usize = 2048;

/// Floor on the per-event mixture density.
const LOG_DENSITY_FLOOR: f64 = -690.0;

/// How signal and background yields enter the likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YieldMode {
    /// Single signal fraction `f`; counts are `f·N` and `(1-f)·N`.
    #[default]
    Fraction,
    /// Independent Poisson-extended yields `n_sig` and `n_bkg`.
    Extended,
}

impl std::str::FromStr for YieldMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fraction" => Ok(Self::Fraction),
            "extended" => Ok(Self::Extended),
            other => Err(Error::Config(format!(
                "unknown yield mode '{other}' (expected 'fraction' or 'extended')"
            ))),
        }
    }
}

/// A named fit parameter with its start value and allowed range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name
    pub name: String,
    /// Start value
    pub init: f64,
    /// `(min, max)`; equal ends freeze the parameter
    pub bounds: (f64, f64),
}

impl Parameter {
    /// New parameter.
    pub fn new(name: impl Into<String>, init: f64, bounds: (f64, f64)) -> Self {
        Self { name: name.into(), init, bounds }
    }

    /// Freeze at `value`.
    pub fn frozen(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, (value, value))
    }
}

#[derive(Clone, Copy)]
enum Weights {
    SignalOnly,
    Fraction { idx: usize },
    Extended { idx: usize },
}

/// Negative log-likelihood of a mass sample under signal (+ background).
#[derive(Clone)]
pub struct MassModel {
    window: (f64, f64),
    masses: Arc<Vec<f64>>,
    signal: Arc<dyn UnbinnedPdf>,
    background: Option<Arc<dyn UnbinnedPdf>>,
    parameters: Vec<Parameter>,
    weights: Weights,
}

impl std::fmt::Debug for MassModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MassModel")
            .field("window", &self.window)
            .field("n_events", &self.masses.len())
            .field("signal", &self.signal.name())
            .field("background", &self.background.as_ref().map(|b| b.name()))
            .field("parameters", &self.parameters)
            .finish()
    }
}

impl MassModel {
    /// Signal-only likelihood (MC shape pre-fit). Masses outside the window are dropped.
    pub fn signal_only(
        signal: Arc<dyn UnbinnedPdf>,
        window: (f64, f64),
        masses: &[f64],
        signal_params: Vec<Parameter>,
    ) -> Result<Self> {
        Self::build(signal, None, window, masses, signal_params, Vec::new(), None)
    }

    /// Signal + background mixture with the given yield parametrisation.
    ///
    /// `yields` holds one parameter for [`YieldMode::Fraction`] and two
    /// (`n_sig`, `n_bkg`) for [`YieldMode::Extended`].
    pub fn mixture(
        signal: Arc<dyn UnbinnedPdf>,
        background: Arc<dyn UnbinnedPdf>,
        window: (f64, f64),
        masses: &[f64],
        shape_params: (Vec<Parameter>, Vec<Parameter>),
        mode: YieldMode,
        yields: Vec<Parameter>,
    ) -> Result<Self> {
        let (sig, bkg) = shape_params;
        Self::build(signal, Some(background), window, masses, sig, bkg, Some((mode, yields)))
    }

    fn build(
        signal: Arc<dyn UnbinnedPdf>,
        background: Option<Arc<dyn UnbinnedPdf>>,
        window: (f64, f64),
        masses: &[f64],
        sig_params: Vec<Parameter>,
        bkg_params: Vec<Parameter>,
        yields: Option<(YieldMode, Vec<Parameter>)>,
    ) -> Result<Self> {
        if !(window.0.is_finite() && window.1.is_finite() && window.0 < window.1) {
            return Err(Error::Validation(format!("invalid mass window {window:?}")));
        }
        if sig_params.len() != signal.n_params() {
            return Err(Error::Validation(format!(
                "{} expects {} parameters, got {}",
                signal.name(),
                signal.n_params(),
                sig_params.len()
            )));
        }
        let n_bkg = background.as_ref().map_or(0, |b| b.n_params());
        if bkg_params.len() != n_bkg {
            return Err(Error::Validation(format!(
                "background expects {n_bkg} parameters, got {}",
                bkg_params.len()
            )));
        }

        let masses: Vec<f64> =
            masses.iter().copied().filter(|m| (window.0..=window.1).contains(m)).collect();
        if masses.is_empty() {
            return Err(Error::EmptySample(format!(
                "no mass values inside the window [{}, {}]",
                window.0, window.1
            )));
        }

        let mut parameters = sig_params;
        parameters.extend(bkg_params);
        let yield_idx = parameters.len();
        let weights = match yields {
            None => Weights::SignalOnly,
            Some((YieldMode::Fraction, y)) if y.len() == 1 => {
                parameters.extend(y);
                Weights::Fraction { idx: yield_idx }
            }
            Some((YieldMode::Extended, y)) if y.len() == 2 => {
                parameters.extend(y);
                Weights::Extended { idx: yield_idx }
            }
            Some((mode, y)) => {
                return Err(Error::Validation(format!(
                    "{mode:?} yields need {} parameters, got {}",
                    if mode == YieldMode::Fraction { 1 } else { 2 },
                    y.len()
                )));
            }
        };
        if let Some(p) = parameters.iter().find(|p| !(p.bounds.0 <= p.bounds.1)) {
            return Err(Error::Validation(format!(
                "parameter '{}' has invalid bounds {:?}",
                p.name, p.bounds
            )));
        }

        Ok(Self { window, masses: Arc::new(masses), signal, background, parameters, weights })
    }

    /// Fit window.
    pub fn window(&self) -> (f64, f64) {
        self.window
    }

    /// Mass values inside the window.
    pub fn masses(&self) -> &[f64] {
        &self.masses
    }

    /// Number of events entering the likelihood.
    pub fn n_events(&self) -> usize {
        self.masses.len()
    }

    /// Parameter definitions.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Signal density.
    pub fn signal(&self) -> &dyn UnbinnedPdf {
        self.signal.as_ref()
    }

    /// Background density, if any.
    pub fn background(&self) -> Option<&dyn UnbinnedPdf> {
        self.background.as_deref()
    }

    /// Split a full parameter vector into (signal, background) shape slices.
    pub fn shape_slices<'p>(&self, params: &'p [f64]) -> (&'p [f64], &'p [f64]) {
        let ns = self.signal.n_params();
        let nb = self.background.as_ref().map_or(0, |b| b.n_params());
        (&params[..ns], &params[ns..ns + nb])
    }

    /// Yield parametrisation; `None` for a signal-only model.
    pub fn yield_mode(&self) -> Option<YieldMode> {
        match self.weights {
            Weights::SignalOnly => None,
            Weights::Fraction { .. } => Some(YieldMode::Fraction),
            Weights::Extended { .. } => Some(YieldMode::Extended),
        }
    }

    /// `(signal weight, background weight)` at `params`.
    ///
    /// Weights are event counts in extended mode and fractions otherwise.
    pub fn component_weights(&self, params: &[f64]) -> (f64, f64) {
        match self.weights {
            Weights::SignalOnly => (1.0, 0.0),
            Weights::Fraction { idx } => (params[idx], 1.0 - params[idx]),
            Weights::Extended { idx } => (params[idx], params[idx + 1]),
        }
    }

    /// Expected `(signal, background)` event counts in the window at `params`.
    pub fn component_counts(&self, params: &[f64]) -> (f64, f64) {
        let (a, b) = self.component_weights(params);
        match self.weights {
            Weights::Extended { .. } => (a, b),
            _ => {
                let n = self.n_events() as f64;
                (a * n, b * n)
            }
        }
    }

    fn nll_and_grad_internal(&self, params: &[f64], want_grad: bool) -> Result<(f64, Vec<f64>)> {
        if params.len() != self.parameters.len() {
            return Err(Error::Validation(format!(
                "parameter length mismatch: expected {}, got {}",
                self.parameters.len(),
                params.len()
            )));
        }
        let (sig_p, bkg_p) = self.shape_slices(params);
        let ns = sig_p.len();
        let nb = bkg_p.len();
        let (a, b) = self.component_weights(params);
        let (ln_a, ln_b) = (ln_weight(a), ln_weight(b));
        let window = self.window;

        #[derive(Clone)]
        struct Acc {
            sum_logf: f64,
            sum_ratio_s: f64,
            sum_ratio_b: f64,
            shape: Vec<f64>,
        }

        let chunk_acc = |xs: &[f64]| -> Result<Acc> {
            let n = xs.len();
            let mut lps = vec![0.0; n];
            let mut lpb = vec![f64::NEG_INFINITY; n];
            let mut dlps = Vec::new();
            let mut dlpb = Vec::new();
            if want_grad {
                dlps = vec![0.0; n * ns];
                self.signal.log_prob_grad_batch(xs, window, sig_p, &mut lps, &mut dlps)?;
            } else {
                self.signal.log_prob_batch(xs, window, sig_p, &mut lps)?;
            }
            if let Some(bkg) = &self.background {
                if want_grad {
                    dlpb = vec![0.0; n * nb];
                    bkg.log_prob_grad_batch(xs, window, bkg_p, &mut lpb, &mut dlpb)?;
                } else {
                    bkg.log_prob_batch(xs, window, bkg_p, &mut lpb)?;
                }
            }

            let mut acc =
                Acc { sum_logf: 0.0, sum_ratio_s: 0.0, sum_ratio_b: 0.0, shape: vec![0.0; ns + nb] };
            for i in 0..n {
                let raw = log_add_exp(ln_a + lps[i], ln_b + lpb[i]);
                let floored = !(raw > LOG_DENSITY_FLOOR);
                acc.sum_logf += if floored { LOG_DENSITY_FLOOR } else { raw };
                if !want_grad || floored {
                    continue;
                }
                // p_s / f and p_b / f, with f the mixture density.
                let ratio_s = (lps[i] - raw).exp();
                let ratio_b = (lpb[i] - raw).exp();
                acc.sum_ratio_s += ratio_s;
                acc.sum_ratio_b += ratio_b;
                let (r_s, r_b) = (a * ratio_s, b * ratio_b);
                for j in 0..ns {
                    acc.shape[j] += r_s * dlps[i * ns + j];
                }
                for j in 0..nb {
                    acc.shape[ns + j] += r_b * dlpb[i * nb + j];
                }
            }
            Ok(acc)
        };

        let partials: Vec<Acc> =
            self.masses.par_chunks(CHUNK).map(chunk_acc).collect::<Result<Vec<_>>>()?;

        let mut total = Acc { sum_logf: 0.0, sum_ratio_s: 0.0, sum_ratio_b: 0.0, shape: vec![0.0; ns + nb] };
        for p in &partials {
            total.sum_logf += p.sum_logf;
            total.sum_ratio_s += p.sum_ratio_s;
            total.sum_ratio_b += p.sum_ratio_b;
            for (t, v) in total.shape.iter_mut().zip(&p.shape) {
                *t += v;
            }
        }

        let mut nll = -total.sum_logf;
        if let Weights::Extended { .. } = self.weights {
            nll += a + b;
        }

        let mut grad = Vec::new();
        if want_grad {
            grad = vec![0.0; params.len()];
            for (g, s) in grad.iter_mut().zip(&total.shape) {
                *g = -s;
            }
            match self.weights {
                Weights::SignalOnly => {}
                Weights::Fraction { idx } => {
                    grad[idx] = -(total.sum_ratio_s - total.sum_ratio_b);
                }
                Weights::Extended { idx } => {
                    grad[idx] = 1.0 - total.sum_ratio_s;
                    grad[idx + 1] = 1.0 - total.sum_ratio_b;
                }
            }
        }
        Ok((nll, grad))
    }
}

fn ln_weight(w: f64) -> f64 {
    if w > 0.0 { w.ln() } else { f64::NEG_INFINITY }
}

impl LogDensityModel for MassModel {
    fn dim(&self) -> usize {
        self.parameters.len()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        self.parameters.iter().map(|p| p.bounds).collect()
    }

    fn parameter_init(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.init).collect()
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        Ok(self.nll_and_grad_internal(params, false)?.0)
    }

    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>> {
        Ok(self.nll_and_grad_internal(params, true)?.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::{ChebyshevPdf, GaussianPdf};
    use approx::assert_relative_eq;

    const WINDOW: (f64, f64) = (2.96, 3.04);

    fn masses() -> Vec<f64> {
        (0..400).map(|i| 2.96 + 0.08 * (i as f64 + 0.5) / 400.0).chain([2.991; 50]).collect()
    }

    fn gauss_params() -> Vec<Parameter> {
        vec![Parameter::new("mu", 2.99, (2.98, 3.0)), Parameter::new("sigma", 0.002, (0.001, 0.004))]
    }

    fn mixture(mode: YieldMode) -> MassModel {
        let yields = match mode {
            YieldMode::Fraction => vec![Parameter::new("f", 0.1, (0.01, 0.4))],
            YieldMode::Extended => vec![
                Parameter::new("n_sig", 50.0, (0.0, 1e4)),
                Parameter::new("n_bkg", 400.0, (0.0, 1e4)),
            ],
        };
        MassModel::mixture(
            Arc::new(GaussianPdf),
            Arc::new(ChebyshevPdf::new(1).unwrap()),
            WINDOW,
            &masses(),
            (gauss_params(), vec![Parameter::new("c1", 0.0, (-1.0, 1.0))]),
            mode,
            yields,
        )
        .unwrap()
    }

    fn check_grad(model: &MassModel, p: &[f64]) {
        let g = model.grad_nll(p).unwrap();
        for j in 0..p.len() {
            let h = 1e-6 * p[j].abs().max(1e-3);
            let mut up = p.to_vec();
            up[j] += h;
            let mut dn = p.to_vec();
            dn[j] -= h;
            let fd = (model.nll(&up).unwrap() - model.nll(&dn).unwrap()) / (2.0 * h);
            assert!(
                (fd - g[j]).abs() < 1e-4 * fd.abs().max(1.0),
                "param {j}: analytic {} vs numeric {fd}",
                g[j]
            );
        }
    }

    #[test]
    fn gradients_match_finite_differences() {
        check_grad(&mixture(YieldMode::Fraction), &[2.9905, 0.0022, 0.1, 0.12]);
        check_grad(&mixture(YieldMode::Extended), &[2.9905, 0.0022, 0.1, 60.0, 380.0]);
    }

    #[test]
    fn extended_nll_includes_poisson_term() {
        let ext = mixture(YieldMode::Extended);
        let frac = mixture(YieldMode::Fraction);
        let n = ext.n_events() as f64;
        let f = 0.1;
        let ext_nll = ext.nll(&[2.99, 0.002, 0.0, f * n, (1.0 - f) * n]).unwrap();
        let frac_nll = frac.nll(&[2.99, 0.002, 0.0, f]).unwrap();
        // -Σ log(N p) + N = -Σ log p - N log N + N
        assert_relative_eq!(ext_nll, frac_nll - n * n.ln() + n, epsilon = 1e-6);
    }

    #[test]
    fn out_of_window_values_are_dropped_and_empty_fails() {
        let model = MassModel::signal_only(
            Arc::new(GaussianPdf),
            (2.96, 3.01),
            &[2.95, 2.99, 3.02, 3.0],
            gauss_params(),
        )
        .unwrap();
        assert_eq!(model.n_events(), 2);

        let err =
            MassModel::signal_only(Arc::new(GaussianPdf), WINDOW, &[], gauss_params()).unwrap_err();
        assert!(matches!(err, Error::EmptySample(_)));
    }

    #[test]
    fn wrong_yield_arity_is_rejected() {
        let res = MassModel::mixture(
            Arc::new(GaussianPdf),
            Arc::new(ChebyshevPdf::new(1).unwrap()),
            WINDOW,
            &masses(),
            (gauss_params(), vec![Parameter::new("c1", 0.0, (-1.0, 1.0))]),
            YieldMode::Extended,
            vec![Parameter::new("f", 0.1, (0.01, 0.4))],
        );
        assert!(res.is_err());
    }

    #[test]
    fn yield_mode_from_str() {
        assert_eq!("extended".parse::<YieldMode>().unwrap(), YieldMode::Extended);
        assert!("both".parse::<YieldMode>().is_err());
    }
}
