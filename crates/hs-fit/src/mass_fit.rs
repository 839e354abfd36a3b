//! Signal extraction from an invariant-mass sample.
//!
//! [`MassFitModel`] is the unfit state. [`MassFitModel::prefit_signal`]
//! optionally fixes the signal tails on a Monte Carlo sample, and
//! [`MassFitModel::fit`] consumes the model to produce a [`FittedMassModel`],
//! so a configured model is fit at most once.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use hs_core::{Error, FitResult, LogDensityModel, Measurement, Result};
use hs_data::Histogram1D;
use serde::{Deserialize, Serialize};

use crate::mass_model::{MassModel, Parameter, YieldMode};
use crate::math::chi2_probability;
use crate::mle::MaximumLikelihoodEstimator;
use crate::optimizer::OptimizerConfig;
use crate::pdf::{ChebyshevPdf, DoubleCrystalBallPdf, GaussianPdf, UnbinnedPdf};

/// Signal peak shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalShape {
    /// Double-sided Crystal Ball
    #[default]
    Dscb,
    /// Gaussian
    Gaus,
}

impl SignalShape {
    fn pdf(self) -> Arc<dyn UnbinnedPdf> {
        match self {
            SignalShape::Dscb => Arc::new(DoubleCrystalBallPdf),
            SignalShape::Gaus => Arc::new(GaussianPdf),
        }
    }

    /// Identifier used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            SignalShape::Dscb => "dscb",
            SignalShape::Gaus => "gaus",
        }
    }
}

impl FromStr for SignalShape {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dscb" => Ok(Self::Dscb),
            "gaus" => Ok(Self::Gaus),
            other => {
                Err(Error::Config(format!("unknown signal shape '{other}' (expected dscb or gaus)")))
            }
        }
    }
}

impl fmt::Display for SignalShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Background shape: Chebyshev polynomial of degree 1 or 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundShape {
    /// First-order Chebyshev polynomial
    #[default]
    Pol1,
    /// Second-order Chebyshev polynomial
    Pol2,
}

impl BackgroundShape {
    fn order(self) -> usize {
        match self {
            BackgroundShape::Pol1 => 1,
            BackgroundShape::Pol2 => 2,
        }
    }

    /// Identifier used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            BackgroundShape::Pol1 => "pol1",
            BackgroundShape::Pol2 => "pol2",
        }
    }
}

impl FromStr for BackgroundShape {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pol1" => Ok(Self::Pol1),
            "pol2" => Ok(Self::Pol2),
            other => Err(Error::Config(format!(
                "unknown background shape '{other}' (expected pol1 or pol2)"
            ))),
        }
    }
}

impl fmt::Display for BackgroundShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start value and range of one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    /// Start value
    pub init: f64,
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
}

impl ParamRange {
    /// New range.
    pub const fn new(init: f64, min: f64, max: f64) -> Self {
        Self { init, min, max }
    }

    fn parameter(&self, name: &str) -> Parameter {
        Parameter::new(name, self.init.clamp(self.min, self.max), (self.min, self.max))
    }

    fn validate(&self, name: &str) -> Result<()> {
        if !(self.min.is_finite() && self.max.is_finite() && self.min <= self.max) {
            return Err(Error::Config(format!(
                "parameter '{name}' has an invalid range [{}, {}]",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Mass-fit settings. Defaults are the ³ΛH analysis values (GeV/c²).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MassFitConfig {
    /// Fit window
    pub window: (f64, f64),
    /// Window of the Monte Carlo signal pre-fit
    pub prefit_window: (f64, f64),
    /// Signal shape
    pub signal: SignalShape,
    /// Background shape
    pub background: BackgroundShape,
    /// Yield parametrisation
    pub yield_mode: YieldMode,
    /// Peak position
    pub mu: ParamRange,
    /// Peak width
    pub sigma: ParamRange,
    /// Left tail start (DSCB)
    pub alpha_l: ParamRange,
    /// Left tail exponent (DSCB)
    pub n_l: ParamRange,
    /// Right tail start (DSCB)
    pub alpha_r: ParamRange,
    /// Right tail exponent (DSCB)
    pub n_r: ParamRange,
    /// Range of every Chebyshev coefficient
    pub chebyshev: ParamRange,
    /// Signal fraction (fraction mode)
    pub fraction: ParamRange,
    /// Width range after the pre-fit is `[σ_mc, factor × σ_mc]`
    pub sigma_widening: f64,
    /// Bins of the diagnostic histogram used for χ²
    pub n_hist_bins: usize,
    /// Optimiser iteration cap
    pub max_iter: u64,
}

impl Default for MassFitConfig {
    fn default() -> Self {
        Self {
            window: (2.96, 3.04),
            prefit_window: (2.96, 3.01),
            signal: SignalShape::Dscb,
            background: BackgroundShape::Pol1,
            yield_mode: YieldMode::Fraction,
            mu: ParamRange::new(2.991, 2.98, 3.0),
            sigma: ParamRange::new(0.002, 0.001, 0.004),
            alpha_l: ParamRange::new(1.5, 0.01, 5.0),
            n_l: ParamRange::new(3.0, 1.01, 10.0),
            alpha_r: ParamRange::new(1.5, 0.01, 10.0),
            n_r: ParamRange::new(3.0, 1.01, 10.0),
            chebyshev: ParamRange::new(0.0, -1.0, 1.0),
            fraction: ParamRange::new(0.1, 0.01, 0.4),
            sigma_widening: 1.5,
            n_hist_bins: 30,
            max_iter: 1000,
        }
    }
}

impl MassFitConfig {
    /// Check ranges and windows.
    pub fn validate(&self) -> Result<()> {
        for (name, w) in [("window", self.window), ("prefit_window", self.prefit_window)] {
            if !(w.0.is_finite() && w.1.is_finite() && w.0 < w.1) {
                return Err(Error::Config(format!("{name} must satisfy lo < hi, got {w:?}")));
            }
        }
        for (name, r) in [
            ("mu", &self.mu),
            ("sigma", &self.sigma),
            ("alpha_l", &self.alpha_l),
            ("n_l", &self.n_l),
            ("alpha_r", &self.alpha_r),
            ("n_r", &self.n_r),
            ("chebyshev", &self.chebyshev),
            ("fraction", &self.fraction),
        ] {
            r.validate(name)?;
        }
        if self.sigma.min <= 0.0 {
            return Err(Error::Config("sigma range must be positive".into()));
        }
        if self.alpha_l.min <= 0.0 || self.alpha_r.min <= 0.0 {
            return Err(Error::Config("alpha ranges must be positive".into()));
        }
        if self.n_l.min <= 1.0 || self.n_r.min <= 1.0 {
            return Err(Error::Config("tail exponent ranges must lie above 1".into()));
        }
        if !(self.fraction.min >= 0.0 && self.fraction.max <= 1.0) {
            return Err(Error::Config("fraction range must lie in [0, 1]".into()));
        }
        if !(self.sigma_widening >= 1.0) {
            return Err(Error::Config("sigma_widening must be >= 1".into()));
        }
        if self.n_hist_bins == 0 {
            return Err(Error::Config("n_hist_bins must be positive".into()));
        }
        Ok(())
    }

    fn signal_parameters(&self) -> Vec<Parameter> {
        let mut params = vec![self.mu.parameter("mu"), self.sigma.parameter("sigma")];
        if self.signal == SignalShape::Dscb {
            params.extend([
                self.alpha_l.parameter("alpha_l"),
                self.n_l.parameter("n_l"),
                self.alpha_r.parameter("alpha_r"),
                self.n_r.parameter("n_r"),
            ]);
        }
        params
    }

    fn background_parameters(&self) -> Vec<Parameter> {
        (1..=self.background.order()).map(|k| self.chebyshev.parameter(&format!("c{k}"))).collect()
    }

    fn estimator(&self) -> MaximumLikelihoodEstimator {
        MaximumLikelihoodEstimator::with_config(OptimizerConfig {
            max_iter: self.max_iter,
            ..OptimizerConfig::default()
        })
    }
}

/// Binned data plus density curves for presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitFrame {
    /// Frame name
    pub name: String,
    /// Data histogram (Poisson errors)
    pub data: Histogram1D,
    /// Abscissae of the curves
    pub curve_x: Vec<f64>,
    /// Total fitted density in counts per bin
    pub total: Vec<f64>,
    /// Background component in counts per bin (empty for signal-only fits)
    pub background: Vec<f64>,
    /// Signal component in counts per bin
    pub signal: Vec<f64>,
}

/// Outcome of the MC signal pre-fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefitSummary {
    /// Signal-only fit result
    pub fit: FitResult,
    /// Pre-fit presentation frame
    pub frame: FitFrame,
}

/// Signal-extraction quantities from a fitted model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalReport {
    /// Peak position
    pub mu: Measurement,
    /// Peak width
    pub sigma: Measurement,
    /// Signal count in the fit window
    pub signal: Measurement,
    /// Background count in the fit window
    pub background: Measurement,
    /// Signal in `μ ± 3σ`
    pub signal_3sigma: Measurement,
    /// Background in `μ ± 3σ`
    pub background_3sigma: Measurement,
    /// `S / sqrt(S + B)` in `μ ± 3σ`
    pub significance: Measurement,
    /// `S / B` in `μ ± 3σ`
    pub signal_over_background: Measurement,
    /// χ² of the fitted density against the diagnostic histogram
    pub chi2: f64,
    /// Degrees of freedom of `chi2`
    pub ndf: usize,
    /// χ² upper-tail probability
    pub fit_probability: f64,
    /// Minimiser convergence flag
    pub converged: bool,
}

impl SignalReport {
    /// `chi2 / ndf`, NaN when `ndf == 0`.
    pub fn chi2_ndf(&self) -> f64 {
        if self.ndf == 0 { f64::NAN } else { self.chi2 / self.ndf as f64 }
    }
}

/// Unfit mass model: configuration plus optional pre-fit signal constraints.
#[derive(Debug, Clone)]
pub struct MassFitModel {
    config: MassFitConfig,
    signal_params: Vec<Parameter>,
    prefit: Option<PrefitSummary>,
}

impl MassFitModel {
    /// New model from a validated configuration.
    pub fn new(config: MassFitConfig) -> Result<Self> {
        config.validate()?;
        let signal_params = config.signal_parameters();
        Ok(Self { config, signal_params, prefit: None })
    }

    /// Configuration in use.
    pub fn config(&self) -> &MassFitConfig {
        &self.config
    }

    /// Current signal parameter definitions (after a pre-fit, tails are frozen).
    pub fn signal_parameters(&self) -> &[Parameter] {
        &self.signal_params
    }

    /// Fit the signal shape alone to MC masses inside the pre-fit window, then
    /// freeze the tail parameters and set the width range to
    /// `[σ_mc, sigma_widening × σ_mc]`.
    pub fn prefit_signal(mut self, mc_masses: &[f64]) -> Result<Self> {
        if mc_masses.is_empty() {
            return Err(Error::EmptySample("MC mass sample for the signal pre-fit is empty".into()));
        }
        let model = MassModel::signal_only(
            self.config.signal.pdf(),
            self.config.prefit_window,
            mc_masses,
            self.signal_params.clone(),
        )?;
        let fit = self.config.estimator().fit(&model)?;
        if !fit.converged {
            log::warn!("signal pre-fit did not converge: {}", fit.message);
        }

        let sigma_mc = fit.parameters[1];
        let mut params = Vec::with_capacity(self.signal_params.len());
        for (p, &value) in self.signal_params.iter().zip(&fit.parameters) {
            params.push(match p.name.as_str() {
                "mu" => Parameter::new("mu", value, p.bounds),
                "sigma" => Parameter::new(
                    "sigma",
                    sigma_mc,
                    (sigma_mc, sigma_mc * self.config.sigma_widening),
                ),
                _ => Parameter::frozen(p.name.clone(), value),
            });
        }
        log::info!(
            "signal pre-fit on {} MC candidates: mu = {:.5}, sigma = {:.5}",
            model.n_events(),
            fit.parameters[0],
            sigma_mc
        );

        let frame = build_frame("mc_prefit", &model, &fit.parameters, 80)?;
        self.signal_params = params;
        self.prefit = Some(PrefitSummary { fit, frame });
        Ok(self)
    }

    /// Fit signal + background to `masses` by unbinned maximum likelihood.
    ///
    /// Values outside the fit window are ignored. An empty input fails with
    /// [`Error::EmptySample`].
    pub fn fit(self, masses: &[f64]) -> Result<FittedMassModel> {
        if masses.is_empty() {
            return Err(Error::EmptySample("data mass sample is empty".into()));
        }
        let cfg = &self.config;
        let n_in_window =
            masses.iter().filter(|m| (cfg.window.0..=cfg.window.1).contains(*m)).count() as f64;
        let yields = match cfg.yield_mode {
            YieldMode::Fraction => vec![cfg.fraction.parameter("f")],
            YieldMode::Extended => {
                let cap = 1.5 * n_in_window + 10.0;
                let f0 = cfg.fraction.init.clamp(0.0, 1.0);
                vec![
                    Parameter::new("n_sig", f0 * n_in_window, (0.0, cap)),
                    Parameter::new("n_bkg", (1.0 - f0) * n_in_window, (0.0, cap)),
                ]
            }
        };
        let background = ChebyshevPdf::new(cfg.background.order())?;
        let model = MassModel::mixture(
            cfg.signal.pdf(),
            Arc::new(background),
            cfg.window,
            masses,
            (self.signal_params.clone(), cfg.background_parameters()),
            cfg.yield_mode,
            yields,
        )?;

        let fit = cfg.estimator().fit(&model)?;
        if fit.converged {
            log::debug!("mass fit converged after {} iterations", fit.n_iter);
        } else {
            log::warn!("mass fit did not converge: {}", fit.message);
        }

        let report = compute_report(&model, &fit, cfg.n_hist_bins)?;
        let frame = build_frame("data_fit", &model, &fit.parameters, cfg.n_hist_bins)?;
        Ok(FittedMassModel { config: self.config, prefit: self.prefit, model, fit, report, frame })
    }
}

/// A mass model after its single data fit.
#[derive(Debug, Clone)]
pub struct FittedMassModel {
    config: MassFitConfig,
    prefit: Option<PrefitSummary>,
    model: MassModel,
    fit: FitResult,
    report: SignalReport,
    frame: FitFrame,
}

impl FittedMassModel {
    /// Configuration used.
    pub fn config(&self) -> &MassFitConfig {
        &self.config
    }

    /// Minimiser result.
    pub fn fit_result(&self) -> &FitResult {
        &self.fit
    }

    /// Extracted quantities.
    pub fn report(&self) -> &SignalReport {
        &self.report
    }

    /// Data overlay with fitted components.
    pub fn frame(&self) -> &FitFrame {
        &self.frame
    }

    /// MC pre-fit outcome, when one was run.
    pub fn prefit(&self) -> Option<&PrefitSummary> {
        self.prefit.as_ref()
    }

    /// Number of events inside the window.
    pub fn n_events(&self) -> usize {
        self.model.n_events()
    }

    /// One-line summary in MeV/c².
    pub fn summary(&self) -> String {
        let r = &self.report;
        format!(
            "mu = {:.2} ± {:.2} MeV/c², sigma = {:.2} ± {:.2} MeV/c², S = {:.1} ± {:.1}, \
             S/sqrt(S+B) (3σ) = {:.2} ± {:.2}, χ²/ndf = {:.2} (prob {:.3}){}",
            r.mu.value * 1e3,
            r.mu.error * 1e3,
            r.sigma.value * 1e3,
            r.sigma.error * 1e3,
            r.signal.value,
            r.signal.error,
            r.significance.value,
            r.significance.error,
            r.chi2_ndf(),
            r.fit_probability,
            if r.converged { "" } else { " [not converged]" }
        )
    }
}

fn compute_report(model: &MassModel, fit: &FitResult, n_bins: usize) -> Result<SignalReport> {
    let p = &fit.parameters;
    let n = model.n_events() as f64;
    let (sig_p, bkg_p) = model.shape_slices(p);
    let window = model.window();
    let bkg = model
        .background()
        .ok_or_else(|| Error::Computation("signal report needs a background component".into()))?;

    let mu = Measurement::new(p[0], fit.uncertainties[0]);
    let sigma = Measurement::new(p[1], fit.uncertainties[1]);

    let yield_idx = sig_p.len() + bkg_p.len();
    let (signal, background) = match model.yield_mode() {
        Some(YieldMode::Fraction) => {
            let (f, f_err) = (p[yield_idx], fit.uncertainties[yield_idx]);
            (Measurement::new(f * n, f_err * n), Measurement::new((1.0 - f) * n, f_err * n))
        }
        _ => (
            Measurement::new(p[yield_idx], fit.uncertainties[yield_idx]),
            Measurement::new(p[yield_idx + 1], fit.uncertainties[yield_idx + 1]),
        ),
    };

    let range = (mu.value - 3.0 * sigma.value, mu.value + 3.0 * sigma.value);
    let sig_frac = model.signal().integral_fraction(sig_p, window, range)?;
    let bkg_frac = bkg.integral_fraction(bkg_p, window, range)?;
    let s3 = scaled(signal, sig_frac);
    let b3 = scaled(background, bkg_frac);

    let significance = significance(s3, b3);
    let signal_over_background = if b3.value > 0.0 {
        let ratio = s3.value / b3.value;
        Measurement::new(ratio, ratio * rel(s3).hypot(rel(b3)))
    } else {
        Measurement::new(f64::NAN, f64::NAN)
    };

    let (chi2, n_used) = chi2_against_histogram(model, p, n_bins)?;
    let n_free = model.free_parameters().len();
    let ndf = n_used.saturating_sub(n_free);

    Ok(SignalReport {
        mu,
        sigma,
        signal,
        background,
        signal_3sigma: s3,
        background_3sigma: b3,
        significance,
        signal_over_background,
        chi2,
        ndf,
        fit_probability: chi2_probability(chi2, ndf),
        converged: fit.converged,
    })
}

/// `m` scaled by `frac`, keeping the relative error.
fn scaled(m: Measurement, frac: f64) -> Measurement {
    Measurement::new(m.value * frac, m.error * frac)
}

fn rel(m: Measurement) -> f64 {
    if m.value != 0.0 { m.error / m.value } else { 0.0 }
}

/// `S / sqrt(S + B)` with first-order error propagation.
fn significance(s: Measurement, b: Measurement) -> Measurement {
    let sb = s.value + b.value;
    if !(sb > 0.0) {
        return Measurement::new(0.0, 0.0);
    }
    let root = sb.sqrt();
    let value = s.value / root;
    let ds = (root - s.value / (2.0 * root)) / sb;
    let db = s.value / (2.0 * root) / sb;
    Measurement::new(value, (ds * s.error).hypot(db * b.error))
}

/// Expected counts per bin from the fitted mixture.
fn expected_counts(model: &MassModel, params: &[f64], edges: &[f64]) -> Result<Vec<(f64, f64)>> {
    let (sig_p, bkg_p) = model.shape_slices(params);
    let window = model.window();
    let (a, b) = model.component_counts(params);
    edges
        .windows(2)
        .map(|w| {
            let s = a * model.signal().integral_fraction(sig_p, window, (w[0], w[1]))?;
            let bk = match model.background() {
                Some(bkg) => b * bkg.integral_fraction(bkg_p, window, (w[0], w[1]))?,
                None => 0.0,
            };
            Ok((s, bk))
        })
        .collect()
}

/// Neyman χ² over non-empty bins; returns `(chi2, bins used)`.
fn chi2_against_histogram(model: &MassModel, params: &[f64], n_bins: usize) -> Result<(f64, usize)> {
    let window = model.window();
    let mut hist = Histogram1D::uniform("mass", "", n_bins, window.0, window.1)?;
    hist.fill_all(model.masses());
    let expected = expected_counts(model, params, &hist.bin_edges)?;
    let mut chi2 = 0.0;
    let mut used = 0;
    for (i, (s, b)) in expected.iter().enumerate() {
        let obs = hist.content(i);
        if obs <= 0.0 {
            continue;
        }
        chi2 += (obs - s - b).powi(2) / obs;
        used += 1;
    }
    Ok((chi2, used))
}

fn build_frame(name: &str, model: &MassModel, params: &[f64], n_bins: usize) -> Result<FitFrame> {
    let window = model.window();
    let mut data = Histogram1D::uniform(name, ";m (GeV/c^{2});counts", n_bins, window.0, window.1)?;
    data.fill_all(model.masses());
    let bin_width = data.bin_width(0);

    let (sig_p, bkg_p) = model.shape_slices(params);
    let (a, b) = model.component_counts(params);

    let n_points = 200;
    let curve_x: Vec<f64> = (0..n_points)
        .map(|i| window.0 + (window.1 - window.0) * (i as f64 + 0.5) / n_points as f64)
        .collect();
    let mut lp = vec![0.0; n_points];
    model.signal().log_prob_batch(&curve_x, window, sig_p, &mut lp)?;
    let signal: Vec<f64> = lp.iter().map(|v| a * bin_width * v.exp()).collect();
    let background: Vec<f64> = match model.background() {
        Some(bkg) => {
            bkg.log_prob_batch(&curve_x, window, bkg_p, &mut lp)?;
            lp.iter().map(|v| b * bin_width * v.exp()).collect()
        }
        None => Vec::new(),
    };
    let total = if background.is_empty() {
        signal.clone()
    } else {
        signal.iter().zip(&background).map(|(s, b)| s + b).collect()
    };
    Ok(FitFrame { name: name.to_string(), data, curve_x, total, background, signal })
}
