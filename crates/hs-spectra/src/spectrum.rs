//! Efficiency-corrected binned spectra.
//!
//! [`SpectrumConfig`] is a plain value: variations of the selection are new
//! configs. [`build`] runs one mass fit per bin and assembles the raw-count,
//! efficiency and corrected-yield histograms. A failing bin is recorded in
//! its [`BinOutcome`] and the loop moves on.

use std::collections::BTreeMap;

use hs_core::{Error, Measurement, Result};
use hs_data::{Expr, Histogram1D, TabularDataset, validate_edges};
use hs_fit::{
    BackgroundShape, CurveFitOptions, CurveFitResult, FitFrame, MassFitConfig, MassFitModel,
    SignalReport, SignalShape, fit_histogram,
};
use serde::{Deserialize, Serialize};

use crate::shapes::{HYPERTRITON_MASS, SpectrumShape};

/// Kinematic variable the spectrum is binned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variable {
    /// Proper decay length in cm
    Ct,
    /// Transverse momentum in GeV/c
    Pt,
}

impl Variable {
    /// Reconstructed column (data and reconstructed MC).
    pub fn reco_column(self) -> &'static str {
        match self {
            Variable::Ct => "fCt",
            Variable::Pt => "fPt",
        }
    }

    /// Generated-level column of the MC denominator.
    pub fn gen_column(self) -> &'static str {
        match self {
            Variable::Ct => "fGenCt",
            Variable::Pt => "fAbsGenPt",
        }
    }

    /// Short label used in bin signatures and histogram titles.
    pub fn label(self) -> &'static str {
        match self {
            Variable::Ct => "ct",
            Variable::Pt => "pt",
        }
    }
}

/// Treatment of the MC statistical uncertainty of the efficiency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EfficiencyUncertainty {
    /// Only the raw-yield uncertainty enters the corrected yield
    #[default]
    Ignore,
    /// Raw-yield and binomial efficiency uncertainties added in quadrature
    Propagate,
}

/// Thresholds for flagging suspect mass fits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualityCriteria {
    /// Fits below this χ² probability are suspect
    pub min_fit_probability: f64,
    /// Leave suspect bins out of the systematic distributions
    pub exclude_suspect_from_systematics: bool,
}

impl Default for QualityCriteria {
    fn default() -> Self {
        Self { min_fit_probability: 0.05, exclude_suspect_from_systematics: true }
    }
}

/// Selection and fit shapes of one bin.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BinSettings {
    /// One clause per cut variable; the bin selection is their conjunction
    pub selection: BTreeMap<String, Expr>,
    /// Signal shape of the mass fit
    pub signal: SignalShape,
    /// Background shape of the mass fit
    pub background: BackgroundShape,
}

impl BinSettings {
    /// Settings with the given clauses and default shapes.
    pub fn with_selection(selection: BTreeMap<String, Expr>) -> Self {
        Self { selection, ..Self::default() }
    }

    /// Conjunction of all clauses (`true` when there are none).
    pub fn selection_expr(&self) -> Expr {
        Expr::all(self.selection.values().cloned())
    }

    /// Clauses rendered as `a & b & ...`.
    pub fn selection_string(&self) -> String {
        self.selection.values().map(|e| e.to_string()).collect::<Vec<_>>().join(" & ")
    }
}

/// Final fit of the corrected spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumFitConfig {
    /// Shape to fit
    pub shape: SpectrumShape,
    /// Particle mass for the pT shapes
    #[serde(default = "default_mass")]
    pub mass: f64,
    /// Range, fixed parameters, start values and bin-integral mode
    #[serde(default, flatten)]
    pub options: CurveFitOptions,
}

fn default_mass() -> f64 {
    HYPERTRITON_MASS
}

impl SpectrumFitConfig {
    /// Fit `shape` with default options.
    pub fn new(shape: SpectrumShape) -> Self {
        Self { shape, mass: HYPERTRITON_MASS, options: CurveFitOptions::default() }
    }
}

/// Immutable description of one spectrum extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumConfig {
    /// Binning variable
    pub variable: Variable,
    /// Bin edges (strictly increasing)
    pub bins: Vec<f64>,
    /// Per-bin selection and shapes (one entry per bin)
    pub settings: Vec<BinSettings>,
    /// Invariant-mass column used in the fits
    pub mass_column: String,
    /// Number of analysed events (pT normalisation)
    pub n_events: f64,
    /// Branching ratio of the reconstructed decay (pT normalisation)
    pub branching_ratio: f64,
    /// Rapidity window (pT normalisation)
    pub delta_rapidity: f64,
    /// Mass-fit defaults; per-bin shapes override `signal` and `background`
    pub mass_fit: MassFitConfig,
    /// Efficiency uncertainty treatment
    pub efficiency_uncertainty: EfficiencyUncertainty,
    /// Suspect-fit thresholds
    pub quality: QualityCriteria,
    /// Optional final fit of the corrected spectrum
    pub spectrum_fit: Option<SpectrumFitConfig>,
}

impl SpectrumConfig {
    /// Config with the same `settings` in every bin.
    pub fn new(variable: Variable, bins: Vec<f64>, settings: BinSettings) -> Result<Self> {
        validate_edges(&bins)?;
        let n = bins.len() - 1;
        let config = Self {
            variable,
            bins,
            settings: vec![settings; n],
            mass_column: "fMassH3L".into(),
            n_events: 1.0,
            branching_ratio: 0.25,
            delta_rapidity: 2.0,
            mass_fit: MassFitConfig::default(),
            efficiency_uncertainty: EfficiencyUncertainty::Ignore,
            quality: QualityCriteria::default(),
            spectrum_fit: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Replace the per-bin settings.
    pub fn with_bin_settings(mut self, settings: Vec<BinSettings>) -> Result<Self> {
        self.settings = settings;
        self.validate()?;
        Ok(self)
    }

    /// Check edges, per-bin list length, normalisation and mass-fit settings.
    pub fn validate(&self) -> Result<()> {
        validate_edges(&self.bins)?;
        if self.settings.len() != self.n_bins() {
            return Err(Error::Config(format!(
                "{} bins but {} per-bin selections",
                self.n_bins(),
                self.settings.len()
            )));
        }
        for (name, v) in [
            ("n_events", self.n_events),
            ("branching_ratio", self.branching_ratio),
            ("delta_rapidity", self.delta_rapidity),
        ] {
            if !(v > 0.0) || !v.is_finite() {
                return Err(Error::Config(format!("{name} must be positive, got {v}")));
            }
        }
        let p = self.quality.min_fit_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(Error::Config(format!("min_fit_probability must be in [0, 1], got {p}")));
        }
        self.mass_fit.validate()
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.bins.len() - 1
    }

    /// `[lo, hi)` of bin `i`.
    pub fn bin_range(&self, i: usize) -> (f64, f64) {
        (self.bins[i], self.bins[i + 1])
    }

    /// Divisor applied to `raw / efficiency` in bin `i`.
    pub fn normalisation(&self, i: usize) -> f64 {
        let (lo, hi) = self.bin_range(i);
        match self.variable {
            Variable::Ct => hi - lo,
            Variable::Pt => (hi - lo) * self.n_events * self.branching_ratio * self.delta_rapidity,
        }
    }

    /// Set the clause for cut `variable`, in bin `bin` or in every bin when `None`.
    ///
    /// An existing clause for the same variable is replaced, otherwise it is appended.
    pub fn vary_selection(&self, bin: Option<usize>, variable: &str, clause: Expr) -> Result<Self> {
        let mut next = self.clone();
        for s in next.bins_mut(bin)? {
            s.selection.insert(variable.to_string(), clause.clone());
        }
        Ok(next)
    }

    /// Set the mass-fit shapes, in bin `bin` or in every bin when `None`.
    pub fn with_shapes(
        &self,
        bin: Option<usize>,
        signal: SignalShape,
        background: BackgroundShape,
    ) -> Result<Self> {
        let mut next = self.clone();
        for s in next.bins_mut(bin)? {
            s.signal = signal;
            s.background = background;
        }
        Ok(next)
    }

    fn bins_mut(&mut self, bin: Option<usize>) -> Result<&mut [BinSettings]> {
        match bin {
            None => Ok(&mut self.settings[..]),
            Some(i) if i < self.settings.len() => Ok(&mut self.settings[i..=i]),
            Some(i) => Err(Error::Validation(format!(
                "bin {i} out of range ({} bins)",
                self.settings.len()
            ))),
        }
    }
}

/// Reconstruction efficiency of one bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Efficiency {
    /// Generated MC rows in the bin
    pub n_gen: usize,
    /// Selected reconstructed MC rows in the bin
    pub n_reco: usize,
    /// `n_reco / n_gen` with binomial error
    pub value: Measurement,
}

impl Efficiency {
    /// Ratio with binomial error `sqrt(ε(1-ε)/n_gen)`.
    ///
    /// `n_gen == 0` fails with [`Error::ZeroDenominator`]. More reconstructed
    /// than generated candidates (bin migration) fails with [`Error::Validation`].
    pub fn from_counts(n_reco: usize, n_gen: usize) -> Result<Self> {
        if n_gen == 0 {
            return Err(Error::ZeroDenominator("no generated MC candidates in bin".into()));
        }
        if n_reco > n_gen {
            return Err(Error::Validation(format!(
                "efficiency above one: {n_reco} reconstructed vs {n_gen} generated MC candidates"
            )));
        }
        let eff = n_reco as f64 / n_gen as f64;
        let err = (eff * (1.0 - eff) / n_gen as f64).max(0.0).sqrt();
        Ok(Self { n_gen, n_reco, value: Measurement::new(eff, err) })
    }
}

/// Corrected yield `raw / ε / norm`.
///
/// A zero efficiency fails with [`Error::ZeroDenominator`].
pub fn corrected_yield(
    raw: Measurement,
    efficiency: Measurement,
    normalisation: f64,
    mode: EfficiencyUncertainty,
) -> Result<Measurement> {
    if !(efficiency.value > 0.0) {
        return Err(Error::ZeroDenominator("efficiency is zero".into()));
    }
    let value = raw.value / efficiency.value / normalisation;
    let error = match mode {
        EfficiencyUncertainty::Ignore => raw.error / efficiency.value / normalisation,
        EfficiencyUncertainty::Propagate => {
            let stat = raw.error / efficiency.value / normalisation;
            (stat * stat + (value * efficiency.relative_error()).powi(2)).sqrt()
        }
    };
    Ok(Measurement::new(value, error))
}

/// A bin whose extraction succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinResult {
    /// Bin index
    pub index: usize,
    /// Lower edge
    pub lo: f64,
    /// Upper edge
    pub hi: f64,
    /// Applied selection
    pub selection: String,
    /// Signal shape used
    pub signal_shape: SignalShape,
    /// Background shape used
    pub background_shape: BackgroundShape,
    /// Efficiency
    pub efficiency: Efficiency,
    /// Fitted signal count
    pub raw_yield: Measurement,
    /// Efficiency-corrected yield
    pub corrected_yield: Measurement,
    /// Mass-fit report
    pub report: SignalReport,
    /// Mass-fit presentation frame
    pub frame: FitFrame,
    /// MC pre-fit frame
    pub prefit_frame: Option<FitFrame>,
    /// Fit did not converge or has a low χ² probability
    pub suspect: bool,
    /// One-line fit summary
    pub summary: String,
}

/// A bin whose extraction failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinFailure {
    /// Bin index
    pub index: usize,
    /// Lower edge
    pub lo: f64,
    /// Upper edge
    pub hi: f64,
    /// Efficiency, when it could be computed
    pub efficiency: Option<Efficiency>,
    /// Error kind tag
    pub kind: String,
    /// Error message
    pub message: String,
}

/// Outcome of one bin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BinOutcome {
    /// Extraction succeeded
    Fitted(Box<BinResult>),
    /// Extraction failed
    Failed(BinFailure),
}

impl BinOutcome {
    /// Successful result, if any.
    pub fn result(&self) -> Option<&BinResult> {
        match self {
            BinOutcome::Fitted(r) => Some(r),
            BinOutcome::Failed(_) => None,
        }
    }

    /// Efficiency, when it could be computed.
    pub fn efficiency(&self) -> Option<Efficiency> {
        match self {
            BinOutcome::Fitted(r) => Some(r.efficiency),
            BinOutcome::Failed(f) => f.efficiency,
        }
    }
}

/// Output of [`build`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumResult {
    /// Binning variable
    pub variable: Variable,
    /// Per-bin outcomes
    pub bins: Vec<BinOutcome>,
    /// Raw signal counts per unit bin width
    pub raw_counts: Histogram1D,
    /// Efficiency × acceptance
    pub efficiency: Histogram1D,
    /// Corrected yield
    pub corrected: Histogram1D,
    /// Final shape fit
    pub spectrum_fit: Option<CurveFitResult>,
    /// Why the final shape fit failed, if it did
    pub spectrum_fit_error: Option<String>,
}

impl SpectrumResult {
    /// Corrected yield of bin `i` when the bin succeeded.
    pub fn corrected_yield(&self, i: usize) -> Option<Measurement> {
        self.bins.get(i).and_then(BinOutcome::result).map(|r| r.corrected_yield)
    }

    /// Number of failed bins.
    pub fn n_failed(&self) -> usize {
        self.bins.iter().filter(|b| b.result().is_none()).count()
    }

    /// Per-bin log lines.
    pub fn log_lines(&self) -> Vec<String> {
        let label = self.variable.label();
        self.bins
            .iter()
            .map(|b| match b {
                BinOutcome::Fitted(r) => format!(
                    "{label} [{}, {}): eff = {}, raw = {}, corrected = {}, prob = {:.3}{}",
                    r.lo,
                    r.hi,
                    r.efficiency.value,
                    r.raw_yield,
                    r.corrected_yield,
                    r.report.fit_probability,
                    if r.suspect { " [suspect]" } else { "" }
                ),
                BinOutcome::Failed(f) => {
                    format!("{label} [{}, {}): FAILED ({}): {}", f.lo, f.hi, f.kind, f.message)
                }
            })
            .collect()
    }
}

/// Extract the spectrum described by `config`.
///
/// `mc_gen` provides the generated-level denominator, `mc_reco` the
/// reconstructed MC used for the numerator and the signal pre-fit. Missing
/// columns fail before the bin loop; per-bin errors are recorded.
pub fn build(
    config: &SpectrumConfig,
    data: &TabularDataset,
    mc_gen: &TabularDataset,
    mc_reco: &TabularDataset,
) -> Result<SpectrumResult> {
    config.validate()?;
    let reco_col = config.variable.reco_column();
    let gen_values = mc_gen.column(config.variable.gen_column())?;
    for ds in [data, mc_reco] {
        ds.column(reco_col)?;
        ds.column(&config.mass_column)?;
    }

    let label = config.variable.label();
    let hist = |name: &str, y: &str| {
        Histogram1D::new(name, format!(";{label};{y}"), config.bins.clone())
    };
    let mut raw_counts = hist("h_raw_counts", "raw counts / bin width")?;
    let mut efficiency = hist("h_efficiency", "efficiency x acceptance")?;
    let mut corrected = hist("h_corrected_counts", "corrected yield")?;

    let mut outcomes = Vec::with_capacity(config.n_bins());
    for i in 0..config.n_bins() {
        let (lo, hi) = config.bin_range(i);
        let fail = |eff: Option<Efficiency>, e: Error| {
            log::warn!("{label} bin [{lo}, {hi}) failed: {e}");
            BinOutcome::Failed(BinFailure {
                index: i,
                lo,
                hi,
                efficiency: eff,
                kind: e.kind().to_string(),
                message: e.to_string(),
            })
        };

        let n_gen = gen_values.iter().filter(|&&v| v >= lo && v < hi).count();
        let selection = Expr::col(reco_col).in_range(lo, hi).and(config.settings[i].selection_expr());
        let (data_bin, reco_bin) = match (data.filter(&selection), mc_reco.filter(&selection)) {
            (Ok(d), Ok(r)) => (d, r),
            (Err(e), _) | (_, Err(e)) => {
                outcomes.push(fail(None, e));
                continue;
            }
        };
        let eff = match Efficiency::from_counts(reco_bin.count(), n_gen) {
            Ok(e) => e,
            Err(e) => {
                outcomes.push(fail(None, e));
                continue;
            }
        };
        efficiency.set_bin(i, eff.value.value, eff.value.error);

        match fit_bin(config, i, &data_bin, &reco_bin, eff) {
            Ok(r) => {
                log::info!(
                    "{label} [{lo}, {hi}): eff = {}, raw = {}, prob = {:.3}",
                    r.efficiency.value,
                    r.raw_yield,
                    r.report.fit_probability
                );
                let width = raw_counts.bin_width(i);
                raw_counts.set_bin(i, r.raw_yield.value / width, r.raw_yield.error / width);
                corrected.set_bin(i, r.corrected_yield.value, r.corrected_yield.error);
                outcomes.push(BinOutcome::Fitted(Box::new(r)));
            }
            Err(e) => outcomes.push(fail(Some(eff), e)),
        }
    }

    let (spectrum_fit, spectrum_fit_error) = match &config.spectrum_fit {
        None => (None, None),
        Some(fit_cfg) => match fit_spectrum(&corrected, fit_cfg) {
            Ok(r) => (Some(r), None),
            Err(e) => {
                log::warn!("{} fit of the corrected spectrum failed: {e}", fit_cfg.shape);
                (None, Some(e.to_string()))
            }
        },
    };

    Ok(SpectrumResult {
        variable: config.variable,
        bins: outcomes,
        raw_counts,
        efficiency,
        corrected,
        spectrum_fit,
        spectrum_fit_error,
    })
}

fn fit_bin(
    config: &SpectrumConfig,
    i: usize,
    data_bin: &TabularDataset,
    reco_bin: &TabularDataset,
    eff: Efficiency,
) -> Result<BinResult> {
    let settings = &config.settings[i];
    let (lo, hi) = config.bin_range(i);
    let mass_cfg = MassFitConfig {
        signal: settings.signal,
        background: settings.background,
        ..config.mass_fit.clone()
    };

    let fitted = MassFitModel::new(mass_cfg)?
        .prefit_signal(reco_bin.column(&config.mass_column)?)?
        .fit(data_bin.column(&config.mass_column)?)?;
    let report = *fitted.report();
    let raw_yield = report.signal;
    let corrected_yield = corrected_yield(
        raw_yield,
        eff.value,
        config.normalisation(i),
        config.efficiency_uncertainty,
    )?;
    let suspect = !report.converged || report.fit_probability < config.quality.min_fit_probability;
    if suspect {
        log::warn!(
            "{} [{lo}, {hi}): suspect mass fit (converged = {}, prob = {:.3})",
            config.variable.label(),
            report.converged,
            report.fit_probability
        );
    }

    Ok(BinResult {
        index: i,
        lo,
        hi,
        selection: settings.selection_string(),
        signal_shape: settings.signal,
        background_shape: settings.background,
        efficiency: eff,
        raw_yield,
        corrected_yield,
        report,
        frame: fitted.frame().clone(),
        prefit_frame: fitted.prefit().map(|p| p.frame.clone()),
        suspect,
        summary: fitted.summary(),
    })
}

/// Fit the corrected spectrum with the configured shape.
///
/// For `expo_ct` the normalisation is fixed to the histogram integral over
/// the fit range and the range limits are fixed to the range itself.
pub fn fit_spectrum(corrected: &Histogram1D, fit: &SpectrumFitConfig) -> Result<CurveFitResult> {
    let mut options = fit.options.clone();
    let (lo, hi) = options.range.unwrap_or((corrected.x_min(), corrected.x_max()));
    options.range = Some((lo, hi));
    if fit.shape == SpectrumShape::ExpoCt {
        let integral: f64 = (0..corrected.n_bins())
            .filter(|&b| (lo..=hi).contains(&corrected.bin_center(b)))
            .map(|b| corrected.content(b) * corrected.bin_width(b))
            .sum();
        options.fixed.entry("norm".into()).or_insert(integral);
        options.fixed.entry("ct_min".into()).or_insert(lo);
        options.fixed.entry("ct_max".into()).or_insert(hi);
    }
    let curve = fit.shape.curve(fit.mass);
    let result = fit_histogram(corrected, curve.as_ref(), &options)?;
    log::info!(
        "{} fit of the corrected spectrum: chi2/ndf = {:.2}/{}, prob = {:.3}",
        fit.shape,
        result.chi2,
        result.ndf,
        result.probability
    );
    Ok(result)
}
