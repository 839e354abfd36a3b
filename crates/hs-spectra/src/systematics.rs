//! Systematic scans over selection and fit-shape variations.
//!
//! Trials are planned sequentially from one seeded generator and then run
//! in parallel with rayon, so a scan gives the same result for any number
//! of threads. Each trial builds a fresh spectrum from its own config.

use std::collections::HashSet;

use hs_core::{Error, Measurement, Result};
use hs_data::{Expr, Histogram1D, TabularDataset};
use hs_fit::{BackgroundShape, CurveFitOptions, GaussianCurve, SignalShape, fit_histogram};
use rand::Rng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::spectrum::{BinSettings, SpectrumConfig, SpectrumResult, build};

/// Number of bins of the per-bin yield distributions.
pub const DISTRIBUTION_BINS: usize = 50;

/// Cut values `variable > v` (or `<`) over `linspace(lo, hi, n)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CutGrid {
    /// Column the cut applies to
    pub variable: String,
    /// `true` for `>` cuts, `false` for `<`
    pub greater: bool,
    /// `(lo, hi, n)`
    pub range: (f64, f64, usize),
}

impl CutGrid {
    /// Grid of `n` cuts on `variable` from `lo` to `hi`.
    pub fn new(variable: impl Into<String>, greater: bool, lo: f64, hi: f64, n: usize) -> Self {
        Self { variable: variable.into(), greater, range: (lo, hi, n) }
    }

    /// Cut values.
    pub fn values(&self) -> Vec<f64> {
        let (lo, hi, n) = self.range;
        match n {
            0 => Vec::new(),
            1 => vec![lo],
            _ => (0..n).map(|k| lo + (hi - lo) * k as f64 / (n - 1) as f64).collect(),
        }
    }

    /// One clause per cut value.
    pub fn clauses(&self) -> Vec<Expr> {
        self.values()
            .into_iter()
            .map(|v| {
                let col = Expr::col(self.variable.clone());
                if self.greater { col.gt(v) } else { col.lt(v) }
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        let (lo, hi, n) = self.range;
        if n == 0 {
            return Err(Error::Config(format!("cut grid on '{}' needs n >= 1", self.variable)));
        }
        if !lo.is_finite() || !hi.is_finite() || lo > hi {
            return Err(Error::Config(format!(
                "cut grid on '{}' has invalid range [{lo}, {hi}]",
                self.variable
            )));
        }
        Ok(())
    }
}

/// How variations are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// One variable at a time, others at nominal, same settings in all bins
    Separated,
    /// Cartesian product of all variables, drawn independently per bin
    #[default]
    Mixed,
}

/// Settings of a systematic scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystematicsConfig {
    /// Combination mode
    pub mode: ScanMode,
    /// Target number of trials (mixed mode)
    pub n_trials: usize,
    /// Seed of the trial planning
    pub seed: u64,
    /// Cut variations
    pub cut_grid: Vec<CutGrid>,
    /// Signal shape alternatives
    pub signal_fit_funcs: Vec<SignalShape>,
    /// Background shape alternatives
    pub bkg_fit_funcs: Vec<BackgroundShape>,
}

impl Default for SystematicsConfig {
    fn default() -> Self {
        Self {
            mode: ScanMode::Mixed,
            n_trials: 100,
            seed: 42,
            cut_grid: Vec::new(),
            signal_fit_funcs: vec![SignalShape::Dscb],
            bkg_fit_funcs: vec![BackgroundShape::Pol1],
        }
    }
}

impl SystematicsConfig {
    /// Check grids, shape lists and the trial count.
    pub fn validate(&self) -> Result<()> {
        for g in &self.cut_grid {
            g.validate()?;
        }
        if self.signal_fit_funcs.is_empty() || self.bkg_fit_funcs.is_empty() {
            return Err(Error::Config("systematic shape lists must not be empty".into()));
        }
        if self.n_trials == 0 {
            return Err(Error::Config("n_trials must be at least 1".into()));
        }
        Ok(())
    }

    fn dimensions(&self) -> Vec<usize> {
        let mut dims: Vec<usize> = self.cut_grid.iter().map(|g| g.range.2).collect();
        dims.push(self.signal_fit_funcs.len());
        dims.push(self.bkg_fit_funcs.len());
        dims
    }
}

/// One point of the variation space.
#[derive(Debug, Clone, PartialEq)]
struct Combination {
    cuts: Vec<(String, Expr)>,
    signal: SignalShape,
    background: BackgroundShape,
}

impl Combination {
    fn describe(&self) -> String {
        let mut parts: Vec<String> = self.cuts.iter().map(|(_, e)| e.to_string()).collect();
        parts.push(self.signal.to_string());
        parts.push(self.background.to_string());
        parts.join(" & ")
    }

    fn apply(&self, base: &BinSettings) -> BinSettings {
        let mut s = base.clone();
        for (var, clause) in &self.cuts {
            s.selection.insert(var.clone(), clause.clone());
        }
        s.signal = self.signal;
        s.background = self.background;
        s
    }
}

/// Mixed-radix decoding of a combination index.
fn decode(syst: &SystematicsConfig, clauses: &[Vec<Expr>], mut index: usize) -> Combination {
    let dims = syst.dimensions();
    let mut digits = vec![0; dims.len()];
    for (d, &n) in digits.iter_mut().zip(&dims).rev() {
        *d = index % n;
        index /= n;
    }
    let k = syst.cut_grid.len();
    Combination {
        cuts: syst
            .cut_grid
            .iter()
            .zip(clauses)
            .zip(&digits)
            .map(|((g, c), &d)| (g.variable.clone(), c[d].clone()))
            .collect(),
        signal: syst.signal_fit_funcs[digits[k]],
        background: syst.bkg_fit_funcs[digits[k + 1]],
    }
}

/// A planned trial: the settings of every bin.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    /// Position in the plan
    pub index: usize,
    /// Per-bin settings
    pub settings: Vec<BinSettings>,
}

/// Trial list plus planning statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialPlan {
    /// Trials to run
    pub trials: Vec<Trial>,
    /// Size of the variation space
    pub n_combinations: usize,
    /// Candidate trials dropped because a bin repeated an earlier combination
    pub n_duplicates: usize,
}

/// Plan the trials of a scan. All randomness is drawn here.
pub fn plan_trials<R: Rng + ?Sized>(
    base: &SpectrumConfig,
    syst: &SystematicsConfig,
    rng: &mut R,
) -> Result<TrialPlan> {
    syst.validate()?;
    let n_bins = base.n_bins();
    let clauses: Vec<Vec<Expr>> = syst.cut_grid.iter().map(CutGrid::clauses).collect();
    let n_combinations = syst
        .dimensions()
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| Error::Config("systematic variation space is too large".into()))?;

    // Candidate trials as per-bin combinations.
    let candidates: Vec<Vec<Combination>> = match syst.mode {
        ScanMode::Mixed => {
            let rows: Vec<Vec<usize>> = if syst.n_trials < n_combinations {
                (0..syst.n_trials)
                    .map(|_| (0..n_bins).map(|_| rng.gen_range(0..n_combinations)).collect())
                    .collect()
            } else {
                log::warn!(
                    "n_trials ({}) >= number of combinations ({n_combinations}), using all of them",
                    syst.n_trials
                );
                let columns: Vec<Vec<usize>> = (0..n_bins)
                    .map(|_| {
                        let mut col: Vec<usize> = (0..n_combinations).collect();
                        col.shuffle(rng);
                        col
                    })
                    .collect();
                (0..n_combinations).map(|t| columns.iter().map(|c| c[t]).collect()).collect()
            };
            rows.into_iter()
                .map(|row| row.into_iter().map(|i| decode(syst, &clauses, i)).collect())
                .collect()
        }
        ScanMode::Separated => separated_candidates(base, syst, &clauses),
    };

    let label = base.variable.label();
    let mut seen = HashSet::new();
    let mut trials = Vec::with_capacity(candidates.len());
    let mut n_duplicates = 0;
    'candidates: for combos in candidates {
        let mut settings = Vec::with_capacity(n_bins);
        for (b, combo) in combos.iter().enumerate() {
            let (lo, hi) = base.bin_range(b);
            if !seen.insert(format!("{label} {lo}_{hi} | {}", combo.describe())) {
                n_duplicates += 1;
                continue 'candidates;
            }
            settings.push(combo.apply(&base.settings[b]));
        }
        trials.push(Trial { index: trials.len(), settings });
    }
    log::info!(
        "planned {} trials ({n_combinations} combinations, {n_duplicates} duplicates skipped)",
        trials.len()
    );
    Ok(TrialPlan { trials, n_combinations, n_duplicates })
}

fn separated_candidates(
    base: &SpectrumConfig,
    syst: &SystematicsConfig,
    clauses: &[Vec<Expr>],
) -> Vec<Vec<Combination>> {
    let n_bins = base.n_bins();
    let nominal = |b: usize| Combination {
        cuts: Vec::new(),
        signal: base.settings[b].signal,
        background: base.settings[b].background,
    };
    let mut out = Vec::new();
    for (g, grid_clauses) in syst.cut_grid.iter().zip(clauses) {
        for clause in grid_clauses {
            out.push(
                (0..n_bins)
                    .map(|b| Combination {
                        cuts: vec![(g.variable.clone(), clause.clone())],
                        ..nominal(b)
                    })
                    .collect(),
            );
        }
    }
    for &signal in &syst.signal_fit_funcs {
        out.push((0..n_bins).map(|b| Combination { signal, ..nominal(b) }).collect());
    }
    for &background in &syst.bkg_fit_funcs {
        out.push((0..n_bins).map(|b| Combination { background, ..nominal(b) }).collect());
    }
    out
}

/// Outcome of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Trial index
    pub index: usize,
    /// Selection per bin
    pub selections: Vec<String>,
    /// Signal shape per bin
    pub signal: Vec<SignalShape>,
    /// Background shape per bin
    pub background: Vec<BackgroundShape>,
    /// Corrected yield per bin (`None` for failed bins)
    pub corrected: Vec<Option<Measurement>>,
    /// Suspect flag per bin
    pub suspect: Vec<bool>,
    /// First parameter of the spectrum fit
    pub fit_parameter: Option<Measurement>,
    /// Spectrum fit probability
    pub fit_probability: Option<f64>,
    /// Error that stopped the whole trial
    pub error: Option<String>,
}

impl TrialRecord {
    fn log_lines(&self, n_trials: usize) -> Vec<String> {
        let mut lines = vec![
            "----------------------------------".to_string(),
            format!("Trial: {} / {n_trials}", self.index),
            format!("{:?}", self.selections),
            format!("{:?}", self.background.iter().map(|b| b.as_str()).collect::<Vec<_>>()),
            format!("{:?}", self.signal.iter().map(|s| s.as_str()).collect::<Vec<_>>()),
        ];
        if let (Some(p), Some(prob)) = (self.fit_parameter, self.fit_probability) {
            lines.push(format!("Integral: {} +- {} Prob: {prob}", p.value, p.error));
        }
        if let Some(e) = &self.error {
            lines.push(format!("Error: {e}"));
        }
        lines
    }
}

/// Systematic estimate of one bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinSystematic {
    /// Bin index
    pub index: usize,
    /// Lower edge
    pub lo: f64,
    /// Upper edge
    pub hi: f64,
    /// Nominal corrected yield with its statistical uncertainty
    pub nominal: Option<Measurement>,
    /// Distribution of the corrected yield over trials
    pub distribution: Histogram1D,
    /// Number of trials entering the distribution
    pub n_entries: usize,
    /// Sample mean of the trial yields
    pub mean: f64,
    /// Sample standard deviation of the trial yields
    pub std_dev: f64,
    /// Centre of the spread (Gaussian mean or sample mean)
    pub mu: Measurement,
    /// Systematic uncertainty (Gaussian width or sample standard deviation)
    pub sigma: Measurement,
    /// `"gaus"`, `"moments"` or `"none"`
    pub method: String,
}

/// Result of [`scan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystematicsResult {
    /// Size of the variation space
    pub n_combinations: usize,
    /// Candidate trials dropped as duplicates
    pub n_duplicates: usize,
    /// Executed trials
    pub trials: Vec<TrialRecord>,
    /// Per-bin systematic estimates
    pub bins: Vec<BinSystematic>,
}

impl SystematicsResult {
    /// Trial log in the order the trials were planned.
    pub fn log_lines(&self) -> Vec<String> {
        self.trials.iter().flat_map(|t| t.log_lines(self.trials.len())).collect()
    }
}

/// Run a scan around `base`, whose nominal extraction is `nominal`.
pub fn scan(
    base: &SpectrumConfig,
    nominal: &SpectrumResult,
    syst: &SystematicsConfig,
    data: &TabularDataset,
    mc_gen: &TabularDataset,
    mc_reco: &TabularDataset,
) -> Result<SystematicsResult> {
    use rand::SeedableRng;
    let mut rng = rand::rngs::StdRng::seed_from_u64(syst.seed);
    let plan = plan_trials(base, syst, &mut rng)?;

    let trials: Vec<TrialRecord> = plan
        .trials
        .par_iter()
        .map(|t| run_trial(base, t, data, mc_gen, mc_reco))
        .collect();
    let n_failed = trials.iter().filter(|t| t.error.is_some()).count();
    if n_failed > 0 {
        log::warn!("{n_failed} of {} trials failed", trials.len());
    }

    let exclude = base.quality.exclude_suspect_from_systematics;
    let bins = (0..base.n_bins())
        .map(|b| {
            let values: Vec<f64> = trials
                .iter()
                .filter(|t| !(exclude && t.suspect[b]))
                .filter_map(|t| t.corrected[b].map(|m| m.value))
                .filter(|v| v.is_finite())
                .collect();
            aggregate_bin(base, b, nominal.corrected_yield(b), &values)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(SystematicsResult {
        n_combinations: plan.n_combinations,
        n_duplicates: plan.n_duplicates,
        trials,
        bins,
    })
}

fn run_trial(
    base: &SpectrumConfig,
    trial: &Trial,
    data: &TabularDataset,
    mc_gen: &TabularDataset,
    mc_reco: &TabularDataset,
) -> TrialRecord {
    let n_bins = trial.settings.len();
    let mut record = TrialRecord {
        index: trial.index,
        selections: trial.settings.iter().map(BinSettings::selection_string).collect(),
        signal: trial.settings.iter().map(|s| s.signal).collect(),
        background: trial.settings.iter().map(|s| s.background).collect(),
        corrected: vec![None; n_bins],
        suspect: vec![false; n_bins],
        fit_parameter: None,
        fit_probability: None,
        error: None,
    };
    let result = base
        .clone()
        .with_bin_settings(trial.settings.clone())
        .and_then(|cfg| build(&cfg, data, mc_gen, mc_reco));
    match result {
        Ok(spectrum) => {
            for (b, outcome) in spectrum.bins.iter().enumerate() {
                if let Some(r) = outcome.result() {
                    record.corrected[b] = Some(r.corrected_yield);
                    record.suspect[b] = r.suspect;
                }
            }
            if let Some(fit) = &spectrum.spectrum_fit {
                record.fit_parameter = Some(Measurement::new(fit.parameters[0], fit.errors[0]));
                record.fit_probability = Some(fit.probability);
            }
        }
        Err(e) => {
            log::warn!("trial {} failed: {e}", trial.index);
            record.error = Some(e.to_string());
        }
    }
    record
}

fn aggregate_bin(
    base: &SpectrumConfig,
    b: usize,
    nominal: Option<Measurement>,
    values: &[f64],
) -> Result<BinSystematic> {
    let (lo, hi) = base.bin_range(b);
    let n = values.len();
    let mean = if n > 0 { values.iter().sum::<f64>() / n as f64 } else { f64::NAN };
    let std_dev = if n > 1 {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
    } else {
        0.0
    };

    let (h_lo, h_hi) = match nominal {
        Some(m) if m.value > 0.0 => (0.5 * m.value, 1.5 * m.value),
        _ => {
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if n == 0 {
                (0.0, 1.0)
            } else if max > min {
                (min, max + 1e-9 * (max - min))
            } else {
                let half = 0.5 * min.abs().max(1e-12);
                (min - half, min + half)
            }
        }
    };
    let label = base.variable.label();
    let mut distribution = Histogram1D::uniform(
        format!("h_{label}_syst_{b}"),
        format!("{label} [{lo}, {hi});corrected yield;trials"),
        DISTRIBUTION_BINS,
        h_lo,
        h_hi,
    )?;
    distribution.fill_all(values);

    let populated = distribution.bin_content.iter().filter(|&&c| c > 0.0).count();
    let moments = (
        Measurement::new(mean, if n > 0 { std_dev / (n as f64).sqrt() } else { 0.0 }),
        Measurement::new(std_dev, if n > 1 { std_dev / (2.0 * (n - 1) as f64).sqrt() } else { 0.0 }),
    );
    let (mu, sigma, method) = if n == 0 {
        (Measurement::default(), Measurement::default(), "none")
    } else if populated < 3 {
        (moments.0, moments.1, "moments")
    } else {
        match fit_histogram(&distribution, &GaussianCurve, &CurveFitOptions::default()) {
            Ok(fit) => (
                Measurement::new(fit.parameters[1], fit.errors[1]),
                Measurement::new(fit.parameters[2].abs(), fit.errors[2]),
                "gaus",
            ),
            Err(e) => {
                log::warn!("{label} bin {b}: gaussian fit of the yield distribution failed ({e})");
                (moments.0, moments.1, "moments")
            }
        }
    };
    log::info!("{label} [{lo}, {hi}): systematic sigma = {sigma} from {n} trials ({method})");

    Ok(BinSystematic {
        index: b,
        lo,
        hi,
        nominal,
        distribution,
        n_entries: n,
        mean,
        std_dev,
        mu,
        sigma,
        method: method.to_string(),
    })
}
