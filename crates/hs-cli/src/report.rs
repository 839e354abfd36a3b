//! Result files: pretty JSON and the plain-text run log.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hs_core::FitResult;
use hs_fit::{FitFrame, PrefitSummary, SignalReport};
use hs_spectra::{SpectrumConfig, SpectrumResult, SystematicsConfig, SystematicsResult};
use serde::Serialize;

use crate::pipeline::{InputSummary, MassFitOutcome, SpectrumOutcome};

#[derive(Serialize)]
struct SpectrumReport<'a> {
    tool: &'static str,
    version: &'static str,
    command: &'static str,
    seed: u64,
    config: &'a SpectrumConfig,
    systematics_config: Option<&'a SystematicsConfig>,
    inputs: &'a InputSummary,
    n_failed_bins: usize,
    spectrum: &'a SpectrumResult,
    systematics: Option<&'a SystematicsResult>,
}

#[derive(Serialize)]
struct MassFitReport<'a> {
    tool: &'static str,
    version: &'static str,
    command: &'static str,
    inputs: &'a InputSummary,
    n_candidates: usize,
    summary: String,
    report: &'a SignalReport,
    fit: &'a FitResult,
    prefit: Option<&'a PrefitSummary>,
    frame: &'a FitFrame,
}

pub fn spectrum_json(
    config: &SpectrumConfig,
    systematics: Option<&SystematicsConfig>,
    seed: u64,
    outcome: &SpectrumOutcome,
) -> Result<serde_json::Value> {
    let report = SpectrumReport {
        tool: "hyperspec",
        version: env!("CARGO_PKG_VERSION"),
        command: "spectrum",
        seed,
        config,
        systematics_config: systematics,
        inputs: &outcome.inputs,
        n_failed_bins: outcome.spectrum.n_failed(),
        spectrum: &outcome.spectrum,
        systematics: outcome.systematics.as_ref(),
    };
    Ok(serde_json::to_value(report)?)
}

pub fn mass_fit_json(outcome: &MassFitOutcome) -> Result<serde_json::Value> {
    let report = MassFitReport {
        tool: "hyperspec",
        version: env!("CARGO_PKG_VERSION"),
        command: "mass-fit",
        inputs: &outcome.inputs,
        n_candidates: outcome.n_candidates,
        summary: outcome.fitted.summary(),
        report: outcome.fitted.report(),
        fit: outcome.fitted.fit_result(),
        prefit: outcome.fitted.prefit(),
        frame: outcome.fitted.frame(),
    };
    Ok(serde_json::to_value(report)?)
}

/// Per-bin lines, the spectrum fit and the systematic trial log.
pub fn spectrum_log(outcome: &SpectrumOutcome) -> Vec<String> {
    let spectrum = &outcome.spectrum;
    let mut lines = vec![format!(
        "hyperspec {} spectrum in {} ({} bins, {} failed)",
        env!("CARGO_PKG_VERSION"),
        spectrum.variable.label(),
        spectrum.bins.len(),
        spectrum.n_failed()
    )];
    lines.extend(spectrum.log_lines());
    match (&spectrum.spectrum_fit, &spectrum.spectrum_fit_error) {
        (Some(fit), _) => {
            let params: Vec<String> = fit
                .names
                .iter()
                .zip(&fit.parameters)
                .zip(&fit.errors)
                .map(|((n, v), e)| format!("{n} = {v} +- {e}"))
                .collect();
            lines.push(format!(
                "{} fit: {} chi2/ndf = {:.3}/{} prob = {:.3}",
                fit.shape,
                params.join(", "),
                fit.chi2,
                fit.ndf,
                fit.probability
            ));
        }
        (None, Some(e)) => lines.push(format!("spectrum fit failed: {e}")),
        (None, None) => {}
    }
    if let Some(syst) = &outcome.systematics {
        lines.push(format!(
            "systematics: {} trials ({} combinations, {} duplicates skipped)",
            syst.trials.len(),
            syst.n_combinations,
            syst.n_duplicates
        ));
        for b in &syst.bins {
            lines.push(format!(
                "[{}, {}): mu = {}, sigma = {} ({}, {} entries)",
                b.lo, b.hi, b.mu, b.sigma, b.method, b.n_entries
            ));
        }
        lines.extend(syst.log_lines());
    }
    lines
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}

pub fn write_json(output: Option<&PathBuf>, value: &serde_json::Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    if let Some(path) = output {
        ensure_parent(path)?;
        std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote result");
    } else {
        println!("{text}");
    }
    Ok(())
}

pub fn write_log(path: &Path, lines: &[String]) -> Result<()> {
    ensure_parent(path)?;
    let mut text = lines.join("\n");
    text.push('\n');
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "wrote log");
    Ok(())
}
