//! Input preparation and the two analysis pipelines.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hs_data::{Expr, TabularDataset};
use hs_fit::{FittedMassModel, MassFitModel};
use hs_spectra::{
    Capabilities, REJECTION_FLAG, SpectrumResult, SystematicsResult, add_rejection_flag, annotate,
    build, scan,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

use crate::config::{InputPlan, MassFitPlan, SpectrumPlan};

/// Bookkeeping of the input preparation, echoed in the result file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InputSummary {
    pub data_files: Vec<PathBuf>,
    pub mc_files: Vec<PathBuf>,
    pub data_capabilities: Option<Capabilities>,
    pub mc_capabilities: Option<Capabilities>,
    pub n_data: usize,
    pub n_mc_generated: usize,
    pub n_mc_reconstructed: usize,
    /// Rows kept by the reweighting, out of the rows sampled
    pub reweight_accepted: Option<(usize, usize)>,
}

pub struct SpectrumOutcome {
    pub inputs: InputSummary,
    pub spectrum: SpectrumResult,
    pub systematics: Option<SystematicsResult>,
}

pub struct MassFitOutcome {
    pub inputs: InputSummary,
    pub n_candidates: usize,
    pub fitted: FittedMassModel,
}

fn load_tables(paths: &[PathBuf]) -> Result<TabularDataset> {
    let mut out: Option<TabularDataset> = None;
    for path in paths {
        tracing::info!(path = %path.display(), "loading candidates");
        let ds = hs_data::io::read_dataset(path, None)
            .with_context(|| format!("failed to load {}", path.display()))?;
        match &mut out {
            None => out = Some(ds),
            Some(acc) => acc
                .append(&ds)
                .with_context(|| format!("{} does not match the previous inputs", path.display()))?,
        }
    }
    out.with_context(|| "no input files".to_string())
}

fn apply(ds: TabularDataset, cut: Option<&Expr>, what: &str) -> Result<TabularDataset> {
    match cut {
        None => Ok(ds),
        Some(expr) => {
            let before = ds.count();
            let kept = ds.filter(expr).with_context(|| format!("{what}: {expr}"))?;
            tracing::info!(cut = %expr, before, after = kept.count(), "{what}");
            Ok(kept)
        }
    }
}

/// Load, annotate and preselect the data table.
fn prepare_data(plan: &InputPlan, summary: &mut InputSummary) -> Result<TabularDataset> {
    let mut data = load_tables(&plan.data)?;
    summary.data_files = plan.data.clone();
    summary.data_capabilities = Some(annotate(&mut data, &plan.annotate).context("data")?);
    let data = apply(data, plan.matter.data_predicate().as_ref(), "matter selection (data)")?;
    let data = apply(data, plan.preselection.as_ref(), "preselection (data)")?;
    summary.n_data = data.count();
    Ok(data)
}

/// Load and annotate the simulated table, then apply the matter selection.
fn prepare_mc(plan: &InputPlan, summary: &mut InputSummary) -> Result<TabularDataset> {
    let mut mc = load_tables(&plan.mc)?;
    summary.mc_files = plan.mc.clone();
    let options = hs_spectra::AnnotateOptions { is_mc: true, ..plan.annotate };
    summary.mc_capabilities = Some(annotate(&mut mc, &options).context("mc")?);
    apply(mc, plan.matter.mc_predicate().as_ref(), "matter selection (mc)")
}

fn reconstructed(mc: &TabularDataset) -> Result<TabularDataset> {
    mc.filter(&Expr::col("fIsReco").equals(1.0)).context("selecting reconstructed MC")
}

pub fn run_spectrum(plan: &SpectrumPlan) -> Result<SpectrumOutcome> {
    let mut inputs = InputSummary::default();
    let data = prepare_data(&plan.inputs, &mut inputs)?;
    let mut mc = prepare_mc(&plan.inputs, &mut inputs)?;

    if let Some(rw) = &plan.reweight {
        let mut rng = StdRng::seed_from_u64(plan.seed);
        let total = mc.count();
        let accepted = add_rejection_flag(&mut mc, &rw.variable, rw.reference.as_ref(), &mut rng)?;
        tracing::info!(variable = %rw.variable, accepted, total, "reweighted MC");
        inputs.reweight_accepted = Some((accepted, total));
        mc = mc.filter(&Expr::col(REJECTION_FLAG).equals(1.0))?;
    }
    let mc = apply(mc, plan.inputs.mc_preselection.as_ref(), "preselection (mc)")?;
    let mc_reco = reconstructed(&mc)?;
    inputs.n_mc_generated = mc.count();
    inputs.n_mc_reconstructed = mc_reco.count();

    tracing::info!(
        variable = plan.spectrum.variable.label(),
        bins = plan.spectrum.n_bins(),
        data = inputs.n_data,
        mc_generated = inputs.n_mc_generated,
        mc_reconstructed = inputs.n_mc_reconstructed,
        "extracting spectrum"
    );
    let spectrum = build(&plan.spectrum, &data, &mc, &mc_reco)?;
    for line in spectrum.log_lines() {
        tracing::info!("{line}");
    }
    if spectrum.n_failed() > 0 {
        tracing::warn!(failed = spectrum.n_failed(), "some bins could not be extracted");
    }

    let systematics = match &plan.systematics {
        Some(syst) => {
            tracing::info!(mode = ?syst.mode, n_trials = syst.n_trials, "running systematic scan");
            Some(scan(&plan.spectrum, &spectrum, syst, &data, &mc, &mc_reco)?)
        }
        None => None,
    };

    Ok(SpectrumOutcome { inputs, spectrum, systematics })
}

pub fn run_mass_fit(plan: &MassFitPlan) -> Result<MassFitOutcome> {
    let mut inputs = InputSummary::default();
    let data = prepare_data(&plan.inputs, &mut inputs)?;
    let selected = apply(data, Some(&plan.selection), "selection (data)")?;
    let masses = selected.column(&plan.mass_column)?;

    let mut model = MassFitModel::new(plan.mass_fit.clone())?;
    if !plan.inputs.mc.is_empty() {
        let mc = prepare_mc(&plan.inputs, &mut inputs)?;
        let mc = apply(mc, plan.inputs.mc_preselection.as_ref(), "preselection (mc)")?;
        let mc_reco = apply(reconstructed(&mc)?, Some(&plan.selection), "selection (mc)")?;
        inputs.n_mc_generated = mc.count();
        inputs.n_mc_reconstructed = mc_reco.count();
        model = model.prefit_signal(mc_reco.column(&plan.mass_column)?)?;
    }
    let fitted = model.fit(masses)?;
    tracing::info!("{}", fitted.summary());
    Ok(MassFitOutcome { inputs, n_candidates: masses.len(), fitted })
}

/// Directory of the config file, against which relative paths resolve.
pub fn config_dir(config: &Path) -> PathBuf {
    match config.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
