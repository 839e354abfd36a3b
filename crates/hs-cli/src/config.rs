//! Run configuration (YAML) parsing and semantic validation.
//!
//! A single file drives both subcommands. Everything that can be checked
//! without touching the candidate tables is checked here, so a bad file
//! fails before any input is loaded or any output is written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hs_data::{Expr, Histogram1D};
use hs_fit::{BackgroundShape, MassFitConfig, SignalShape, YieldMode};
use hs_spectra::shapes::HYPERTRITON_MASS;
use hs_spectra::{
    AnnotateOptions, BinSettings, CurveReference, EfficiencyUncertainty, HistogramReference,
    MatterSelection, QualityCriteria, ReferenceShape, SpectrumConfig, SpectrumFitConfig,
    SpectrumShape, SystematicsConfig, Variable,
};
use serde::{Deserialize, Serialize};

/// One input file or a list of files read in order and concatenated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputFiles {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

impl InputFiles {
    fn resolve(&self, base_dir: &Path) -> Vec<PathBuf> {
        match self {
            InputFiles::One(p) => vec![resolve_path(base_dir, p)],
            InputFiles::Many(ps) => ps.iter().map(|p| resolve_path(base_dir, p)).collect(),
        }
    }
}

/// `{variable: clause}` shared by every bin, or one such map per bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectionSpec {
    Shared(BTreeMap<String, String>),
    PerBin(Vec<BTreeMap<String, String>>),
}

impl Default for SelectionSpec {
    fn default() -> Self {
        SelectionSpec::Shared(BTreeMap::new())
    }
}

/// A named histogram inside a JSON file of `{name: histogram}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistogramRef {
    pub path: PathBuf,
    pub name: String,
}

/// Reference shape of the MC reweighting: a parametric curve or a histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReweightSpec {
    /// Column sampled against the reference (default: generated column of `variable`)
    #[serde(default)]
    pub variable: Option<String>,
    #[serde(default)]
    pub shape: Option<SpectrumShape>,
    #[serde(default)]
    pub params: Vec<f64>,
    #[serde(default)]
    pub range: Option<(f64, f64)>,
    #[serde(default = "default_mass")]
    pub mass: f64,
    #[serde(default)]
    pub histogram: Option<HistogramRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub input_data: InputFiles,
    #[serde(default)]
    pub input_mc: Option<InputFiles>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_output_file")]
    pub output_file: String,

    #[serde(default)]
    pub variable: Option<Variable>,
    #[serde(default)]
    pub bins: Vec<f64>,
    #[serde(default)]
    pub selection: SelectionSpec,
    /// Extra cut on data candidates, applied after the matter selection
    #[serde(default)]
    pub preselection: Option<String>,
    /// Extra cut on simulated candidates, applied after reweighting
    #[serde(default)]
    pub mc_preselection: Option<String>,
    #[serde(default)]
    pub is_matter: MatterSelection,
    #[serde(default)]
    pub calibrate_he_momentum: bool,
    #[serde(default)]
    pub alt_mass_hypothesis: bool,
    #[serde(default)]
    pub mass_column: Option<String>,

    #[serde(default)]
    pub n_events: Option<f64>,
    #[serde(default)]
    pub event_histogram: Option<HistogramRef>,
    #[serde(default = "default_branching_ratio")]
    pub branching_ratio: f64,
    #[serde(default = "default_delta_rapidity")]
    pub delta_rapidity: f64,

    #[serde(default)]
    pub signal_fit_func: Option<SignalShape>,
    #[serde(default)]
    pub bkg_fit_func: Option<BackgroundShape>,
    #[serde(default)]
    pub yield_mode: Option<YieldMode>,
    /// Full mass-fit settings; the three keys above override its shapes
    #[serde(default)]
    pub mass_fit: Option<MassFitConfig>,

    #[serde(default)]
    pub reweight: Option<ReweightSpec>,
    #[serde(default)]
    pub spectrum_fit: Option<SpectrumFitConfig>,
    #[serde(default)]
    pub efficiency_uncertainty: EfficiencyUncertainty,
    #[serde(default)]
    pub quality: QualityCriteria,
    /// Seeds the reweighting and the systematic trial planning
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub systematics: Option<SystematicsConfig>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_output_file() -> String {
    "hyperspec_results".to_string()
}

fn default_branching_ratio() -> f64 {
    0.25
}

fn default_delta_rapidity() -> f64 {
    2.0
}

fn default_seed() -> u64 {
    42
}

fn default_mass() -> f64 {
    HYPERTRITON_MASS
}

pub fn read_run_config(path: &Path) -> Result<RunConfig> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read config {}", path.display()))?;
    let cfg: RunConfig = serde_yaml_ng::from_slice(&bytes)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Resolved MC reweighting.
pub struct Reweighting {
    pub variable: String,
    pub reference: Box<dyn ReferenceShape>,
}

/// Input files and per-table preparation shared by both subcommands.
pub struct InputPlan {
    pub data: Vec<PathBuf>,
    pub mc: Vec<PathBuf>,
    pub annotate: AnnotateOptions,
    pub matter: MatterSelection,
    pub preselection: Option<Expr>,
    pub mc_preselection: Option<Expr>,
}

/// Everything `hyperspec spectrum` needs, validated.
pub struct SpectrumPlan {
    pub inputs: InputPlan,
    pub spectrum: SpectrumConfig,
    pub reweight: Option<Reweighting>,
    pub systematics: Option<SystematicsConfig>,
    pub seed: u64,
    pub output_json: PathBuf,
    pub output_log: PathBuf,
}

/// Everything `hyperspec mass-fit` needs, validated.
pub struct MassFitPlan {
    pub inputs: InputPlan,
    pub mass_column: String,
    pub selection: Expr,
    pub mass_fit: MassFitConfig,
}

impl RunConfig {
    fn input_plan(&self, base_dir: &Path) -> Result<InputPlan> {
        let data = self.input_data.resolve(base_dir);
        if data.is_empty() {
            anyhow::bail!("input_data must name at least one file");
        }
        let mc = self.input_mc.as_ref().map(|f| f.resolve(base_dir)).unwrap_or_default();
        Ok(InputPlan {
            data,
            mc,
            annotate: AnnotateOptions {
                calibrate_momentum: self.calibrate_he_momentum,
                is_mc: false,
                alt_mass_hypothesis: self.alt_mass_hypothesis,
                ..AnnotateOptions::default()
            },
            matter: self.is_matter,
            preselection: parse_optional("preselection", self.preselection.as_deref())?,
            mc_preselection: parse_optional("mc_preselection", self.mc_preselection.as_deref())?,
        })
    }

    fn mass_fit_config(&self) -> MassFitConfig {
        let mut cfg = self.mass_fit.clone().unwrap_or_default();
        if let Some(s) = self.signal_fit_func {
            cfg.signal = s;
        }
        if let Some(b) = self.bkg_fit_func {
            cfg.background = b;
        }
        if let Some(y) = self.yield_mode {
            cfg.yield_mode = y;
        }
        cfg
    }

    fn mass_column(&self) -> String {
        match (&self.mass_column, self.alt_mass_hypothesis) {
            (Some(c), _) => c.clone(),
            (None, true) => "fMassH4L".to_string(),
            (None, false) => "fMassH3L".to_string(),
        }
    }

    fn bin_settings(&self, n_bins: usize, mass_fit: &MassFitConfig) -> Result<Vec<BinSettings>> {
        let maps: Vec<&BTreeMap<String, String>> = match &self.selection {
            SelectionSpec::Shared(map) => vec![map; n_bins],
            SelectionSpec::PerBin(list) => {
                if list.len() != n_bins {
                    anyhow::bail!(
                        "selection lists {} per-bin maps but there are {n_bins} bins",
                        list.len()
                    );
                }
                list.iter().collect()
            }
        };
        maps.into_iter()
            .enumerate()
            .map(|(i, map)| {
                let selection = parse_selection(map).with_context(|| format!("selection of bin {i}"))?;
                Ok(BinSettings {
                    selection,
                    signal: mass_fit.signal,
                    background: mass_fit.background,
                })
            })
            .collect()
    }

    fn n_events(&self, base_dir: &Path, variable: Variable) -> Result<f64> {
        match (self.n_events, &self.event_histogram) {
            (Some(_), Some(_)) => anyhow::bail!("set either n_events or event_histogram, not both"),
            (Some(n), None) => Ok(n),
            (None, Some(h)) => {
                let hist = load_histogram(base_dir, h)?;
                Ok(hist.total())
            }
            (None, None) if variable == Variable::Pt => {
                anyhow::bail!("pt spectra need n_events or event_histogram")
            }
            (None, None) => Ok(1.0),
        }
    }

    fn reweighting(&self, base_dir: &Path, variable: Variable) -> Result<Option<Reweighting>> {
        let Some(spec) = &self.reweight else {
            return Ok(None);
        };
        let column = spec.variable.clone().unwrap_or_else(|| variable.gen_column().to_string());
        let reference: Box<dyn ReferenceShape> = match (&spec.shape, &spec.histogram) {
            (Some(shape), None) => {
                let Some(range) = spec.range else {
                    anyhow::bail!("reweight.range is required with reweight.shape");
                };
                Box::new(CurveReference::new(shape.curve(spec.mass), spec.params.clone(), range)?)
            }
            (None, Some(h)) => Box::new(HistogramReference::new(load_histogram(base_dir, h)?)?),
            _ => anyhow::bail!("reweight needs exactly one of 'shape' or 'histogram'"),
        };
        Ok(Some(Reweighting { variable: column, reference }))
    }

    /// Validate for `hyperspec spectrum`.
    pub fn spectrum_plan(&self, base_dir: &Path) -> Result<SpectrumPlan> {
        let inputs = self.input_plan(base_dir)?;
        if inputs.mc.is_empty() {
            anyhow::bail!("input_mc is required for spectrum extraction");
        }
        let Some(variable) = self.variable else {
            anyhow::bail!("variable (ct or pt) is required for spectrum extraction");
        };
        hs_data::validate_edges(&self.bins).context("bins")?;
        let n_bins = self.bins.len() - 1;

        let mass_fit = self.mass_fit_config();
        let settings = self.bin_settings(n_bins, &mass_fit)?;
        let mut spectrum = SpectrumConfig::new(variable, self.bins.clone(), settings[0].clone())?
            .with_bin_settings(settings)?;
        spectrum.mass_column = self.mass_column();
        spectrum.n_events = self.n_events(base_dir, variable)?;
        spectrum.branching_ratio = self.branching_ratio;
        spectrum.delta_rapidity = self.delta_rapidity;
        spectrum.mass_fit = mass_fit;
        spectrum.efficiency_uncertainty = self.efficiency_uncertainty;
        spectrum.quality = self.quality;
        if let Some(fit) = &self.spectrum_fit {
            check_spectrum_fit(fit)?;
        }
        spectrum.spectrum_fit = self.spectrum_fit.clone();
        spectrum.validate()?;

        let systematics = match &self.systematics {
            Some(s) => {
                let mut s = s.clone();
                s.seed = self.seed;
                s.validate()?;
                Some(s)
            }
            None => None,
        };

        let out_dir = resolve_path(base_dir, &self.output_dir);
        if self.output_file.is_empty() {
            anyhow::bail!("output_file cannot be empty");
        }
        Ok(SpectrumPlan {
            inputs,
            reweight: self.reweighting(base_dir, variable)?,
            spectrum,
            systematics,
            seed: self.seed,
            output_json: out_dir.join(format!("{}.json", self.output_file)),
            output_log: out_dir.join(format!("{}.txt", self.output_file)),
        })
    }

    /// Validate for `hyperspec mass-fit`.
    pub fn mass_fit_plan(&self, base_dir: &Path) -> Result<MassFitPlan> {
        let inputs = self.input_plan(base_dir)?;
        let selection = match &self.selection {
            SelectionSpec::Shared(map) => Expr::all(parse_selection(map)?.into_values()),
            SelectionSpec::PerBin(_) => {
                anyhow::bail!("mass-fit takes a single selection map, not a per-bin list")
            }
        };
        let mass_fit = self.mass_fit_config();
        mass_fit.validate()?;
        Ok(MassFitPlan { inputs, mass_column: self.mass_column(), selection, mass_fit })
    }
}

fn parse_selection(map: &BTreeMap<String, String>) -> Result<BTreeMap<String, Expr>> {
    map.iter()
        .map(|(var, clause)| {
            let expr = Expr::parse(clause)
                .with_context(|| format!("cannot parse selection for '{var}': {clause:?}"))?;
            Ok((var.clone(), expr))
        })
        .collect()
}

fn parse_optional(key: &str, clause: Option<&str>) -> Result<Option<Expr>> {
    clause
        .map(|c| Expr::parse(c).with_context(|| format!("cannot parse {key}: {c:?}")))
        .transpose()
}

fn check_spectrum_fit(fit: &SpectrumFitConfig) -> Result<()> {
    let names = fit.shape.curve(fit.mass).parameter_names();
    for key in fit.options.fixed.keys().chain(fit.options.init.keys()) {
        if !names.contains(key) {
            anyhow::bail!(
                "spectrum_fit: '{}' has no parameter '{key}' (parameters: {})",
                fit.shape,
                names.join(", ")
            );
        }
    }
    if let Some((lo, hi)) = fit.options.range {
        if !(lo < hi) {
            anyhow::bail!("spectrum_fit.range must satisfy lo < hi, got [{lo}, {hi}]");
        }
    }
    Ok(())
}

/// Read histogram `name` from a JSON file mapping names to histograms.
pub fn load_histogram(base_dir: &Path, h: &HistogramRef) -> Result<Histogram1D> {
    let path = resolve_path(base_dir, &h.path);
    let bytes = std::fs::read(&path)
        .with_context(|| format!("failed to read histogram file {}", path.display()))?;
    let mut hists: BTreeMap<String, Histogram1D> = serde_json::from_slice(&bytes)
        .with_context(|| format!("{} is not a JSON map of histograms", path.display()))?;
    hists
        .remove(&h.name)
        .with_context(|| format!("histogram '{}' not found in {}", h.name, path.display()))
}

fn resolve_path(base_dir: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() { p.to_path_buf() } else { base_dir.join(p) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> RunConfig {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    const BASE: &str = r#"
input_data: data.json
input_mc: [mc_a.json, mc_b.json]
variable: ct
bins: [1, 2, 4, 7]
selection:
  fCosPA: "fCosPA > 0.999"
  fNSigmaHe: "abs(fNSigmaHe) < 3"
"#;

    #[test]
    fn test_defaults_and_paths() {
        let cfg = parse(BASE);
        assert_eq!(cfg.is_matter, MatterSelection::Both);
        assert_eq!(cfg.seed, 42);
        let plan = cfg.spectrum_plan(Path::new("/cfg")).unwrap();
        assert_eq!(plan.inputs.data, vec![PathBuf::from("/cfg/data.json")]);
        assert_eq!(plan.inputs.mc.len(), 2);
        assert_eq!(plan.output_json, PathBuf::from("/cfg/./hyperspec_results.json"));
        assert_eq!(plan.spectrum.n_bins(), 3);
        assert_eq!(plan.spectrum.settings[2].selection.len(), 2);
        assert_eq!(plan.spectrum.n_events, 1.0);
        assert_eq!(plan.spectrum.mass_column, "fMassH3L");
    }

    #[test]
    fn test_shape_overrides_reach_every_bin() {
        let cfg = parse(&format!("{BASE}signal_fit_func: gaus\nbkg_fit_func: pol2\nyield_mode: extended\n"));
        let plan = cfg.spectrum_plan(Path::new(".")).unwrap();
        assert!(plan.spectrum.settings.iter().all(|s| s.signal == SignalShape::Gaus));
        assert!(plan.spectrum.settings.iter().all(|s| s.background == BackgroundShape::Pol2));
        assert_eq!(plan.spectrum.mass_fit.yield_mode, YieldMode::Extended);
    }

    #[test]
    fn test_semantic_errors() {
        let shared = "selection:\n  fCosPA: \"fCosPA > 0.999\"\n  fNSigmaHe: \"abs(fNSigmaHe) < 3\"\n";
        assert!(BASE.contains(shared));
        let cases = [
            BASE.replace(shared, "selection:\n  - {fCt: \"fCt > 1\"}\n"),
            BASE.replace("fCosPA > 0.999", "fCosPA >"),
            BASE.replace("[1, 2, 4, 7]", "[1, 4, 2]"),
            BASE.replace("variable: ct", "variable: pt"),
            BASE.replace("input_mc: [mc_a.json, mc_b.json]\n", ""),
            format!("{BASE}n_events: 10\nevent_histogram: {{path: ev.json, name: hZvtx}}\n"),
            format!("{BASE}spectrum_fit: {{shape: expo_ct, fixed: {{lambda: 1.0}}}}\n"),
            format!("{BASE}reweight: {{shape: levy_tsallis, params: [1, 10, 0.3]}}\n"),
            format!("{BASE}reweight: {{shape: levy_tsallis, params: [1, 10], range: [0, 10]}}\n"),
            format!("{BASE}systematics: {{cut_grid: [{{variable: fCosPA, greater: true, range: [0.99, 0.999, 0]}}]}}\n"),
        ];
        for yaml in &cases {
            let cfg: RunConfig = serde_yaml_ng::from_str(yaml).unwrap();
            assert!(cfg.spectrum_plan(Path::new(".")).is_err(), "accepted:\n{yaml}");
        }
    }

    #[test]
    fn test_unknown_keys_and_values_fail_to_parse() {
        assert!(serde_yaml_ng::from_str::<RunConfig>(&format!("{BASE}is_matter: neither\n")).is_err());
        assert!(serde_yaml_ng::from_str::<RunConfig>(&format!("{BASE}signal_fit_func: cb\n")).is_err());
        assert!(serde_yaml_ng::from_str::<RunConfig>(&format!("{BASE}n_trails: 3\n")).is_err());
    }

    #[test]
    fn test_reweight_curve_and_systematics_seed() {
        let yaml = format!(
            "{BASE}seed: 7\nreweight: {{shape: expo_ct, params: [1, 250, 1, 7], range: [1, 7]}}\nsystematics: {{n_trials: 5, seed: 99}}\n"
        );
        let plan = parse(&yaml).spectrum_plan(Path::new(".")).unwrap();
        let rw = plan.reweight.unwrap();
        assert_eq!(rw.variable, "fGenCt");
        assert!(rw.reference.maximum() > 0.0);
        assert_eq!(plan.systematics.unwrap().seed, 7);
    }

    #[test]
    fn test_mass_fit_plan() {
        let cfg = parse("input_data: d.json\nalt_mass_hypothesis: true\nselection: {fCt: \"fCt > 2\"}\n");
        let plan = cfg.mass_fit_plan(Path::new(".")).unwrap();
        assert_eq!(plan.mass_column, "fMassH4L");
        assert_eq!(plan.selection.to_string(), "fCt > 2");
        assert!(plan.inputs.annotate.alt_mass_hypothesis);
    }
}
