use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

const HE3_MASS: f64 = 2.80839160743;
const PION_MASS: f64 = 0.13957039;
const PEAK: (f64, f64) = (2.991, 0.0015);

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hyperspec"))
}

fn tmp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("hyperspec_cli_{}_{}_{}", std::process::id(), nanos, name));
    std::fs::create_dir_all(&p).unwrap();
    p
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

/// (pt, eta, phi) of a three-momentum.
fn polar(p: [f64; 3]) -> (f64, f64, f64) {
    let pt = p[0].hypot(p[1]);
    (pt, (p[2] / pt).asinh(), p[1].atan2(p[0]))
}

/// Raw columns of a ³He + π decay of a parent of `mass` flying transversely
/// with `pt` along `phi`, decaying after proper length `ct` (cm).
fn two_body(rng: &mut StdRng, mass: f64, pt: f64, phi: f64, ct: f64) -> [f64; 9] {
    let (m1, m2) = (HE3_MASS, PION_MASS);
    let pstar = ((mass * mass - (m1 + m2).powi(2)) * (mass * mass - (m1 - m2).powi(2))).sqrt()
        / (2.0 * mass);
    let cos_t: f64 = rng.gen_range(-1.0..1.0);
    let sin_t = (1.0 - cos_t * cos_t).sqrt();
    let phi_s: f64 = rng.gen_range(0.0..2.0 * PI);
    let dir = [sin_t * phi_s.cos(), sin_t * phi_s.sin(), cos_t];

    let n = [phi.cos(), phi.sin(), 0.0];
    let energy = (pt * pt + mass * mass).sqrt();
    let (beta, gamma) = (pt / energy, energy / mass);
    let boost = |p: [f64; 3], e: f64| -> [f64; 3] {
        let par = p[0] * n[0] + p[1] * n[1] + p[2] * n[2];
        let shift = gamma * (par + beta * e) - par;
        [p[0] + shift * n[0], p[1] + shift * n[1], p[2] + shift * n[2]]
    };
    let he = boost(dir.map(|d| pstar * d), (pstar * pstar + m1 * m1).sqrt());
    let pi = boost(dir.map(|d| -pstar * d), (pstar * pstar + m2 * m2).sqrt());
    let (he_pt, he_eta, he_phi) = polar(he);
    let (pi_pt, pi_eta, pi_phi) = polar(pi);

    let decay_length = ct * pt / mass;
    [
        he_pt,
        he_eta,
        he_phi,
        pi_pt,
        pi_eta,
        pi_phi,
        decay_length * n[0],
        decay_length * n[1],
        0.0,
    ]
}

const RAW: [&str; 9] = [
    "fPtHe3", "fEtaHe3", "fPhiHe3", "fPtPi", "fEtaPi", "fPhiPi", "fXDecVtx", "fYDecVtx", "fZDecVtx",
];

fn push_raw(cols: &mut BTreeMap<String, Vec<f64>>, raw: [f64; 9]) {
    for (name, v) in RAW.iter().zip(raw) {
        cols.entry(name.to_string()).or_default().push(v);
    }
}

/// Data: pT in [1, 3], 25% signal on a flat background in [2.96, 3.04].
fn write_data(path: &Path, n: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let peak = Normal::new(PEAK.0, PEAK.1).unwrap();
    let mut cols = BTreeMap::new();
    for _ in 0..n {
        let mass =
            if rng.r#gen::<f64>() < 0.25 { peak.sample(&mut rng) } else { rng.gen_range(2.96..3.04) };
        let pt = rng.gen_range(1.0..3.0);
        let phi = rng.gen_range(-PI..PI);
        let ct = rng.gen_range(1.0..20.0);
        push_raw(&mut cols, two_body(&mut rng, mass, pt, phi, ct));
        let matter = if rng.r#gen::<bool>() { 1.0 } else { 0.0 };
        cols.entry("fIsMatter".to_string()).or_default().push(matter);
    }
    std::fs::write(path, serde_json::to_vec(&cols).unwrap()).unwrap();
}

/// Signal MC: generated pT in [0.5, 3.5], half of it reconstructed.
fn write_mc(path: &Path, n: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let peak = Normal::new(PEAK.0, PEAK.1).unwrap();
    let mut cols: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for _ in 0..n {
        let mass = peak.sample(&mut rng);
        let pt = rng.gen_range(0.5..3.5);
        let phi = rng.gen_range(-PI..PI);
        let ct = rng.gen_range(1.0..20.0);
        let raw = two_body(&mut rng, mass, pt, phi, ct);
        let sign = if rng.r#gen::<bool>() { 1.0 } else { -1.0 };
        let reco = if rng.r#gen::<f64>() < 0.5 { 1.0 } else { 0.0 };
        for (name, v) in [
            ("fGenPt", sign * pt),
            ("fGenEta", 0.0),
            ("fGenXDecVtx", raw[6]),
            ("fGenYDecVtx", raw[7]),
            ("fGenZDecVtx", raw[8]),
            ("fIsReco", reco),
        ] {
            cols.entry(name.to_string()).or_default().push(v);
        }
        push_raw(&mut cols, raw);
    }
    std::fs::write(path, serde_json::to_vec(&cols).unwrap()).unwrap();
}

fn write_inputs(dir: &Path) {
    write_data(&dir.join("data.json"), 4000, 1);
    write_mc(&dir.join("mc.json"), 6000, 2);
}

const SPECTRUM_CONFIG: &str = r#"
input_data: data.json
input_mc: mc.json
output_dir: out
output_file: pt_spectrum
variable: pt
bins: [1, 2, 3]
selection:
  fCosPA: "fCosPA > 0.9"
signal_fit_func: gaus
bkg_fit_func: pol1
n_events: 1000000
reweight:
  shape: boltzmann
  params: [1.0, 0.5]
  range: [0.5, 3.5]
spectrum_fit:
  shape: boltzmann
seed: 11
systematics:
  n_trials: 3
  cut_grid:
    - {variable: fCosPA, greater: true, range: [0.9, 0.95, 2]}
  signal_fit_funcs: [gaus]
  bkg_fit_funcs: [pol1]
"#;

#[test]
fn spectrum_writes_result_and_log() {
    let dir = tmp_dir("spectrum");
    write_inputs(&dir);
    let config = dir.join("config.yaml");
    std::fs::write(&config, SPECTRUM_CONFIG).unwrap();

    let out = run(&["spectrum", "--config", config.to_string_lossy().as_ref(), "--threads", "2"]);
    assert!(out.status.success(), "spectrum should succeed, stderr={}", String::from_utf8_lossy(&out.stderr));

    let json_path = dir.join("out/pt_spectrum.json");
    let log_path = dir.join("out/pt_spectrum.txt");
    assert!(json_path.exists(), "missing {}", json_path.display());
    assert!(log_path.exists(), "missing {}", log_path.display());

    let v: serde_json::Value = serde_json::from_slice(&std::fs::read(&json_path).unwrap()).unwrap();
    assert_eq!(v["tool"], "hyperspec");
    assert_eq!(v["command"], "spectrum");
    assert_eq!(v["seed"], 11);

    let inputs = &v["inputs"];
    assert_eq!(inputs["n_data"], 4000);
    let accepted = inputs["reweight_accepted"].as_array().expect("reweighting summary");
    assert!(accepted[0].as_u64().unwrap() > 0);
    assert_eq!(accepted[1], 6000);

    let spectrum = &v["spectrum"];
    assert_eq!(spectrum["variable"], "pt");
    let bins = spectrum["bins"].as_array().unwrap();
    assert_eq!(bins.len(), 2);
    for (i, b) in bins.iter().enumerate() {
        assert_eq!(b["status"], "fitted", "bin {i}: {b}");
        assert!(b["raw_yield"]["value"].as_f64().unwrap() > 0.0);
        assert!(b["corrected_yield"]["value"].as_f64().unwrap() > 0.0);
        let eff = spectrum["efficiency"]["bin_content"][i].as_f64().unwrap();
        assert!((eff - 0.5).abs() < 0.1, "bin {i}: efficiency {eff}");
    }
    assert!(
        !spectrum["spectrum_fit"].is_null() || !spectrum["spectrum_fit_error"].is_null(),
        "spectrum fit outcome should be reported"
    );

    let syst = &v["systematics"];
    assert_eq!(syst["bins"].as_array().unwrap().len(), 2);
    let trials = syst["trials"].as_array().unwrap();
    assert!(!trials.is_empty() && trials.len() <= 3);

    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(log.contains("pt [1, 2)"), "log:\n{log}");
    assert!(log.contains("Trial: 0 /"), "log:\n{log}");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn spectrum_output_flag_overrides_location() {
    let dir = tmp_dir("spectrum_output");
    write_inputs(&dir);
    let config = dir.join("config.yaml");
    let yaml = SPECTRUM_CONFIG.split("spectrum_fit:").next().unwrap().to_string();
    std::fs::write(&config, yaml).unwrap();
    let output = dir.join("elsewhere/result.json");

    let out = run(&[
        "spectrum",
        "--config",
        config.to_string_lossy().as_ref(),
        "--output",
        output.to_string_lossy().as_ref(),
    ]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    assert!(output.exists());
    assert!(dir.join("elsewhere/result.txt").exists());
    assert!(!dir.join("out").exists());

    let v: serde_json::Value = serde_json::from_slice(&std::fs::read(&output).unwrap()).unwrap();
    assert!(v["systematics"].is_null());
    assert!(v["spectrum"]["spectrum_fit"].is_null());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn mass_fit_writes_json_to_stdout() {
    let dir = tmp_dir("mass_fit");
    write_inputs(&dir);
    let config = dir.join("config.yaml");
    std::fs::write(
        &config,
        "input_data: data.json\ninput_mc: mc.json\nis_matter: matter\nselection: {fCosPA: \"fCosPA > 0.9\"}\nsignal_fit_func: gaus\n",
    )
    .unwrap();

    let out = run(&["mass-fit", "--config", config.to_string_lossy().as_ref()]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("stdout should be JSON");
    assert_eq!(v["command"], "mass-fit");
    let n = v["n_candidates"].as_u64().unwrap();
    assert!(n > 1500 && n < 2500, "matter candidates: {n}");
    assert!(!v["prefit"].is_null());
    let mu = v["report"]["mu"]["value"].as_f64().unwrap();
    assert!((mu - PEAK.0).abs() < 0.001, "mu = {mu}");
    assert!(v["report"]["signal"]["value"].as_f64().unwrap() > 0.0);
    assert!(!v["summary"].as_str().unwrap().is_empty());

    let _ = std::fs::remove_dir_all(&dir);
}
