//! Determinism of the systematic scan.

use hs_data::TabularDataset;
use hs_fit::{BackgroundShape, SignalShape};
use hs_spectra::{
    BinSettings, CutGrid, SpectrumConfig, SystematicsConfig, Variable, build, scan,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

fn candidates(n: usize, signal_fraction: f64, rng: &mut StdRng) -> TabularDataset {
    let peak = Normal::new(2.991, 0.0025).unwrap();
    let mut ct = Vec::with_capacity(n);
    let mut cos_pa = Vec::with_capacity(n);
    let mut mass = Vec::with_capacity(n);
    for _ in 0..n {
        ct.push(rng.gen_range(1.0..9.0));
        cos_pa.push(rng.gen_range(0.99..1.0));
        mass.push(if rng.r#gen::<f64>() < signal_fraction {
            peak.sample(rng)
        } else {
            rng.gen_range(2.96..3.04)
        });
    }
    TabularDataset::from_columns(vec![
        ("fCt".into(), ct),
        ("fCosPA".into(), cos_pa),
        ("fMassH3L".into(), mass),
    ])
    .unwrap()
}

fn inputs() -> (TabularDataset, TabularDataset, TabularDataset) {
    let mut rng = StdRng::seed_from_u64(2024);
    let data = candidates(6000, 0.3, &mut rng);
    let mc_reco = candidates(4000, 1.0, &mut rng);
    let gen_ct: Vec<f64> = (0..10_000).map(|_| rng.gen_range(1.0..9.0)).collect();
    let mc_gen = TabularDataset::from_columns(vec![("fGenCt".into(), gen_ct)]).unwrap();
    (data, mc_gen, mc_reco)
}

fn configs() -> (SpectrumConfig, SystematicsConfig) {
    let settings = BinSettings { signal: SignalShape::Gaus, ..BinSettings::default() };
    let base = SpectrumConfig::new(Variable::Ct, vec![1.0, 5.0, 9.0], settings).unwrap();
    let syst = SystematicsConfig {
        n_trials: 4,
        seed: 17,
        cut_grid: vec![CutGrid::new("fCosPA", true, 0.990, 0.995, 3)],
        signal_fit_funcs: vec![SignalShape::Gaus],
        bkg_fit_funcs: vec![BackgroundShape::Pol1, BackgroundShape::Pol2],
        ..SystematicsConfig::default()
    };
    (base, syst)
}

#[test]
fn scan_is_reproducible_for_any_thread_count() {
    let (data, mc_gen, mc_reco) = inputs();
    let (base, syst) = configs();
    let nominal = build(&base, &data, &mc_gen, &mc_reco).unwrap();
    assert_eq!(nominal.n_failed(), 0, "{:#?}", nominal.log_lines());

    let first = scan(&base, &nominal, &syst, &data, &mc_gen, &mc_reco).unwrap();
    let second = scan(&base, &nominal, &syst, &data, &mc_gen, &mc_reco).unwrap();
    let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
    let serial = pool.install(|| scan(&base, &nominal, &syst, &data, &mc_gen, &mc_reco)).unwrap();

    assert!(!first.trials.is_empty());
    assert_eq!(first.trials, second.trials);
    assert_eq!(first.trials, serial.trials);
    for ((a, b), c) in first.bins.iter().zip(&second.bins).zip(&serial.bins) {
        assert_eq!(a.distribution, b.distribution);
        assert_eq!(a.distribution, c.distribution);
        assert_eq!(a.sigma, b.sigma);
    }
    assert_eq!(first.log_lines(), serial.log_lines());
}

#[test]
fn exhaustive_scan_fills_every_bin_distribution() {
    let (data, mc_gen, mc_reco) = inputs();
    let (mut base, mut syst) = configs();
    base.quality.exclude_suspect_from_systematics = false;
    syst.n_trials = 100;

    let nominal = build(&base, &data, &mc_gen, &mc_reco).unwrap();
    let result = scan(&base, &nominal, &syst, &data, &mc_gen, &mc_reco).unwrap();
    assert_eq!(result.n_combinations, 6);
    assert_eq!(result.trials.len(), 6);
    for bin in &result.bins {
        let fitted = result.trials.iter().filter(|t| t.corrected[bin.index].is_some()).count();
        assert_eq!(bin.n_entries, fitted);
        assert_eq!(bin.distribution.entries as usize, fitted);
        assert!(bin.nominal.is_some());
        assert!(bin.sigma.value >= 0.0);
    }
    let log = result.log_lines();
    assert_eq!(log.iter().filter(|l| l.starts_with("Trial: ")).count(), 6);
}
