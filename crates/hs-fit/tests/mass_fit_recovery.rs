//! Signal-extraction recovery on synthetic mass samples.

use hs_core::Error;
use hs_fit::{
    BackgroundShape, ChebyshevPdf, DoubleCrystalBallPdf, MassFitConfig, MassFitModel,
    SignalShape, UnbinnedPdf, YieldMode,
};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

const WINDOW: (f64, f64) = (2.96, 3.04);
const DSCB: [f64; 6] = [2.991, 0.0022, 1.2, 3.0, 1.5, 4.0];

fn gaussian_plus_flat(n_sig: usize, n_bkg: usize, seed: u64) -> Vec<f64> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let peak = Normal::new(2.991, 0.0025).unwrap();
    let mut xs: Vec<f64> = (0..n_sig).map(|_| peak.sample(&mut rng)).collect();
    xs.extend((0..n_bkg).map(|_| rng.gen_range(WINDOW.0..WINDOW.1)));
    xs
}

fn dscb_plus_linear(n_sig: usize, n_bkg: usize, seed: u64) -> Vec<f64> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut xs = DoubleCrystalBallPdf.sample(&DSCB, n_sig, WINDOW, &mut rng).unwrap();
    let bkg = ChebyshevPdf::new(1).unwrap();
    xs.extend(bkg.sample(&[0.2], n_bkg, WINDOW, &mut rng).unwrap());
    xs
}

fn gaus_config(mode: YieldMode) -> MassFitConfig {
    MassFitConfig { signal: SignalShape::Gaus, yield_mode: mode, ..Default::default() }
}

#[test]
fn gaussian_peak_on_flat_background() {
    let masses = gaussian_plus_flat(1800, 8200, 42);
    let fitted = MassFitModel::new(gaus_config(YieldMode::Fraction)).unwrap().fit(&masses).unwrap();
    let r = fitted.report();

    assert!(r.converged, "{}", fitted.summary());
    assert!(r.signal.error > 30.0 && r.signal.error < 100.0, "σ_S = {}", r.signal.error);
    assert!((r.signal.value - 1800.0).abs() < 4.0 * r.signal.error, "S = {}", r.signal.value);
    assert!((r.mu.value - 2.991).abs() < 0.0005, "mu = {}", r.mu.value);
    assert!((r.sigma.value - 0.0025).abs() < 0.0003, "sigma = {}", r.sigma.value);
    assert!((r.signal.value + r.background.value - 10_000.0).abs() < 1e-6);
    assert!(r.fit_probability > 1e-4, "prob = {}", r.fit_probability);
}

#[test]
fn extended_and_fraction_yields_agree() {
    let masses = gaussian_plus_flat(1800, 8200, 7);
    let frac = MassFitModel::new(gaus_config(YieldMode::Fraction)).unwrap().fit(&masses).unwrap();
    let ext = MassFitModel::new(gaus_config(YieldMode::Extended)).unwrap().fit(&masses).unwrap();
    let (rf, re) = (frac.report(), ext.report());

    assert!((re.signal.value + re.background.value - 10_000.0).abs() < 5.0);
    assert!((rf.signal.value - re.signal.value).abs() < 0.2 * rf.signal.error);
    assert!((rf.mu.value - re.mu.value).abs() < 1e-4);
}

#[test]
fn three_sigma_quantities_are_consistent() {
    let masses = gaussian_plus_flat(1800, 8200, 3);
    let fitted = MassFitModel::new(gaus_config(YieldMode::Fraction)).unwrap().fit(&masses).unwrap();
    let r = fitted.report();

    // A Gaussian keeps ~99.73% of its content in ±3σ.
    assert!((r.signal_3sigma.value / r.signal.value - 0.9973).abs() < 1e-3);
    // Flat background: 6σ of the 80 MeV window.
    let expected_b3 = r.background.value * 6.0 * r.sigma.value / 0.08;
    assert!((r.background_3sigma.value - expected_b3).abs() < 0.05 * expected_b3);
    let z = r.signal_3sigma.value / (r.signal_3sigma.value + r.background_3sigma.value).sqrt();
    assert!((r.significance.value - z).abs() < 1e-9);
    assert!(r.significance.error > 0.0);
    assert!(fitted.summary().contains("MeV"));
    assert_eq!(fitted.frame().data.n_bins(), 30);
}

#[test]
fn dscb_with_mc_prefit_recovers_signal() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(99);
    let mc = DoubleCrystalBallPdf.sample(&DSCB, 20_000, WINDOW, &mut rng).unwrap();
    let data = dscb_plus_linear(3000, 6000, 5);

    let model = MassFitModel::new(MassFitConfig::default()).unwrap().prefit_signal(&mc).unwrap();
    let frozen: Vec<&str> = model
        .signal_parameters()
        .iter()
        .filter(|p| p.bounds.0 == p.bounds.1)
        .map(|p| p.name.as_str())
        .collect();
    assert_eq!(frozen, ["alpha_l", "n_l", "alpha_r", "n_r"]);
    let sigma = &model.signal_parameters()[1];
    assert!((sigma.bounds.1 / sigma.bounds.0 - 1.5).abs() < 1e-12);

    let fitted = model.fit(&data).unwrap();
    let r = fitted.report();
    assert!(fitted.prefit().is_some());
    assert!((r.signal.value - 3000.0).abs() < 4.0 * r.signal.error, "{}", fitted.summary());
    assert!((r.mu.value - DSCB[0]).abs() < 3e-4);
    assert!((r.sigma.value / DSCB[1] - 1.0).abs() < 0.15);
}

#[test]
fn pol2_background_fit_runs() {
    let masses = dscb_plus_linear(2000, 8000, 13);
    let config = MassFitConfig {
        signal: SignalShape::Gaus,
        background: BackgroundShape::Pol2,
        ..Default::default()
    };
    let fitted = MassFitModel::new(config).unwrap().fit(&masses).unwrap();
    assert_eq!(fitted.fit_result().names.len(), 2 + 2 + 1);
    assert!(fitted.report().signal.value > 1500.0);
}

#[test]
fn sample_outside_window_is_empty() {
    let err = MassFitModel::new(MassFitConfig::default()).unwrap().fit(&[3.5, 3.6]).unwrap_err();
    assert!(matches!(err, Error::EmptySample(_)));
}
