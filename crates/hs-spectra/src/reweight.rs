//! Rejection-sampling reweighting of simulated spectra.
//!
//! Each row is kept with probability `f(x) / max f`, so the kept rows follow
//! the reference shape whatever the generation shape was. The random source
//! is always passed in by the caller.

use hs_core::{Error, Result};
use hs_data::{Histogram1D, TabularDataset};
use hs_fit::CurveShape;
use rand::Rng;

/// Name of the acceptance flag column.
pub const REJECTION_FLAG: &str = "rej";

/// Target density of a reweighting.
pub trait ReferenceShape: Send + Sync {
    /// Density at `x` (any normalisation).
    fn evaluate(&self, x: f64) -> f64;

    /// Maximum of the density over the sampled range.
    fn maximum(&self) -> f64;
}

/// A parametric curve with fixed parameters on a finite range.
#[derive(Debug)]
pub struct CurveReference {
    curve: Box<dyn CurveShape>,
    params: Vec<f64>,
    range: (f64, f64),
    max: f64,
}

impl CurveReference {
    /// Wrap `curve` evaluated with `params`; outside `range` the density is zero.
    ///
    /// The maximum is located on a grid and refined by golden-section search.
    pub fn new(curve: Box<dyn CurveShape>, params: Vec<f64>, range: (f64, f64)) -> Result<Self> {
        let n_expected = curve.parameter_names().len();
        if params.len() != n_expected {
            return Err(Error::Config(format!(
                "{} takes {n_expected} parameters, got {}",
                curve.name(),
                params.len()
            )));
        }
        let (lo, hi) = range;
        if !(lo < hi) || !lo.is_finite() || !hi.is_finite() {
            return Err(Error::Config(format!("invalid reference range [{lo}, {hi}]")));
        }
        let max = scan_maximum(|x| curve.eval(x, &params), lo, hi);
        if !(max > 0.0) || !max.is_finite() {
            return Err(Error::Config(format!(
                "{} has no positive maximum on [{lo}, {hi}]",
                curve.name()
            )));
        }
        Ok(Self { curve, params, range, max })
    }

    /// Sampled range.
    pub fn range(&self) -> (f64, f64) {
        self.range
    }
}

impl ReferenceShape for CurveReference {
    fn evaluate(&self, x: f64) -> f64 {
        if x < self.range.0 || x > self.range.1 {
            return 0.0;
        }
        self.curve.eval(x, &self.params).max(0.0)
    }

    fn maximum(&self) -> f64 {
        self.max
    }
}

fn scan_maximum(f: impl Fn(f64) -> f64, lo: f64, hi: f64) -> f64 {
    const N_GRID: usize = 1000;
    let step = (hi - lo) / N_GRID as f64;
    let (mut best_x, mut best) = (lo, f64::NEG_INFINITY);
    for k in 0..=N_GRID {
        let x = lo + step * k as f64;
        let y = f(x);
        if y > best {
            best = y;
            best_x = x;
        }
    }

    let inv_phi = 0.5 * (5.0_f64.sqrt() - 1.0);
    let mut a = (best_x - step).max(lo);
    let mut b = (best_x + step).min(hi);
    for _ in 0..60 {
        let c = b - inv_phi * (b - a);
        let d = a + inv_phi * (b - a);
        if f(c) > f(d) { b = d } else { a = c }
    }
    best.max(f(0.5 * (a + b)))
}

/// A histogram used as a step-function density.
#[derive(Debug, Clone)]
pub struct HistogramReference {
    hist: Histogram1D,
}

impl HistogramReference {
    /// Fails when no bin content is positive.
    pub fn new(hist: Histogram1D) -> Result<Self> {
        if !(hist.maximum() > 0.0) {
            return Err(Error::Config(format!("reference histogram '{}' has no positive bin", hist.name)));
        }
        Ok(Self { hist })
    }
}

impl ReferenceShape for HistogramReference {
    fn evaluate(&self, x: f64) -> f64 {
        self.hist.find_bin(x).map_or(0.0, |i| self.hist.content(i).max(0.0))
    }

    fn maximum(&self) -> f64 {
        self.hist.maximum()
    }
}

/// One accept/reject decision per row of `variable`.
///
/// Rows with a non-finite value are rejected.
pub fn reweight<R: Rng + ?Sized>(
    ds: &TabularDataset,
    variable: &str,
    reference: &dyn ReferenceShape,
    rng: &mut R,
) -> Result<Vec<bool>> {
    let max = reference.maximum();
    if !(max > 0.0) || !max.is_finite() {
        return Err(Error::Validation(format!("reference maximum must be positive, got {max}")));
    }
    let values = ds.column(variable)?;
    Ok(values
        .iter()
        .map(|&x| {
            // Draw for every row so the stream does not depend on the values.
            let u: f64 = rng.r#gen();
            x.is_finite() && u <= reference.evaluate(x) / max
        })
        .collect())
}

/// Run [`reweight`] and store the flags as the `rej` column (1 = accepted).
///
/// Returns the number of accepted rows. Fails if the column already exists.
pub fn add_rejection_flag<R: Rng + ?Sized>(
    ds: &mut TabularDataset,
    variable: &str,
    reference: &dyn ReferenceShape,
    rng: &mut R,
) -> Result<usize> {
    if ds.has_column(REJECTION_FLAG) {
        return Err(Error::Validation(format!(
            "'{REJECTION_FLAG}' already present; reweighting is applied once per dataset"
        )));
    }
    let flags = reweight(ds, variable, reference, rng)?;
    let accepted = flags.iter().filter(|&&f| f).count();
    ds.add_column(REJECTION_FLAG, flags.into_iter().map(|f| if f { 1.0 } else { 0.0 }).collect())?;
    log::info!("reweighting on '{variable}': kept {accepted} of {} rows", ds.count());
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::{HYPERTRITON_MASS, LevyTsallis};
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[derive(Debug)]
    struct Line;

    impl CurveShape for Line {
        fn name(&self) -> &str {
            "line"
        }
        fn parameter_names(&self) -> Vec<String> {
            vec!["slope".into()]
        }
        fn eval(&self, x: f64, p: &[f64]) -> f64 {
            p[0] * x
        }
        fn initial(&self, _: &[hs_fit::CurvePoint]) -> Vec<(f64, (f64, f64))> {
            vec![(1.0, (0.0, 10.0))]
        }
    }

    fn uniform_sample(n: usize, lo: f64, hi: f64, seed: u64) -> TabularDataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = (0..n).map(|_| rng.gen_range(lo..hi)).collect();
        TabularDataset::from_columns(vec![("x".into(), x)]).unwrap()
    }

    #[test]
    fn test_curve_maximum() {
        let r = CurveReference::new(Box::new(Line), vec![2.0], (0.0, 3.0)).unwrap();
        assert_relative_eq!(r.maximum(), 6.0, max_relative = 1e-9);
        assert_eq!(r.evaluate(4.0), 0.0);

        let levy = CurveReference::new(
            Box::new(LevyTsallis { mass: HYPERTRITON_MASS }),
            vec![1.0, 10.0, 0.3],
            (0.0, 10.0),
        )
        .unwrap();
        let grid_max = (0..=100_000)
            .map(|k| levy.evaluate(k as f64 * 1e-4))
            .fold(0.0_f64, f64::max);
        assert!(levy.maximum() >= grid_max * (1.0 - 1e-9));
    }

    #[test]
    fn test_invalid_references() {
        assert!(CurveReference::new(Box::new(Line), vec![0.0], (0.0, 1.0)).is_err());
        assert!(CurveReference::new(Box::new(Line), vec![1.0, 2.0], (0.0, 1.0)).is_err());
        let empty = Histogram1D::uniform("h", "", 4, 0.0, 1.0).unwrap();
        assert!(HistogramReference::new(empty).is_err());
    }

    #[test]
    fn test_accepted_rows_follow_reference() {
        let ds = uniform_sample(200_000, 0.0, 1.0, 7);
        let reference = CurveReference::new(Box::new(Line), vec![1.0], (0.0, 1.0)).unwrap();
        let flags = reweight(&ds, "x", &reference, &mut StdRng::seed_from_u64(11)).unwrap();
        let kept = ds.select_rows(&flags);

        // Expected acceptance for a linear target on a flat sample is 1/2.
        assert_relative_eq!(kept.count() as f64 / ds.count() as f64, 0.5, epsilon = 0.01);

        let mut h = Histogram1D::uniform("kept", "", 20, 0.0, 1.0).unwrap();
        h.fill_all(kept.column("x").unwrap());
        let total = h.total();
        let chi2: f64 = (0..h.n_bins())
            .map(|i| {
                let expected = total * 2.0 * h.bin_center(i) * h.bin_width(i);
                (h.content(i) - expected).powi(2) / expected
            })
            .sum();
        assert!(chi2 / 19.0 < 2.5, "chi2/ndf = {}", chi2 / 19.0);
    }

    #[test]
    fn test_histogram_reference() {
        let mut target = Histogram1D::uniform("t", "", 2, 0.0, 2.0).unwrap();
        target.set_bin(0, 1.0, 0.0);
        target.set_bin(1, 4.0, 0.0);
        let reference = HistogramReference::new(target).unwrap();
        let ds = uniform_sample(100_000, 0.0, 2.0, 3);
        let flags = reweight(&ds, "x", &reference, &mut StdRng::seed_from_u64(5)).unwrap();
        let kept = ds.select_rows(&flags);
        let low = kept.column("x").unwrap().iter().filter(|&&x| x < 1.0).count() as f64;
        assert_relative_eq!(low / kept.count() as f64, 0.2, epsilon = 0.01);
    }

    #[test]
    fn test_flag_column_is_seeded_and_written_once() {
        let reference = CurveReference::new(Box::new(Line), vec![1.0], (0.0, 1.0)).unwrap();
        let mut a = uniform_sample(1000, 0.0, 1.0, 1);
        let mut b = a.clone();
        let na = add_rejection_flag(&mut a, "x", &reference, &mut StdRng::seed_from_u64(9)).unwrap();
        let nb = add_rejection_flag(&mut b, "x", &reference, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(na, nb);
        assert_eq!(a.column(REJECTION_FLAG).unwrap(), b.column(REJECTION_FLAG).unwrap());
        assert!(add_rejection_flag(&mut a, "x", &reference, &mut StdRng::seed_from_u64(9)).is_err());
    }
}
