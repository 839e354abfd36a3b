//! One-dimensional histogram with variable-width bins.
//!
//! Bins are half-open `[lo, hi)`; values outside `[edges[0], edges[n])` are
//! counted as under/overflow and never land in a bin.

use hs_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// A 1D histogram with per-bin content and sum of squared weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram1D {
    /// Histogram name.
    pub name: String,
    /// Histogram title (axis labels in `title;x;y` form).
    pub title: String,
    /// Bin edges (length = n_bins + 1), strictly increasing.
    pub bin_edges: Vec<f64>,
    /// Bin contents.
    pub bin_content: Vec<f64>,
    /// Sum of weights squared per bin; the bin error is its square root.
    pub sumw2: Vec<f64>,
    /// Total number of fill calls, in range or not.
    pub entries: f64,
    /// Underflow content.
    pub underflow: f64,
    /// Overflow content.
    pub overflow: f64,
}

/// Validate an edge sequence: at least two values, finite, strictly increasing.
pub fn validate_edges(edges: &[f64]) -> Result<()> {
    if edges.len() < 2 {
        return Err(Error::Config(format!("need at least 2 bin edges, got {}", edges.len())));
    }
    if edges.iter().any(|e| !e.is_finite()) {
        return Err(Error::Config("bin edges must be finite".into()));
    }
    if let Some(w) = edges.windows(2).find(|w| w[1] <= w[0]) {
        return Err(Error::Config(format!(
            "bin edges must be strictly increasing (found {} then {})",
            w[0], w[1]
        )));
    }
    Ok(())
}

/// Find the bin index for a value given sorted bin edges.
///
/// Returns `None` for underflow/overflow and NaN.
pub fn find_bin(edges: &[f64], val: f64) -> Option<usize> {
    let last = *edges.last()?;
    if val.is_nan() || val < edges[0] || val >= last {
        return None;
    }
    // First edge strictly greater than `val`, minus one.
    let upper = edges.partition_point(|&e| e <= val);
    Some(upper - 1)
}

/// `n + 1` equally spaced edges over `[lo, hi]`.
pub fn uniform_edges(n: usize, lo: f64, hi: f64) -> Vec<f64> {
    let w = (hi - lo) / n as f64;
    (0..=n).map(|i| if i == n { hi } else { lo + w * i as f64 }).collect()
}

impl Histogram1D {
    /// Empty histogram with the given edges.
    pub fn new(name: impl Into<String>, title: impl Into<String>, edges: Vec<f64>) -> Result<Self> {
        validate_edges(&edges)?;
        let n = edges.len() - 1;
        Ok(Self {
            name: name.into(),
            title: title.into(),
            bin_edges: edges,
            bin_content: vec![0.0; n],
            sumw2: vec![0.0; n],
            entries: 0.0,
            underflow: 0.0,
            overflow: 0.0,
        })
    }

    /// Empty histogram with `n` equal bins over `[lo, hi)`.
    pub fn uniform(
        name: impl Into<String>,
        title: impl Into<String>,
        n: usize,
        lo: f64,
        hi: f64,
    ) -> Result<Self> {
        if n == 0 {
            return Err(Error::Validation("histogram needs at least one bin".into()));
        }
        Self::new(name, title, uniform_edges(n, lo, hi))
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.bin_content.len()
    }

    /// Lower edge of the first bin.
    pub fn x_min(&self) -> f64 {
        self.bin_edges[0]
    }

    /// Upper edge of the last bin.
    pub fn x_max(&self) -> f64 {
        self.bin_edges[self.n_bins()]
    }

    /// Bin index containing `x`, if any.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        find_bin(&self.bin_edges, x)
    }

    /// Add `weight` at `x`.
    pub fn fill(&mut self, x: f64, weight: f64) {
        self.entries += 1.0;
        match self.find_bin(x) {
            Some(i) => {
                self.bin_content[i] += weight;
                self.sumw2[i] += weight * weight;
            }
            None if x < self.x_min() => self.underflow += weight,
            None => self.overflow += weight,
        }
    }

    /// Fill every value with unit weight.
    pub fn fill_all(&mut self, values: &[f64]) {
        values.iter().for_each(|&x| self.fill(x, 1.0));
    }

    /// Bin content.
    pub fn content(&self, bin: usize) -> f64 {
        self.bin_content[bin]
    }

    /// Bin error.
    pub fn error(&self, bin: usize) -> f64 {
        self.sumw2[bin].sqrt()
    }

    /// Set bin content and error.
    pub fn set_bin(&mut self, bin: usize, content: f64, error: f64) {
        self.bin_content[bin] = content;
        self.sumw2[bin] = error * error;
    }

    /// Lower edge of `bin`.
    pub fn bin_low_edge(&self, bin: usize) -> f64 {
        self.bin_edges[bin]
    }

    /// Width of `bin`.
    pub fn bin_width(&self, bin: usize) -> f64 {
        self.bin_edges[bin + 1] - self.bin_edges[bin]
    }

    /// Centre of `bin`.
    pub fn bin_center(&self, bin: usize) -> f64 {
        0.5 * (self.bin_edges[bin] + self.bin_edges[bin + 1])
    }

    /// Sum of contents over bins `first..=last`; with `width`, content × width.
    pub fn integral(&self, first: usize, last: usize, width: bool) -> f64 {
        (first..=last.min(self.n_bins().saturating_sub(1)))
            .map(|i| if width { self.content(i) * self.bin_width(i) } else { self.content(i) })
            .sum()
    }

    /// Sum of all in-range contents.
    pub fn total(&self) -> f64 {
        self.bin_content.iter().sum()
    }

    /// Largest bin content.
    pub fn maximum(&self) -> f64 {
        self.bin_content.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Bin indices whose range overlaps `[lo, hi]`.
    pub fn bins_in_range(&self, lo: f64, hi: f64) -> impl Iterator<Item = usize> + '_ {
        (0..self.n_bins())
            .filter(move |&i| self.bin_edges[i + 1] > lo && self.bin_edges[i] < hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_bin_edge_cases() {
        let edges = vec![0.0, 1.0, 2.0, 3.0];
        assert_eq!(find_bin(&edges, -0.5), None);
        assert_eq!(find_bin(&edges, 3.0), None);
        assert_eq!(find_bin(&edges, 0.0), Some(0));
        assert_eq!(find_bin(&edges, 1.0), Some(1));
        assert_eq!(find_bin(&edges, 2.99), Some(2));
        assert_eq!(find_bin(&edges, f64::NAN), None);
    }

    #[test]
    fn every_value_in_at_most_one_bin() {
        let edges = vec![1.0, 1.5, 2.5, 4.0];
        for k in 0..500 {
            let x = k as f64 * 0.01;
            let hits = edges.windows(2).filter(|w| x >= w[0] && x < w[1]).count();
            assert_eq!(hits, usize::from(find_bin(&edges, x).is_some()));
        }
    }

    #[test]
    fn validate_edges_rejects_bad_sequences() {
        assert!(validate_edges(&[1.0]).is_err());
        assert!(validate_edges(&[1.0, 1.0]).is_err());
        assert!(validate_edges(&[1.0, 3.0, 2.0]).is_err());
        assert!(validate_edges(&[1.0, f64::INFINITY]).is_err());
        assert!(validate_edges(&[0.0, 0.5, 9.0]).is_ok());
    }

    #[test]
    fn fill_and_errors() {
        let mut h = Histogram1D::new("h", "", vec![0.0, 1.0, 3.0]).unwrap();
        h.fill_all(&[0.5, 0.5, 2.0, -1.0, 5.0]);
        h.fill(2.5, 2.0);
        assert_eq!(h.bin_content, vec![2.0, 3.0]);
        assert!((h.error(1) - 5.0f64.sqrt()).abs() < 1e-12);
        assert_eq!(h.underflow, 1.0);
        assert_eq!(h.overflow, 1.0);
        assert_eq!(h.entries, 6.0);
        assert_eq!(h.integral(0, 1, true), 2.0 * 1.0 + 3.0 * 2.0);
        assert_eq!(h.maximum(), 3.0);
    }

    #[test]
    fn set_bin_and_geometry() {
        let mut h = Histogram1D::uniform("h", "", 4, 0.0, 2.0).unwrap();
        h.set_bin(3, 10.0, 2.0);
        assert_eq!(h.content(3), 10.0);
        assert_eq!(h.error(3), 2.0);
        assert_eq!(h.bin_width(0), 0.5);
        assert_eq!(h.bin_center(1), 0.75);
        assert_eq!(h.x_max(), 2.0);
        assert_eq!(h.bins_in_range(0.6, 1.2).collect::<Vec<_>>(), vec![1, 2]);
    }
}
