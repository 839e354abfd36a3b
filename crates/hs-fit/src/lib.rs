//! # hs-fit
//!
//! Fitting layer for hyperspec.
//!
//! This crate provides:
//! - Normalised mass-peak densities (Gaussian, double-sided Crystal Ball, Chebyshev)
//! - A bounded L-BFGS optimiser and a maximum-likelihood estimator with
//!   Hessian-based uncertainties
//! - [`MassFitModel`]: MC signal pre-fit, signal + background fit and the
//!   derived yields, significance and fit quality
//! - χ² curve fits of histograms ([`curve_fit`])
//!
//! The estimator depends only on `hs_core::LogDensityModel`; the mass model
//! and the χ² objective are two implementations of it.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// χ² fits of parametric curves to histograms.
pub mod curve_fit;
/// Signal extraction: configuration, pre-fit, data fit and report.
pub mod mass_fit;
/// Unbinned signal + background likelihood.
pub mod mass_model;
/// Numerical helpers.
pub mod math;
/// Maximum-likelihood estimation via L-BFGS-B.
pub mod mle;
/// Generic numerical optimizer (L-BFGS-B backend).
pub mod optimizer;
/// One-dimensional densities on a bounded support.
pub mod pdf;

pub use curve_fit::{CurveFitOptions, CurveFitResult, CurvePoint, CurveShape, GaussianCurve, fit_histogram};
pub use mass_fit::{
    BackgroundShape, FitFrame, FittedMassModel, MassFitConfig, MassFitModel, ParamRange,
    PrefitSummary, SignalReport, SignalShape,
};
pub use mass_model::{MassModel, Parameter, YieldMode};
pub use mle::MaximumLikelihoodEstimator;
pub use optimizer::{LbfgsbOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use pdf::{ChebyshevPdf, DoubleCrystalBallPdf, GaussianPdf, UnbinnedPdf};
