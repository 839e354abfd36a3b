//! # hs-spectra
//!
//! Spectrum extraction for hyperspec.
//!
//! The pipeline is: [`kinematics::annotate`] on data and MC, matter and
//! quality preselections, [`reweight`] of the generated MC spectrum,
//! [`spectrum::build`] per kinematic bin, and optionally a
//! [`systematics::scan`] over cut and fit-shape variations.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Derived candidate kinematics.
pub mod kinematics;
/// Rejection-sampling reweighting.
pub mod reweight;
/// Physics shapes of corrected spectra.
pub mod shapes;
/// Efficiency-corrected binned spectra.
pub mod spectrum;
/// Systematic scans.
pub mod systematics;

pub use kinematics::{AnnotateOptions, Calibration, Capabilities, MatterSelection, annotate};
pub use reweight::{
    CurveReference, HistogramReference, REJECTION_FLAG, ReferenceShape, add_rejection_flag,
    reweight,
};
pub use shapes::{Boltzmann, ExpoCt, LevyTsallis, MtExponential, SpectrumShape};
pub use spectrum::{
    BinFailure, BinOutcome, BinResult, BinSettings, Efficiency, EfficiencyUncertainty,
    QualityCriteria, SpectrumConfig, SpectrumFitConfig, SpectrumResult, Variable, build,
    corrected_yield, fit_spectrum,
};
pub use systematics::{
    BinSystematic, CutGrid, ScanMode, SystematicsConfig, SystematicsResult, TrialRecord,
    plan_trials, scan,
};
