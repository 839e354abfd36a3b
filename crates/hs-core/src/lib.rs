//! # hs-core
//!
//! Core types, traits, and error handling for hyperspec.
//!
//! This crate provides:
//! - The shared error taxonomy
//! - The [`LogDensityModel`] trait consumed by the likelihood fitter
//! - Fit result and measurement records

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::LogDensityModel;
pub use types::{FitResult, Measurement};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
