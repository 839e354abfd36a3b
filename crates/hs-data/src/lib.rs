//! # hs-data
//!
//! Data layer for hyperspec:
//! - [`TabularDataset`]: columnar candidate table with filter / derive
//! - [`Expr`]: typed selection and derivation expressions
//! - [`Histogram1D`]: variable-width histogram with content/error accessors
//! - [`io`]: JSON and (feature `arrow-io`) Parquet loading

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dataset;
pub mod expr;
pub mod histogram;
pub mod io;

pub use dataset::TabularDataset;
pub use expr::{CompiledExpr, Expr};
pub use histogram::{Histogram1D, find_bin, uniform_edges, validate_edges};
