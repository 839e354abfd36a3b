//! Error types for hyperspec

use thiserror::Error;

/// hyperspec error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Columnar file (Parquet/Arrow) error
    #[error("columnar format error: {0}")]
    Format(String),

    /// Invalid configuration (bad option, non-increasing edges, missing key)
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation error for a function argument
    #[error("Validation error: {0}")]
    Validation(String),

    /// A filter referenced a column the dataset does not have
    #[error("undefined column '{column}' in expression '{expression}'")]
    UndefinedColumn {
        /// Missing column name
        column: String,
        /// Rendered expression
        expression: String,
    },

    /// Expression could not be parsed, or a derivation references missing columns
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// A fit was requested on a sample with no entries
    #[error("empty sample: {0}")]
    EmptySample(String),

    /// Ratio with a zero denominator (efficiency bin with no generated entries)
    #[error("zero denominator: {0}")]
    ZeroDenominator(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),
}

impl Error {
    /// Short machine-readable tag, used when a failure is recorded instead of raised.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Format(_) => "format",
            Error::Config(_) => "config",
            Error::Validation(_) => "validation",
            Error::UndefinedColumn { .. } => "undefined_column",
            Error::InvalidExpression(_) => "invalid_expression",
            Error::EmptySample(_) => "empty_sample",
            Error::ZeroDenominator(_) => "zero_denominator",
            Error::Computation(_) => "computation",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undefined_column_message() {
        let err =
            Error::UndefinedColumn { column: "fFoo".into(), expression: "fFoo > 1".into() };
        assert_eq!(err.kind(), "undefined_column");
        assert!(err.to_string().contains("fFoo"));
    }
}
