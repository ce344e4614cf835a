pub mod aggregation;
pub mod arima;
pub mod correlation;
pub mod outliers;
pub mod regression;
pub mod stationarity;
pub mod stats;
pub mod volume;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("Insufficient data: need at least {needed} points, got {got}")]
    InsufficientData { needed: usize, got: usize },
    #[error("Input is constant: {0}")]
    ConstantInput(String),
    #[error("Design matrix is singular")]
    SingularMatrix,
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Distribution error: {0}")]
    Distribution(String),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

pub(crate) fn require_points(got: usize, needed: usize) -> Result<()> {
    if got < needed {
        return Err(AnalysisError::InsufficientData { needed, got });
    }
    Ok(())
}
