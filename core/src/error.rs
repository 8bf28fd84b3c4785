use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstimateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid value for {option}: '{value}'")]
    InvalidOption { option: &'static str, value: String },

    #[error("Invalid count for '{label}': '{value}'")]
    InvalidCount { label: String, value: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EstimateResult<T> = Result<T, EstimateError>;
