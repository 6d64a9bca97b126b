use thiserror::Error;

#[derive(Debug, Error)]
pub enum VigilError {
    /// The config file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parsed, but a value is out of range.
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl VigilError {
    /// Short error code string used in CLI output and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            VigilError::Config(_) => "CONFIG_ERROR",
            VigilError::Invalid { .. } => "INVALID_SETTING",
        }
    }
}

pub type Result<T> = std::result::Result<T, VigilError>;
