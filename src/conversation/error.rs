use thiserror::Error;

/// Failures of a single chat turn. None of them are retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerationError {
    /// Empty or absent message rejected before the model is touched.
    #[error("No message provided")]
    MissingInput,

    /// The decoded text held no usable reply after the response marker.
    #[error("Failed to generate response")]
    GenerationFailed,

    /// Encode, sample or decode blew up.
    #[error("Failed to process request: {0}")]
    ProcessingError(String),
}

impl GenerationError {
    pub fn processing(err: impl std::fmt::Display) -> Self {
        GenerationError::ProcessingError(format!("{err:#}"))
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, GenerationError::MissingInput)
    }
}
