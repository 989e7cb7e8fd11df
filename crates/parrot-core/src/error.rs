//! Error types for Parrot.

use thiserror::Error;

/// Result type alias using Parrot Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Parrot error types.
///
/// Every variant aborts the request it was raised in. Nothing is retried inside the
/// pipeline and no partial waveform is ever returned alongside an error.
#[derive(Error, Debug)]
pub enum Error {
    /// No usable reference recording and no default voice configured
    #[error("No usable reference recording and no default voice configured")]
    MissingReference,

    /// Sampling parameters or request options outside their valid domain
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The token predictor failed or returned a malformed distribution
    #[error("Prediction failed: {0}")]
    Prediction(String),

    /// The filter chain pruned every token
    #[error("Sampling filters removed every token (min_p={min_p}, top_p={top_p})")]
    EmptyDistribution { min_p: f32, top_p: f32 },

    /// The vocoder or watermarker failed
    #[error("Render failed: {0}")]
    Render(String),

    /// The request was abandoned through its cancel flag
    #[error("Generation cancelled")]
    Cancelled,

    /// Voice not found in cache
    #[error("Voice '{0}' not found. Add it first with add_voice()")]
    VoiceNotFound(String),

    /// Model file not found or failed to download
    #[error("Model error: {0}")]
    Model(String),

    /// Audio file error (read/write/format)
    #[error("Audio error: {0}")]
    Audio(String),

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// ONNX Runtime error
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),

    /// Shape/dimension mismatch
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Generic error for other cases
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error was caused by the caller's input rather than the models.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::MissingReference
                | Error::InvalidConfig(_)
                | Error::EmptyDistribution { .. }
                | Error::VoiceNotFound(_)
                | Error::Audio(_)
        )
    }
}
