//! Error type shared by the segmenter and the notebook bridge.

/// Errors raised while converting between documents and notebooks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Duplicate cell label '{label}'")]
    DuplicateLabel { label: String },

    #[error("Invalid notebook metadata at '{field}': {message}")]
    InvalidMetadata { field: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    pub(crate) fn metadata(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidMetadata {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
