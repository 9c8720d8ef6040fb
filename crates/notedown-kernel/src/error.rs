use std::path::PathBuf;

/// Error type for kernel client operations.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("Kernel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stale transport file: {}", .0.display())]
    StaleTransport(PathBuf),

    #[error("Kernel reported an error: {0}")]
    Execution(String),

    #[error("Protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("Kernel failed to start: {0}")]
    StartFailed(String),

    #[error("Kernel restarted too many times ({0})")]
    TooManyRestarts(u32),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Notebook(#[from] notedown::Error),
}
