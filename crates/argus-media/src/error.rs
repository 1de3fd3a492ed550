use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    /// The input resource exists but cannot be opened. Fatal to the run.
    #[error("cannot open input '{path}': {reason}")]
    InputOpen { path: String, reason: String },

    /// The descriptor matched no input variant.
    #[error("unknown input descriptor '{0}'")]
    UnknownInput(String),

    /// The descriptor matched no output variant.
    #[error("unknown output descriptor '{0}'")]
    UnknownOutput(String),

    /// A studio manifest failed validation. Fatal to the run.
    #[error("invalid studio manifest '{path}': {reason}")]
    Manifest { path: String, reason: String },

    #[error("ffprobe failed for '{path}': {reason}")]
    Probe { path: String, reason: String },

    #[error("write to '{target}' failed: {reason}")]
    Write { target: String, reason: String },

    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("display sink unavailable: {0}")]
    Display(String),
}

impl MediaError {
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }
}
