pub type PividResult<T> = Result<T, PividError>;

/// Coarse failure classification used by recovery policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Device or file access failure; the affected media produces no frames.
    Io,
    /// A media file or script could not be opened or parsed.
    Format,
    /// A single frame failed to decode; the decoder skips it and advances.
    Decode,
    /// The display driver refused a commit (e.g. plane limit exceeded).
    Unsupported,
    /// Buffer allocation failed; callers evict and retry once.
    OutOfMemory,
    /// A script is semantically malformed; rejected without state changes.
    Invalid,
    /// One-in-flight commit rule violated; a caller programming error.
    Busy,
    /// Anything that escaped the classification above.
    Other,
}

#[derive(thiserror::Error, Debug)]
pub enum PividError {
    #[error("i/o error: {0}")]
    Io(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("invalid script: {0}")]
    Invalid(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PividError {
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::Format(_) => ErrorKind::Format,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Kinds the playback loops handle locally with a logged warning.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Decode | ErrorKind::Unsupported | ErrorKind::OutOfMemory
        )
    }
}

impl From<std::io::Error> for PividError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
