use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Delta list overflow")]
    Overflow,

    /// Not a failure: the request is now owned by the I/O subsystem and
    /// will be restarted when the page read completes. Callers must stop
    /// processing the request and must not fire its callback.
    #[error("Request queued behind a page read")]
    Queued,

    #[error("Buffer error: {0}")]
    Buffer(String),

    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Bad state: {0}")]
    BadState(String),

    #[error("Duplicate record name")]
    DuplicateName,

    #[error("Index was not saved cleanly")]
    NotSavedCleanly,

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Operation aborted while suspended")]
    Busy,
}

impl IndexError {
    /// True for conditions that park a request rather than fail it.
    pub fn is_queued(&self) -> bool {
        matches!(self, IndexError::Queued)
    }
}

impl Clone for IndexError {
    fn clone(&self) -> Self {
        match self {
            IndexError::Io(e) => IndexError::Io(std::io::Error::new(e.kind(), e.to_string())),
            IndexError::InvalidArgument(s) => IndexError::InvalidArgument(s.clone()),
            IndexError::Overflow => IndexError::Overflow,
            IndexError::Queued => IndexError::Queued,
            IndexError::Buffer(s) => IndexError::Buffer(s.clone()),
            IndexError::CorruptData(s) => IndexError::CorruptData(s.clone()),
            IndexError::BadState(s) => IndexError::BadState(s.clone()),
            IndexError::DuplicateName => IndexError::DuplicateName,
            IndexError::NotSavedCleanly => IndexError::NotSavedCleanly,
            IndexError::UnsupportedVersion(s) => IndexError::UnsupportedVersion(s.clone()),
            IndexError::OutOfMemory(s) => IndexError::OutOfMemory(s.clone()),
            IndexError::Busy => IndexError::Busy,
        }
    }
}

impl PartialEq for IndexError {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
