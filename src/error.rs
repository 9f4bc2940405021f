use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("Arena base pointer is null")]
    NullBase,

    #[error("Arena base {0:#x} is not aligned to the 128 MiB arena boundary")]
    MisalignedBase(usize),

    #[error("Invalid arena size: {0} (must be > 0 and <= 128 MiB)")]
    InvalidSize(usize),

    #[error("Destination buffer too small: {required} bytes required")]
    BufferTooSmall { required: usize },

    #[error("Unrecognized change buffer kind tag: {0:#010x}")]
    InvalidKind(u32),

    #[error("Change buffer truncated: {expected} bytes expected, {actual} available")]
    TruncatedBuffer { expected: usize, actual: usize },

    #[error("Full-copy payload is {payload} bytes but the arena is {arena} bytes")]
    SizeMismatch { payload: u64, arena: usize },

    #[error("Sparse-diff payload {payload} is not a whole number of {entry}-byte entries")]
    MalformedDiff { payload: u64, entry: usize },

    #[error("Page index {index} out of range for an arena of {pages} pages")]
    InvalidPageIndex { index: u32, pages: usize },

    #[error("Capture is not meaningful for a read-only mirror")]
    CaptureUnsupported,

    #[error("Arena registry is full ({0} live arenas)")]
    RegistryFull(usize),

    #[error("Bookkeeping magic number is invalid")]
    InvalidTrackingMagic,

    #[error("Platform VM error: {0}")]
    Vm(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArenaError>;
