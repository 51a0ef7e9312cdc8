use thiserror::Error;

/// Errors surfaced by the BTT library.
///
/// Namespace failures are carried verbatim in `Io`; layout problems found at
/// open time never surface here (an invalid layout reads as an unlaid-out
/// namespace instead).
#[derive(Debug, Error)]
pub enum BttError {
    #[error("lba {lba} out of range (nlba {nlba})")]
    OutOfRange { lba: u64, nlba: u64 },

    #[error("buffer length {len} does not match lba size {lbasize}")]
    BadBuffer { len: usize, lbasize: u32 },

    #[error("lba {lba} is flagged as an error block")]
    ErrorBlock { lba: u64 },

    #[error("arena {arena} is in an error state, writes disabled")]
    ArenaBroken { arena: usize },

    #[error("requested lba size {requested} does not match on-media lba size {stored}")]
    LbaSizeMismatch { requested: u32, stored: u32 },

    #[error("namespace of {rawsize} bytes is too small for a btt layout")]
    NamespaceTooSmall { rawsize: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BttError>;
