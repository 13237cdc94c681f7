use thiserror::Error;

/// Errors surfaced to callers of the public `Database` handle and its
/// component layers. Mirrors the teacher's `AllocError` shape: one variant
/// per failure cause, `#[source]` carrying the underlying `io::Error` where
/// one exists.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),

    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),

    #[error("I/O operation failed")]
    Io(#[source] std::io::Error),

    #[error("short write: requested {requested} bytes, wrote {wrote}")]
    ShortWrite { requested: usize, wrote: usize },

    #[error("the database file has no valid superblock")]
    MissingSuperBlock,

    #[error("on-disk data is corrupt: {0}")]
    Corruption(&'static str),

    #[error("node {0} failed to deserialize")]
    NodeCorruption(betree_block::Nid),

    #[error("invariant violated: {0}")]
    Invariant(&'static str),

    #[error("invalid option: {0}")]
    InvalidOption(&'static str),

    #[error("the host page size is unsupported for direct I/O: {0}")]
    UnsupportedPageSize(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
