use thiserror::Error;

/// Errors surfaced by the trie engine.
///
/// `RegionResize` is special: it is raised from inside a pinned operation to
/// signal that the mapping must grow (or may shrink) before the operation can
/// complete. [`crate::region::Region::pinned`] consumes it internally; it
/// should never be observed outside a pin loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The mapping is too small (or too large) for the requested operation.
    /// Recovered by the outermost pin handler; not a caller-visible failure.
    #[error("region must be resized to at least 0x{size:x} bytes")]
    RegionResize { size: u64, can_shrink: bool },

    /// A structural assertion failed: bad magic, bad sentinel, violated node
    /// invariant. The affected structure should be considered corrupt.
    #[error("integrity check failed at offset 0x{offset:x}: {detail}")]
    Integrity { offset: u64, detail: &'static str },

    /// No free slot or page of the requested order could be obtained.
    #[error("allocation of {size} bytes (order {order}) failed")]
    Allocation { size: u64, order: i32 },

    /// Caller misuse: double free, invalid trie id, out-of-range index.
    #[error("logical error: {0}")]
    Logical(&'static str),

    /// Couldn't open the backing file.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),

    /// Couldn't lock the backing file or one of its sidecar lock files.
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),

    /// Couldn't synchronize the mapping to the backing file.
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),

    /// Couldn't resize the backing file or remap it.
    #[error("can't resize the region. Have 0x{size:x} bytes, wanted 0x{requested:x} bytes")]
    ResizeFailed {
        size: u64,
        requested: u64,
        source: std::io::Error,
    },

    /// Couldn't create the mapping itself.
    #[error("can't map 0x{requested:x} bytes of memory")]
    MapFailed {
        requested: u64,
        source: std::io::Error,
    },

    /// The file's format doesn't match what this library writes.
    #[error("bad file format: {0}")]
    Format(&'static str),
}

impl Error {
    /// True for the resize signal that pin loops recover from.
    pub fn is_resize(&self) -> bool {
        matches!(self, Error::RegionResize { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
