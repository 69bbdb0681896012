//! Error types for arena operations.
//!
//! Writer-side resource failures never surface here: the arena falls back to
//! private memory instead. What remains is a reader that cannot attach, and
//! registrations the arena has to refuse.

use thiserror::Error;

/// Error returned by [`Arena`](crate::Arena) operations.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// No usable counter region exists under this name. Every reader-side
    /// failure, from a missing object to a corrupt layout, ends up here.
    #[error("counter region `{name}` is not attachable: {reason}")]
    NotFound {
        name: String,
        #[source]
        reason: AttachFailure,
    },

    /// Counters can only be registered on a writer arena.
    #[error("cannot register counters on a read-only arena")]
    ReadOnly,

    /// The region has no room for another counter.
    #[error("counter region is full ({capacity} counters)")]
    Full { capacity: usize },
}

/// Why a region could not be attached.
#[derive(Debug, Error)]
pub enum AttachFailure {
    #[error("cannot open shared memory object: {0}")]
    Open(#[source] nix::errno::Errno),

    #[error("cannot read header: {0}")]
    Header(#[source] std::io::Error),

    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("declared size of {0} bytes is out of range")]
    BadSize(usize),

    #[error("region laid out for {declared} cpus, this process sees {available}")]
    CpuMismatch { declared: usize, available: usize },

    #[error("unexpected first group offset {0}")]
    LayoutMismatch(usize),

    #[error("object holds {actual} bytes but header declares {declared}")]
    Truncated { declared: usize, actual: u64 },

    #[error("cannot map region: {0}")]
    Map(#[source] std::io::Error),

    #[error("counter {index} lies outside the region")]
    Corrupt { index: usize },
}

/// Result type for arena operations.
pub type Result<T> = std::result::Result<T, ArenaError>;
