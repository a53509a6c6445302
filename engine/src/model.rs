//! Core data model for transfer requests.
//!
//! A `TransferRequest` is the immutable description of one source to
//! destination operation. Directory requests carry the ids of their child
//! requests; the engine resolves all children before the parent finishes.
//! Runtime state (cancellation, overwrite grants) lives inside the engine,
//! not here.

use std::path::PathBuf;

use bitflags::bitflags;
use uuid::Uuid;

/// Opaque handle correlating asynchronous events with a request.
///
/// The facade allocates one per request; callers building request trees by
/// hand may allocate their own with `RequestId::new_v4()`.
pub type RequestId = Uuid;

bitflags! {
    /// Behavior flags for a single request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CopyFlags: u32 {
        /// Never suspend for interactive resolution; conflicts auto-resolve
        /// (an existing destination is overwritten without asking).
        const NON_INTERACTIVE = 0x01;
        /// Delete an existing destination file that cannot be opened for
        /// writing, then retry the open once.
        const FORCE = 0x02;
        /// Create a symbolic link at the destination instead of copying.
        const MAKE_LINKS = 0x04;
        /// Copy the contents a symlink points at rather than the link itself.
        const FOLLOW_LINKS = 0x08;
    }
}

/// Immutable facts describing one source -> destination operation.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Full source path
    pub source: PathBuf,

    /// Full destination path
    pub destination: PathBuf,

    /// Move (source removed on success) rather than copy
    pub is_move: bool,

    /// Directory-tree request; `children` holds the subtree
    pub is_dir: bool,

    /// Behavior flags
    pub flags: CopyFlags,

    /// Child request ids, in resolution order. Populated only when `is_dir`.
    /// Every child must be enqueued after its parent so the engine picks
    /// parents first.
    pub children: Vec<RequestId>,
}

impl TransferRequest {
    /// A single-file copy request.
    pub fn file(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, flags: CopyFlags) -> Self {
        TransferRequest {
            source: source.into(),
            destination: destination.into(),
            is_move: false,
            is_dir: false,
            flags,
            children: Vec::new(),
        }
    }

    /// A directory request; children are attached by the tree builder.
    pub fn directory(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        flags: CopyFlags,
        children: Vec<RequestId>,
    ) -> Self {
        TransferRequest {
            source: source.into(),
            destination: destination.into(),
            is_move: false,
            is_dir: true,
            flags,
            children,
        }
    }

    /// Turn a copy request into a move request.
    pub fn moving(mut self) -> Self {
        self.is_move = true;
        self
    }
}
