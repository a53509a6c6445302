//! Error vocabulary for the transfer engine.
//!
//! `ErrorKind` is the closed set of failure kinds a request can resolve with.
//! Pipeline gates never panic and never carry `io::Error` outward; they map
//! every failure onto one of these kinds. A successful attempt carries no
//! kind at all (`Option<ErrorKind>::None`), so there is no `NoError` variant.

use serde::Serialize;
use thiserror::Error;

/// Terminal or retryable failure kind for a single transfer request.
///
/// Kinds are deliberately coarse: they name the operation that failed, not
/// the underlying OS error, because the caller's recovery options
/// (skip / retry / overwrite / cancel) are the same regardless of errno.
/// The skip-set and the interactive-resolution protocol both key on this
/// enum, so it is `Copy + Eq + Hash`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Source path does not exist (and is not even a dangling symlink)
    #[error("source does not exist")]
    SourceNotExists,

    /// Destination exists and no overwrite permission was granted
    #[error("destination already exists")]
    DestinationExists,

    /// A directory request reached the file-copy stage
    #[error("source directory omitted")]
    SourceDirectoryOmitted,

    /// A non-directory source reached the directory stage
    #[error("source file omitted")]
    SourceFileOmitted,

    /// Parent of the destination directory does not exist
    #[error("path to destination does not exist")]
    PathToDestinationNotExists,

    /// Destination directory could not be created, or exists as a non-directory
    #[error("cannot create destination directory")]
    CannotCreateDestinationDirectory,

    /// Source file could not be opened for reading
    #[error("cannot open source file")]
    CannotOpenSourceFile,

    /// Destination file could not be opened for writing
    #[error("cannot open destination file")]
    CannotOpenDestinationFile,

    /// Forced removal of an existing destination file failed
    #[error("cannot remove destination file")]
    CannotRemoveDestinationFile,

    /// Symbolic link creation at the destination failed
    #[error("cannot create symbolic link")]
    CannotCreateSymLink,

    /// Read from the source file failed mid-copy
    #[error("cannot read source file")]
    CannotReadSourceFile,

    /// Write to the destination file failed or was short
    #[error("cannot write destination file")]
    CannotWriteDestinationFile,

    /// Source removal after a successful move-copy failed
    #[error("cannot remove source")]
    CannotRemoveSource,

    /// Request was cancelled by the caller
    #[error("cancelled")]
    Cancelled,
}
