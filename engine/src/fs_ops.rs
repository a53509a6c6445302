//! Filesystem primitives used by the policy pipeline.
//!
//! Everything here is a thin, synchronous wrapper over `std::fs` with the
//! symlink-awareness the pipeline needs: existence checks that count
//! dangling symlinks, link creation with platform-appropriate targets, and
//! metadata mirroring. Error classification happens in the pipeline, not
//! here, so these return plain `io::Result`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// True if the path exists, counting dangling symlinks as existing.
///
/// A symlink whose target is gone is still a copyable entity (the link
/// itself can be replicated), so plain `Path::exists` is not enough.
pub fn exists_or_symlink(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// True if the path itself is a symbolic link.
pub fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// True if the path's parent directory exists.
///
/// An empty parent means a bare relative name in the current directory,
/// which counts as existing.
pub fn parent_exists(path: &Path) -> bool {
    match path.parent() {
        Some(p) if p.as_os_str().is_empty() => true,
        Some(p) => p.is_dir(),
        None => false,
    }
}

/// Remove a source after a successful move-copy: directories with `rmdir`
/// semantics (children must already be gone), anything else with unlink.
pub fn remove_source(path: &Path) -> io::Result<()> {
    let meta = path.symlink_metadata()?;
    if meta.is_dir() && !meta.file_type().is_symlink() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}

/// Create a symbolic link at `link` pointing at `target`.
///
/// `target` is stored verbatim, so relative targets stay relative.
#[cfg(unix)]
pub fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

/// Create a symbolic link at `link` pointing at `target`.
///
/// Windows distinguishes file and directory links, so the target is
/// resolved against the link's directory to pick the right primitive.
#[cfg(windows)]
pub fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    let resolved = if target.is_absolute() {
        target.to_path_buf()
    } else {
        link.parent().unwrap_or(Path::new("")).join(target)
    };
    if resolved.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

/// Read the raw target a symlink points at, without resolving it.
pub fn symlink_target(path: &Path) -> io::Result<PathBuf> {
    fs::read_link(path)
}

/// Express `path` relative to `base` by stripping the shared prefix and
/// climbing with `..` components. Both paths should be absolute.
pub fn relative_from(path: &Path, base: &Path) -> PathBuf {
    let path_components: Vec<_> = path.components().collect();
    let base_components: Vec<_> = base.components().collect();

    let mut shared = 0;
    while shared < path_components.len()
        && shared < base_components.len()
        && path_components[shared] == base_components[shared]
    {
        shared += 1;
    }

    let mut rel = PathBuf::new();
    for _ in shared..base_components.len() {
        rel.push("..");
    }
    for component in &path_components[shared..] {
        rel.push(component);
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

/// The link target to store when `MAKE_LINKS` replaces a copy: absolute on
/// Windows, relative to the destination's directory elsewhere.
pub fn link_target_for(source: &Path, destination: &Path) -> PathBuf {
    if cfg!(windows) {
        std::path::absolute(source).unwrap_or_else(|_| source.to_path_buf())
    } else {
        let dest_parent = destination.parent().unwrap_or(Path::new(""));
        match (std::path::absolute(source), std::path::absolute(dest_parent)) {
            (Ok(src), Ok(parent)) => relative_from(&src, &parent),
            _ => source.to_path_buf(),
        }
    }
}

/// Mirror permission bits and modification time from source metadata onto
/// the destination. Failures here never fail the transfer.
pub fn mirror_metadata(src_meta: &fs::Metadata, destination: &Path) {
    let _ = fs::set_permissions(destination, src_meta.permissions());
    if let Ok(mtime) = src_meta.modified() {
        let _ = filetime::set_file_mtime(destination, filetime::FileTime::from_system_time(mtime));
    }
}
