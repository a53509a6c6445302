//! Public facade over the transfer engine.
//!
//! `FileCopier` allocates request ids, builds request trees for directory
//! operations, and forwards every control call to its engine. Callers
//! consume the engine's events from [`FileCopier::events`]; all operations
//! return immediately.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use tracing::debug;

use crate::events::{Event, State};
use crate::model::{CopyFlags, RequestId, TransferRequest};
use crate::worker::CopyEngine;

/// Asynchronous file copy/move facade.
///
/// ```no_run
/// use engine::{CopyFlags, Event, FileCopier};
///
/// let copier = FileCopier::new();
/// let events = copier.events();
/// let id = copier.copy("photo.jpg", "backup/photo.jpg", CopyFlags::empty());
///
/// for event in events.iter() {
///     match event {
///         Event::Progress { bytes, .. } => println!("{bytes} bytes"),
///         Event::Error { kind, needs_interaction: true, .. } => {
///             eprintln!("conflict: {kind}");
///             copier.overwrite();
///         }
///         Event::Finished { id: fid, failed } if fid == id => {
///             println!("done, failed: {failed}");
///             break;
///         }
///         _ => {}
///     }
/// }
/// ```
pub struct FileCopier {
    engine: CopyEngine,
}

impl FileCopier {
    pub fn new() -> Self {
        FileCopier { engine: CopyEngine::new() }
    }

    /// The engine's event stream.
    pub fn events(&self) -> Receiver<Event> {
        self.engine.events()
    }

    /// Copy one file to an explicit destination path.
    pub fn copy(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        flags: CopyFlags,
    ) -> RequestId {
        let id = RequestId::new_v4();
        self.engine.enqueue(id, TransferRequest::file(source, destination, flags));
        id
    }

    /// Copy several files into a destination directory, keeping their names.
    pub fn copy_files(
        &self,
        sources: &[PathBuf],
        destination_dir: impl AsRef<Path>,
        flags: CopyFlags,
    ) -> Vec<RequestId> {
        self.enqueue_files(sources, destination_dir.as_ref(), flags, false)
    }

    /// Copy a directory tree. The source tree is walked up front and turned
    /// into one request per entry, parents preceding children; returns the
    /// allocated ids, root first.
    pub fn copy_directory(
        &self,
        source_dir: impl AsRef<Path>,
        destination_dir: impl AsRef<Path>,
        flags: CopyFlags,
    ) -> io::Result<Vec<RequestId>> {
        self.enqueue_tree(source_dir.as_ref(), destination_dir.as_ref(), flags, false)
    }

    /// Move one file to an explicit destination path.
    pub fn move_file(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        flags: CopyFlags,
    ) -> RequestId {
        let id = RequestId::new_v4();
        self.engine
            .enqueue(id, TransferRequest::file(source, destination, flags).moving());
        id
    }

    /// Move several files into a destination directory, keeping their names.
    pub fn move_files(
        &self,
        sources: &[PathBuf],
        destination_dir: impl AsRef<Path>,
        flags: CopyFlags,
    ) -> Vec<RequestId> {
        self.enqueue_files(sources, destination_dir.as_ref(), flags, true)
    }

    /// Move a directory tree; same-volume moves collapse into a rename.
    pub fn move_directory(
        &self,
        source_dir: impl AsRef<Path>,
        destination_dir: impl AsRef<Path>,
        flags: CopyFlags,
    ) -> io::Result<Vec<RequestId>> {
        self.enqueue_tree(source_dir.as_ref(), destination_dir.as_ref(), flags, true)
    }

    fn enqueue_files(
        &self,
        sources: &[PathBuf],
        destination_dir: &Path,
        flags: CopyFlags,
        is_move: bool,
    ) -> Vec<RequestId> {
        let mut batch = Vec::with_capacity(sources.len());
        let mut ids = Vec::with_capacity(sources.len());
        for source in sources {
            let destination = match source.file_name() {
                Some(name) => destination_dir.join(name),
                None => continue,
            };
            let mut request = TransferRequest::file(source, destination, flags);
            request.is_move = is_move;
            let id = RequestId::new_v4();
            ids.push(id);
            batch.push((id, request));
        }
        self.engine.enqueue_batch(batch);
        ids
    }

    fn enqueue_tree(
        &self,
        source_dir: &Path,
        destination_dir: &Path,
        flags: CopyFlags,
        is_move: bool,
    ) -> io::Result<Vec<RequestId>> {
        let mut batch = Vec::new();
        build_tree(&mut batch, source_dir, destination_dir, flags, is_move)?;
        let ids: Vec<RequestId> = batch.iter().map(|(id, _)| *id).collect();
        debug!(
            root = %source_dir.display(),
            requests = ids.len(),
            "enqueueing directory tree"
        );
        self.engine.enqueue_batch(batch);
        Ok(ids)
    }

    /// Cancel one request and all its descendants.
    pub fn cancel(&self, id: RequestId) {
        self.engine.cancel(id);
    }

    /// Cancel everything currently queued.
    pub fn cancel_all(&self) {
        self.engine.cancel_all();
    }

    pub fn skip(&self) {
        self.engine.skip();
    }

    pub fn skip_all(&self) {
        self.engine.skip_all();
    }

    pub fn retry(&self) {
        self.engine.retry();
    }

    pub fn overwrite(&self) {
        self.engine.overwrite();
    }

    pub fn overwrite_all(&self) {
        self.engine.overwrite_all();
    }

    pub fn reset(&self) {
        self.engine.reset();
    }

    pub fn reset_skip(&self) {
        self.engine.reset_skip();
    }

    pub fn reset_overwrite(&self) {
        self.engine.reset_overwrite();
    }

    pub fn set_auto_reset(&self, on: bool) {
        self.engine.set_auto_reset(on);
    }

    pub fn set_progress_interval(&self, interval: Duration) {
        self.engine.set_progress_interval(interval);
    }

    pub fn request_progress(&self) {
        self.engine.request_progress();
    }

    pub fn state(&self) -> State {
        self.engine.state()
    }

    pub fn current_id(&self) -> Option<RequestId> {
        self.engine.current_id()
    }

    pub fn pending_requests(&self) -> Vec<RequestId> {
        self.engine.pending_requests()
    }

    pub fn source_file_path(&self, id: RequestId) -> Option<PathBuf> {
        self.engine.source_file_path(id)
    }

    pub fn destination_file_path(&self, id: RequestId) -> Option<PathBuf> {
        self.engine.destination_file_path(id)
    }

    pub fn is_dir(&self, id: RequestId) -> Option<bool> {
        self.engine.is_dir(id)
    }

    /// Remaining children of a pending directory request.
    pub fn entry_list(&self, id: RequestId) -> Vec<RequestId> {
        self.engine.children_of(id)
    }

    pub fn admitted_at(&self, id: RequestId) -> Option<DateTime<Utc>> {
        self.engine.admitted_at(id)
    }
}

impl Default for FileCopier {
    fn default() -> Self {
        FileCopier::new()
    }
}

/// Walk `source` and append one request per entry, parent before children.
/// Entries are visited in name order so batches are deterministic.
fn build_tree(
    batch: &mut Vec<(RequestId, TransferRequest)>,
    source: &Path,
    destination: &Path,
    flags: CopyFlags,
    is_move: bool,
) -> io::Result<RequestId> {
    let id = RequestId::new_v4();
    let parent_index = batch.len();
    let mut request = TransferRequest::directory(source, destination, flags, Vec::new());
    request.is_move = is_move;
    batch.push((id, request));

    let mut entries: Vec<fs::DirEntry> = fs::read_dir(source)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut children = Vec::with_capacity(entries.len());
    for entry in entries {
        let child_source = entry.path();
        let child_destination = destination.join(entry.file_name());
        let file_type = entry.file_type()?;
        // a symlinked directory is only walked when links are followed;
        // otherwise it rides through as a leaf and gets replicated
        let treat_as_dir = if file_type.is_symlink() {
            flags.contains(CopyFlags::FOLLOW_LINKS) && child_source.is_dir()
        } else {
            file_type.is_dir()
        };
        if treat_as_dir {
            children.push(build_tree(batch, &child_source, &child_destination, flags, is_move)?);
        } else {
            let mut request = TransferRequest::file(child_source, child_destination, flags);
            request.is_move = is_move;
            let child_id = RequestId::new_v4();
            children.push(child_id);
            batch.push((child_id, request));
        }
    }
    batch[parent_index].1.children = children;
    Ok(id)
}
