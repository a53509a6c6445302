//! Policy pipeline deciding how a single request is carried out.
//!
//! Each attempt runs the request through a fixed, ordered list of gates.
//! A gate either passes control to the next gate or breaks out with an
//! [`Attempt`]: `resolved` marks a terminal outcome, an unresolved attempt
//! with an error is a candidate for interactive resolution (the engine
//! decides). The list is rebuilt implicitly on every attempt, so grants
//! made while the worker was suspended (overwrite, overwrite-all) take
//! effect on the next run.
//!
//! Gate order: cancellation first (cheapest short-circuit), then source
//! existence, overwrite permission, the two symlink strategies, the rename
//! fast path for moves, the actual transfer (directory recursion or block
//! copy), and finally source removal for moves.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::ops::ControlFlow;

use tracing::{trace, warn};

use crate::error::ErrorKind;
use crate::fs_ops;
use crate::model::{CopyFlags, RequestId, TransferRequest};
use crate::worker::Worker;

/// One pipeline evaluation's outcome.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Attempt {
    /// Terminal: the request will not be re-attempted.
    pub resolved: bool,
    /// Failure kind; `None` means success (only meaningful when resolved).
    pub error: Option<ErrorKind>,
}

impl Attempt {
    fn ok() -> Self {
        Attempt { resolved: true, error: None }
    }

    fn fail(kind: ErrorKind) -> Self {
        Attempt { resolved: false, error: Some(kind) }
    }

    fn terminal(kind: ErrorKind) -> Self {
        Attempt { resolved: true, error: Some(kind) }
    }
}

/// Runtime bits snapshotted from the pending entry for this attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttemptCtx {
    pub cancelled: bool,
    pub overwrite: bool,
    pub move_removal_failed: bool,
}

struct GateCx<'a> {
    id: RequestId,
    request: &'a TransferRequest,
    ctx: AttemptCtx,
}

type Gate = fn(&Worker, &GateCx<'_>) -> ControlFlow<Attempt>;

const GATES: [Gate; 8] = [
    cancelled,
    source_exists,
    overwrite,
    make_links,
    follow_links,
    rename_in_place,
    transfer,
    remove_moved_source,
];

/// Evaluate one attempt for `id`. Falling off the end of the gate list is a
/// successful resolution.
pub(crate) fn run(worker: &Worker, id: RequestId, request: &TransferRequest, ctx: AttemptCtx) -> Attempt {
    let cx = GateCx { id, request, ctx };
    for gate in GATES {
        if let ControlFlow::Break(attempt) = gate(worker, &cx) {
            return attempt;
        }
    }
    Attempt::ok()
}

/// Cancelled entries resolve immediately; a cancelled directory takes its
/// still-queued descendants with it, unprocessed.
fn cancelled(worker: &Worker, cx: &GateCx<'_>) -> ControlFlow<Attempt> {
    if !cx.ctx.cancelled {
        return ControlFlow::Continue(());
    }
    if cx.request.is_dir {
        worker.discard_subtree(cx.id);
    }
    ControlFlow::Break(Attempt::terminal(ErrorKind::Cancelled))
}

fn source_exists(_worker: &Worker, cx: &GateCx<'_>) -> ControlFlow<Attempt> {
    if fs_ops::exists_or_symlink(&cx.request.source) {
        ControlFlow::Continue(())
    } else {
        ControlFlow::Break(Attempt::fail(ErrorKind::SourceNotExists))
    }
}

/// `NON_INTERACTIVE` always implies permission; otherwise permission must
/// have been granted interactively (per-entry or session-wide).
fn overwrite(_worker: &Worker, cx: &GateCx<'_>) -> ControlFlow<Attempt> {
    let granted = cx.request.flags.contains(CopyFlags::NON_INTERACTIVE) || cx.ctx.overwrite;
    if fs_ops::exists_or_symlink(&cx.request.destination) && !granted {
        ControlFlow::Break(Attempt::fail(ErrorKind::DestinationExists))
    } else {
        ControlFlow::Continue(())
    }
}

/// `MAKE_LINKS`: link at the destination pointing back at the source.
fn make_links(_worker: &Worker, cx: &GateCx<'_>) -> ControlFlow<Attempt> {
    if !cx.request.flags.contains(CopyFlags::MAKE_LINKS) {
        return ControlFlow::Continue(());
    }
    let target = fs_ops::link_target_for(&cx.request.source, &cx.request.destination);
    match fs_ops::make_symlink(&target, &cx.request.destination) {
        Ok(()) => ControlFlow::Break(Attempt::ok()),
        Err(_) => ControlFlow::Break(Attempt::fail(ErrorKind::CannotCreateSymLink)),
    }
}

/// A symlink source without `FOLLOW_LINKS` is replicated as a link carrying
/// the same target text, so relative targets stay relative.
fn follow_links(_worker: &Worker, cx: &GateCx<'_>) -> ControlFlow<Attempt> {
    if !fs_ops::is_symlink(&cx.request.source) || cx.request.flags.contains(CopyFlags::FOLLOW_LINKS) {
        return ControlFlow::Continue(());
    }
    let replicated = fs_ops::symlink_target(&cx.request.source)
        .and_then(|target| fs_ops::make_symlink(&target, &cx.request.destination));
    match replicated {
        Ok(()) => ControlFlow::Break(Attempt::ok()),
        Err(_) => ControlFlow::Break(Attempt::fail(ErrorKind::CannotCreateSymLink)),
    }
}

/// Same-volume move fast path: a metadata rename instead of copy + delete.
///
/// Applies when link-following is off, or when the source is a plain
/// non-symlink file (following a file symlink must materialize the target's
/// bytes, which a rename would not). Failure is not an error; the generic
/// copy path takes over.
fn rename_in_place(worker: &Worker, cx: &GateCx<'_>) -> ControlFlow<Attempt> {
    if !cx.request.is_move {
        return ControlFlow::Continue(());
    }
    let plain_file = !cx.request.is_dir && !fs_ops::is_symlink(&cx.request.source);
    if !cx.request.flags.contains(CopyFlags::FOLLOW_LINKS) || plain_file {
        if fs::rename(&cx.request.source, &cx.request.destination).is_ok() {
            trace!(id = %cx.id, "renamed in place");
            if cx.request.is_dir {
                while let Some(child) = worker.next_child(cx.id) {
                    worker.finish_renamed(child);
                }
            } else {
                let size = fs::metadata(&cx.request.destination).map(|m| m.len()).unwrap_or(0);
                worker.emit_progress(cx.id, size);
            }
            return ControlFlow::Break(Attempt::ok());
        }
    }
    ControlFlow::Continue(())
}

/// Directory recursion or block copy. Continues on success so source
/// removal can follow for moves. Skipped entirely when a previous attempt
/// already copied everything but failed to remove the source, so a retry
/// goes straight back to the removal.
fn transfer(worker: &Worker, cx: &GateCx<'_>) -> ControlFlow<Attempt> {
    if cx.ctx.move_removal_failed {
        return ControlFlow::Continue(());
    }
    if cx.request.is_dir {
        copy_dir(worker, cx)
    } else {
        copy_file(worker, cx)
    }
}

/// After an error-free transfer of a move request, drop the source.
fn remove_moved_source(worker: &Worker, cx: &GateCx<'_>) -> ControlFlow<Attempt> {
    if !cx.request.is_move {
        return ControlFlow::Continue(());
    }
    match fs_ops::remove_source(&cx.request.source) {
        Ok(()) => {
            worker.set_move_removal_failed(cx.id, false);
            ControlFlow::Continue(())
        }
        Err(err) => {
            warn!(id = %cx.id, source = %cx.request.source.display(), %err, "move: source removal failed");
            worker.set_move_removal_failed(cx.id, true);
            ControlFlow::Break(Attempt::fail(ErrorKind::CannotRemoveSource))
        }
    }
}

/// Ensure the destination directory, then resolve every child through the
/// engine's full entry path. Does not copy bytes itself.
fn copy_dir(worker: &Worker, cx: &GateCx<'_>) -> ControlFlow<Attempt> {
    if !cx.request.source.is_dir() {
        return ControlFlow::Break(Attempt::fail(ErrorKind::SourceFileOmitted));
    }

    match cx.request.destination.symlink_metadata() {
        Ok(meta) if meta.is_dir() && !meta.file_type().is_symlink() => {}
        Ok(_) => {
            // exists, but as a file or symlink
            return ControlFlow::Break(Attempt::fail(ErrorKind::CannotCreateDestinationDirectory));
        }
        Err(_) => {
            if !fs_ops::parent_exists(&cx.request.destination) {
                return ControlFlow::Break(Attempt::fail(ErrorKind::PathToDestinationNotExists));
            }
            if fs::create_dir(&cx.request.destination).is_err() {
                return ControlFlow::Break(Attempt::fail(ErrorKind::CannotCreateDestinationDirectory));
            }
        }
    }

    while let Some(child) = worker.next_child(cx.id) {
        if worker.entry_cancelled(child) {
            // cascade-cancelled while the parent was mid-flight: drop the
            // subtree without processing, no events
            worker.discard_subtree(child);
            worker.remove_entry(child);
        } else {
            worker.resolve(child);
        }
    }

    if worker.is_cancelled(cx.id) {
        return ControlFlow::Break(Attempt::terminal(ErrorKind::Cancelled));
    }
    ControlFlow::Continue(())
}

const COPY_BLOCK_SIZE: usize = 4096;

/// Leaf: block copy with per-block cancellation checks and pull-throttled
/// progress. The final block always reports completion.
fn copy_file(worker: &Worker, cx: &GateCx<'_>) -> ControlFlow<Attempt> {
    if cx.request.is_dir {
        return ControlFlow::Break(Attempt::fail(ErrorKind::SourceDirectoryOmitted));
    }

    let mut source = match File::open(&cx.request.source) {
        Ok(f) => f,
        Err(_) => return ControlFlow::Break(Attempt::fail(ErrorKind::CannotOpenSourceFile)),
    };

    let dest = &cx.request.destination;
    let mut destination = match File::create(dest) {
        Ok(f) => f,
        Err(_) if cx.request.flags.contains(CopyFlags::FORCE) => {
            if fs::remove_file(dest).is_err() {
                return ControlFlow::Break(Attempt::fail(ErrorKind::CannotRemoveDestinationFile));
            }
            match File::create(dest) {
                Ok(f) => f,
                Err(_) => return ControlFlow::Break(Attempt::fail(ErrorKind::CannotOpenDestinationFile)),
            }
        }
        Err(_) => return ControlFlow::Break(Attempt::fail(ErrorKind::CannotOpenDestinationFile)),
    };

    let mut progress: u64 = 0;
    let mut buf = [0u8; COPY_BLOCK_SIZE];
    let mut resolved = false;
    let mut error = None;
    loop {
        if worker.is_cancelled(cx.id) {
            error = Some(ErrorKind::Cancelled);
            resolved = true;
            break;
        }

        let read = match source.read(&mut buf) {
            Ok(n) => n,
            Err(_) => {
                error = Some(ErrorKind::CannotReadSourceFile);
                break;
            }
        };
        if read == 0 {
            worker.emit_progress(cx.id, progress);
            break;
        }

        if destination.write_all(&buf[..read]).is_err() {
            error = Some(ErrorKind::CannotWriteDestinationFile);
            break;
        }
        progress += read as u64;

        if worker.should_emit_progress() {
            worker.emit_progress(cx.id, progress);
        }
    }
    drop(destination);

    if let Some(kind) = error {
        // best-effort cleanup; never overrides the primary error
        if let Err(err) = fs::remove_file(dest) {
            warn!(destination = %dest.display(), %err, "failed to remove partial destination");
        }
        ControlFlow::Break(Attempt { resolved, error: Some(kind) })
    } else {
        if let Ok(meta) = source.metadata() {
            fs_ops::mirror_metadata(&meta, dest);
        }
        ControlFlow::Continue(())
    }
}
