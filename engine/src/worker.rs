//! The transfer engine: pending-entry queue, dedicated worker thread, and
//! the cross-thread interaction protocol.
//!
//! One `CopyEngine` owns one worker. All shared mutable state sits behind a
//! single mutex; two condition variables coordinate the thread boundary:
//! `work_available` wakes an idle worker when requests arrive, `interaction`
//! releases a worker suspended on a conflict once the caller decides
//! (skip / retry / overwrite, each with an "all" variant). Engines are plain
//! values; any number can coexist in one process.
//!
//! Queue order across independent top-level requests is FIFO by admission.
//! Within a directory request, all descendants resolve before the parent's
//! `Finished` event fires.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::ErrorKind;
use crate::events::{Event, State};
use crate::model::{CopyFlags, RequestId, TransferRequest};
use crate::pipeline::{self, AttemptCtx};

/// Engine-owned runtime wrapper around one admitted request.
struct PendingEntry {
    request: TransferRequest,
    cancelled: bool,
    overwrite_granted: bool,
    move_removal_failed: bool,
    /// Children not yet drained by the directory stage.
    children: VecDeque<RequestId>,
    admitted_at: DateTime<Utc>,
}

impl PendingEntry {
    fn new(request: TransferRequest) -> Self {
        let children = request.children.iter().copied().collect();
        PendingEntry {
            request,
            cancelled: false,
            overwrite_granted: false,
            move_removal_failed: false,
            children,
            admitted_at: Utc::now(),
        }
    }
}

struct Inner {
    queue: HashMap<RequestId, PendingEntry>,
    /// Admission order; ids whose entry is gone are skipped on pop.
    order: VecDeque<RequestId>,
    state: State,
    current_id: Option<RequestId>,
    waiting_for_interaction: bool,
    stop_requested: bool,
    cancel_all_requested: bool,
    skip_all_requested: bool,
    skip_set: HashSet<ErrorKind>,
    overwrite_all: bool,
    progress_requested: bool,
    progress_interval: Duration,
    last_progress_emit: Option<Instant>,
    auto_reset: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            queue: HashMap::new(),
            order: VecDeque::new(),
            state: State::Idle,
            current_id: None,
            waiting_for_interaction: false,
            stop_requested: false,
            cancel_all_requested: false,
            skip_all_requested: false,
            skip_set: HashSet::new(),
            overwrite_all: false,
            progress_requested: false,
            progress_interval: Duration::ZERO,
            last_progress_emit: None,
            auto_reset: true,
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    work_available: Condvar,
    interaction: Condvar,
    events_tx: Sender<Event>,
}

/// Mark `id` and every descendant as cancelled, without removing anything.
fn mark_cancelled(inner: &mut Inner, id: RequestId) {
    let children: Vec<RequestId> = match inner.queue.get_mut(&id) {
        Some(entry) => {
            entry.cancelled = true;
            entry.children.iter().copied().collect()
        }
        None => return,
    };
    for child in children {
        mark_cancelled(inner, child);
    }
}

/// Grant overwrite permission to `id` and every descendant.
fn mark_overwrite(inner: &mut Inner, id: RequestId) {
    let children: Vec<RequestId> = match inner.queue.get_mut(&id) {
        Some(entry) => {
            entry.overwrite_granted = true;
            entry.children.iter().copied().collect()
        }
        None => return,
    };
    for child in children {
        mark_overwrite(inner, child);
    }
}

/// Remove every descendant of `id` from the queue, unprocessed.
fn discard_children(inner: &mut Inner, id: RequestId) {
    let children: Vec<RequestId> = match inner.queue.get_mut(&id) {
        Some(entry) => entry.children.drain(..).collect(),
        None => return,
    };
    for child in children {
        discard_children(inner, child);
        inner.queue.remove(&child);
    }
}

/// Worker-side handle; all pipeline evaluation and recursion run through
/// these methods on the worker's own call stack.
pub(crate) struct Worker {
    shared: Arc<Shared>,
}

impl Worker {
    fn emit(&self, event: Event) {
        let _ = self.shared.events_tx.send(event);
    }

    fn set_state_locked(&self, inner: &mut Inner, state: State) {
        if inner.state != state {
            inner.state = state;
            self.emit(Event::StateChanged { state });
        }
    }

    fn run(&self) {
        debug!("transfer worker started");
        loop {
            let mut inner = self.shared.inner.lock();
            if inner.stop_requested {
                break;
            }
            if inner.queue.is_empty() {
                inner.progress_requested = false;
                inner.cancel_all_requested = false;
                self.set_state_locked(&mut inner, State::Idle);
                self.shared.work_available.wait(&mut inner);
                if inner.auto_reset {
                    inner.overwrite_all = false;
                    inner.skip_set.clear();
                }
                continue;
            }
            if inner.cancel_all_requested {
                let dropped = inner.queue.len();
                inner.queue.clear();
                inner.order.clear();
                inner.cancel_all_requested = false;
                drop(inner);
                debug!(dropped, "queue dropped by cancel-all");
                self.emit(Event::CancelledBatch);
                continue;
            }
            let next = loop {
                match inner.order.pop_front() {
                    Some(id) if inner.queue.contains_key(&id) => break Some(id),
                    Some(_) => continue,
                    None => break None,
                }
            };
            let Some(id) = next else {
                inner.queue.clear();
                continue;
            };
            self.set_state_locked(&mut inner, State::Busy);
            drop(inner);
            self.resolve(id);
        }
        debug!("transfer worker stopped");
    }

    /// Resolve one request to a terminal outcome, re-running the pipeline
    /// after every interactive decision. Called recursively for directory
    /// children.
    pub(crate) fn resolve(&self, id: RequestId) {
        let request;
        let old_current;
        {
            let mut inner = self.shared.inner.lock();
            if inner.cancel_all_requested || inner.stop_requested {
                return;
            }
            let Some(entry) = inner.queue.get(&id) else { return };
            request = entry.request.clone();
            old_current = inner.current_id.replace(id);
        }
        debug!(%id, source = %request.source.display(), "resolving");
        self.emit(Event::Started { id });

        let mut done = false;
        let mut error: Option<ErrorKind> = None;
        while !done {
            let ctx = {
                let inner = self.shared.inner.lock();
                match inner.queue.get(&id) {
                    Some(entry) => AttemptCtx {
                        cancelled: entry.cancelled,
                        overwrite: entry.overwrite_granted || inner.overwrite_all,
                        move_removal_failed: entry.move_removal_failed,
                    },
                    None => break,
                }
            };
            let attempt = pipeline::run(self, id, &request, ctx);
            done = attempt.resolved;
            error = attempt.error;

            if done || request.flags.contains(CopyFlags::NON_INTERACTIVE) {
                done = true;
                if let Some(kind) = error {
                    self.emit(Event::Error { id, kind, needs_interaction: false });
                }
                continue;
            }
            let Some(kind) = error else {
                done = true;
                continue;
            };

            let mut inner = self.shared.inner.lock();
            if inner.stop_requested || inner.skip_set.contains(&kind) {
                done = true;
                if !inner.stop_requested {
                    self.emit(Event::Error { id, kind, needs_interaction: false });
                }
            } else {
                self.emit(Event::Error { id, kind, needs_interaction: true });
                inner.waiting_for_interaction = true;
                self.set_state_locked(&mut inner, State::WaitingForInteraction);
                debug!(%id, ?kind, "suspended awaiting interaction");
                while inner.waiting_for_interaction && !inner.stop_requested {
                    self.shared.interaction.wait(&mut inner);
                }
                if inner.waiting_for_interaction {
                    // shutdown observed while suspended: resolve as cancelled
                    inner.waiting_for_interaction = false;
                    if let Some(entry) = inner.queue.get_mut(&id) {
                        entry.cancelled = true;
                    }
                    done = true;
                    error = Some(ErrorKind::Cancelled);
                }
                if inner.skip_all_requested {
                    inner.skip_all_requested = false;
                    inner.skip_set.insert(kind);
                }
                self.set_state_locked(&mut inner, State::Busy);
                debug!(%id, "resumed");
            }
        }

        self.emit(Event::Finished { id, failed: error.is_some() });
        let mut inner = self.shared.inner.lock();
        inner.current_id = old_current;
        inner.queue.remove(&id);
    }

    /// Finish a subtree whose bytes moved with the parent's rename: emit the
    /// same started / progress / finished sequence without touching the
    /// filesystem beyond a size probe.
    pub(crate) fn finish_renamed(&self, id: RequestId) {
        let is_dir;
        let destination;
        let old_current;
        {
            let mut inner = self.shared.inner.lock();
            let Some(entry) = inner.queue.get(&id) else { return };
            is_dir = entry.request.is_dir;
            destination = entry.request.destination.clone();
            old_current = inner.current_id.replace(id);
        }
        self.emit(Event::Started { id });

        while let Some(child) = self.next_child(id) {
            self.finish_renamed(child);
        }

        if !is_dir {
            let size = std::fs::metadata(&destination).map(|m| m.len()).unwrap_or(0);
            self.emit_progress(id, size);
        }

        self.emit(Event::Finished { id, failed: false });
        let mut inner = self.shared.inner.lock();
        inner.current_id = old_current;
        inner.queue.remove(&id);
    }

    /// Pop the next undrained child of `id`.
    pub(crate) fn next_child(&self, id: RequestId) -> Option<RequestId> {
        let mut inner = self.shared.inner.lock();
        inner.queue.get_mut(&id).and_then(|entry| entry.children.pop_front())
    }

    /// Drop every descendant of `id` from the queue, unprocessed.
    pub(crate) fn discard_subtree(&self, id: RequestId) {
        let mut inner = self.shared.inner.lock();
        discard_children(&mut inner, id);
    }

    /// Remove a single entry without events (cascade-cancelled children).
    pub(crate) fn remove_entry(&self, id: RequestId) {
        let mut inner = self.shared.inner.lock();
        inner.queue.remove(&id);
    }

    /// Cancellation as seen mid-transfer: the entry's own flag, a pending
    /// cancel-all, or engine shutdown.
    pub(crate) fn is_cancelled(&self, id: RequestId) -> bool {
        let inner = self.shared.inner.lock();
        inner.cancel_all_requested
            || inner.stop_requested
            || inner.queue.get(&id).map(|e| e.cancelled).unwrap_or(false)
    }

    /// The entry's own cancellation flag only.
    pub(crate) fn entry_cancelled(&self, id: RequestId) -> bool {
        let inner = self.shared.inner.lock();
        inner.queue.get(&id).map(|e| e.cancelled).unwrap_or(false)
    }

    pub(crate) fn set_move_removal_failed(&self, id: RequestId, failed: bool) {
        let mut inner = self.shared.inner.lock();
        if let Some(entry) = inner.queue.get_mut(&id) {
            entry.move_removal_failed = failed;
        }
    }

    /// Whether a mid-file progress emission is due: an explicit pull request,
    /// or the configured interval elapsed since the last emission.
    pub(crate) fn should_emit_progress(&self) -> bool {
        let inner = self.shared.inner.lock();
        if inner.progress_requested {
            return true;
        }
        if inner.progress_interval.is_zero() {
            return false;
        }
        inner
            .last_progress_emit
            .map_or(true, |at| at.elapsed() >= inner.progress_interval)
    }

    /// Emit a progress event and consume the outstanding pull request.
    pub(crate) fn emit_progress(&self, id: RequestId, bytes: u64) {
        let mut inner = self.shared.inner.lock();
        inner.progress_requested = false;
        inner.last_progress_emit = Some(Instant::now());
        self.emit(Event::Progress { id, bytes });
    }
}

/// A file copy/move engine with one dedicated worker thread.
///
/// Requests are admitted with [`CopyEngine::enqueue`] and resolved in
/// admission order. Conflicts that need a decision suspend the worker and
/// surface as [`Event::Error`] with `needs_interaction`; the caller resumes
/// it through [`skip`](CopyEngine::skip), [`retry`](CopyEngine::retry),
/// [`overwrite`](CopyEngine::overwrite) or their "all" variants. Dropping
/// the engine stops the worker; a suspended request resolves as cancelled.
pub struct CopyEngine {
    shared: Arc<Shared>,
    events: Receiver<Event>,
    worker: Option<JoinHandle<()>>,
}

impl CopyEngine {
    pub fn new() -> Self {
        let (events_tx, events) = unbounded();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            work_available: Condvar::new(),
            interaction: Condvar::new(),
            events_tx,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || Worker { shared: worker_shared }.run());
        CopyEngine {
            shared,
            events,
            worker: Some(worker),
        }
    }

    /// A handle to the engine's event stream. Clones share one stream; each
    /// event is delivered to exactly one receiver call.
    pub fn events(&self) -> Receiver<Event> {
        self.events.clone()
    }

    /// Admit one request; wakes the worker if idle.
    pub fn enqueue(&self, id: RequestId, request: TransferRequest) {
        self.enqueue_batch(vec![(id, request)]);
    }

    /// Admit a batch in order. Parents must precede their children.
    pub fn enqueue_batch(&self, requests: Vec<(RequestId, TransferRequest)>) {
        if requests.is_empty() {
            return;
        }
        let mut inner = self.shared.inner.lock();
        debug!(count = requests.len(), "admitting requests");
        for (id, request) in requests {
            inner.order.push_back(id);
            inner.queue.insert(id, PendingEntry::new(request));
        }
        self.shared.work_available.notify_one();
    }

    /// Cascade a cancellation flag to `id` and all its descendants. The
    /// entries resolve as `Cancelled` when the worker reaches them; queued
    /// descendants of a cancelled directory are dropped without starting.
    pub fn cancel(&self, id: RequestId) {
        let mut inner = self.shared.inner.lock();
        mark_cancelled(&mut inner, id);
    }

    /// Cancel everything: the current request aborts at the next block
    /// boundary and the rest of the queue is dropped atomically with a
    /// single [`Event::CancelledBatch`].
    pub fn cancel_all(&self) {
        let mut inner = self.shared.inner.lock();
        for entry in inner.queue.values_mut() {
            entry.cancelled = true;
        }
        inner.cancel_all_requested = true;
    }

    /// Resume a suspended worker, abandoning the current request (it and
    /// its descendants resolve as cancelled). No-op unless suspended.
    pub fn skip(&self) {
        let mut inner = self.shared.inner.lock();
        if !inner.waiting_for_interaction {
            return;
        }
        if let Some(current) = inner.current_id {
            mark_cancelled(&mut inner, current);
        }
        self.resume(&mut inner);
    }

    /// [`skip`](CopyEngine::skip), plus the triggering error kind joins the
    /// skip-set so future occurrences auto-resolve without asking.
    pub fn skip_all(&self) {
        let mut inner = self.shared.inner.lock();
        if !inner.waiting_for_interaction {
            return;
        }
        if let Some(current) = inner.current_id {
            mark_cancelled(&mut inner, current);
        }
        inner.skip_all_requested = true;
        self.resume(&mut inner);
    }

    /// Resume a suspended worker and re-attempt the same request unchanged.
    pub fn retry(&self) {
        let mut inner = self.shared.inner.lock();
        if !inner.waiting_for_interaction {
            return;
        }
        self.resume(&mut inner);
    }

    /// Resume a suspended worker, granting overwrite permission to the
    /// current request and its descendants.
    pub fn overwrite(&self) {
        let mut inner = self.shared.inner.lock();
        if !inner.waiting_for_interaction {
            return;
        }
        if let Some(current) = inner.current_id {
            mark_overwrite(&mut inner, current);
        }
        self.resume(&mut inner);
    }

    /// [`overwrite`](CopyEngine::overwrite), plus a session-wide grant
    /// covering every later request until reset.
    pub fn overwrite_all(&self) {
        let mut inner = self.shared.inner.lock();
        if !inner.waiting_for_interaction {
            return;
        }
        if let Some(current) = inner.current_id {
            mark_overwrite(&mut inner, current);
        }
        inner.overwrite_all = true;
        self.resume(&mut inner);
    }

    fn resume(&self, inner: &mut Inner) {
        inner.waiting_for_interaction = false;
        self.shared.interaction.notify_one();
    }

    /// When enabled (the default), the skip-set and the overwrite-all grant
    /// are cleared whenever the worker wakes from idle, so conflict policy
    /// does not leak across unrelated batches.
    pub fn set_auto_reset(&self, on: bool) {
        self.shared.inner.lock().auto_reset = on;
    }

    /// Clear both the skip-set and the overwrite-all grant.
    pub fn reset(&self) {
        let mut inner = self.shared.inner.lock();
        inner.skip_set.clear();
        inner.overwrite_all = false;
    }

    pub fn reset_skip(&self) {
        self.shared.inner.lock().skip_set.clear();
    }

    pub fn reset_overwrite(&self) {
        self.shared.inner.lock().overwrite_all = false;
    }

    /// Cadence for unsolicited mid-file progress events. Zero (the default)
    /// means progress is only emitted on [`request_progress`] pulls and at
    /// file completion.
    ///
    /// [`request_progress`]: CopyEngine::request_progress
    pub fn set_progress_interval(&self, interval: Duration) {
        self.shared.inner.lock().progress_interval = interval;
    }

    /// Ask for one progress event; the next copied block emits it.
    pub fn request_progress(&self) {
        self.shared.inner.lock().progress_requested = true;
    }

    pub fn state(&self) -> State {
        self.shared.inner.lock().state
    }

    /// The request currently being resolved, if any.
    pub fn current_id(&self) -> Option<RequestId> {
        self.shared.inner.lock().current_id
    }

    /// Ids of all unresolved requests in admission order.
    pub fn pending_requests(&self) -> Vec<RequestId> {
        let inner = self.shared.inner.lock();
        let mut ids: Vec<RequestId> = Vec::new();
        if let Some(current) = inner.current_id {
            if inner.queue.contains_key(&current) {
                ids.push(current);
            }
        }
        for id in &inner.order {
            if inner.queue.contains_key(id) && !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }

    pub fn source_file_path(&self, id: RequestId) -> Option<PathBuf> {
        let inner = self.shared.inner.lock();
        inner.queue.get(&id).map(|e| e.request.source.clone())
    }

    pub fn destination_file_path(&self, id: RequestId) -> Option<PathBuf> {
        let inner = self.shared.inner.lock();
        inner.queue.get(&id).map(|e| e.request.destination.clone())
    }

    pub fn is_dir(&self, id: RequestId) -> Option<bool> {
        let inner = self.shared.inner.lock();
        inner.queue.get(&id).map(|e| e.request.is_dir)
    }

    /// Remaining (undrained) children of a pending directory request.
    pub fn children_of(&self, id: RequestId) -> Vec<RequestId> {
        let inner = self.shared.inner.lock();
        inner
            .queue
            .get(&id)
            .map(|e| e.children.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn admitted_at(&self, id: RequestId) -> Option<DateTime<Utc>> {
        let inner = self.shared.inner.lock();
        inner.queue.get(&id).map(|e| e.admitted_at)
    }
}

impl Default for CopyEngine {
    fn default() -> Self {
        CopyEngine::new()
    }
}

impl Drop for CopyEngine {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.stop_requested = true;
            self.shared.work_available.notify_all();
            self.shared.interaction.notify_all();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransferRequest;
    use std::fs;

    fn recv_event(rx: &Receiver<Event>) -> Event {
        rx.recv_timeout(Duration::from_secs(10))
            .expect("timed out waiting for event")
    }

    fn wait_for(rx: &Receiver<Event>, mut pred: impl FnMut(&Event) -> bool) -> Event {
        loop {
            let event = recv_event(rx);
            if pred(&event) {
                return event;
            }
        }
    }

    fn wait_finished(rx: &Receiver<Event>, id: RequestId) -> bool {
        let event = wait_for(rx, |e| matches!(e, Event::Finished { id: fid, .. } if *fid == id));
        match event {
            Event::Finished { failed, .. } => failed,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_copy_file_end_to_end() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&src, b"payload").expect("Failed to write source");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&src, fs::Permissions::from_mode(0o754))
                .expect("Failed to set permissions");
        }

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&src, &dst, CopyFlags::empty()));

        wait_for(&rx, |e| matches!(e, Event::Started { id: sid } if *sid == id));
        assert!(!wait_finished(&rx, id));
        assert_eq!(fs::read(&dst).expect("Failed to read destination"), b"payload");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let src_mode = fs::metadata(&src).unwrap().permissions().mode() & 0o777;
            let dst_mode = fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
            assert_eq!(src_mode, dst_mode);
        }
    }

    #[test]
    fn test_existing_destination_prompts_then_overwrites() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&src, b"fresh").expect("Failed to write source");
        fs::write(&dst, b"keep").expect("Failed to write destination");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&src, &dst, CopyFlags::empty()));

        wait_for(&rx, |e| {
            matches!(
                e,
                Event::Error { kind: ErrorKind::DestinationExists, needs_interaction: true, .. }
            )
        });
        // suspended: nothing was written
        assert_eq!(fs::read(&dst).expect("Failed to read destination"), b"keep");
        assert_eq!(engine.state(), State::WaitingForInteraction);

        engine.overwrite();
        assert!(!wait_finished(&rx, id));
        assert_eq!(fs::read(&dst).expect("Failed to read destination"), b"fresh");
    }

    #[test]
    fn test_skip_resolves_as_cancelled() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&src, b"fresh").expect("Failed to write source");
        fs::write(&dst, b"keep").expect("Failed to write destination");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&src, &dst, CopyFlags::empty()));

        wait_for(&rx, |e| matches!(e, Event::Error { needs_interaction: true, .. }));
        engine.skip();

        wait_for(&rx, |e| {
            matches!(
                e,
                Event::Error { kind: ErrorKind::Cancelled, needs_interaction: false, .. }
            )
        });
        assert!(wait_finished(&rx, id));
        assert_eq!(fs::read(&dst).expect("Failed to read destination"), b"keep");
    }

    #[test]
    fn test_skip_all_suppresses_same_kind_in_batch() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let mut batch = Vec::new();
        let mut ids = Vec::new();
        for n in 0..2 {
            let src = temp.path().join(format!("src{n}.txt"));
            let dst = temp.path().join(format!("dst{n}.txt"));
            fs::write(&src, b"fresh").expect("Failed to write source");
            fs::write(&dst, b"keep").expect("Failed to write destination");
            let id = RequestId::new_v4();
            ids.push(id);
            batch.push((id, TransferRequest::file(&src, &dst, CopyFlags::empty())));
        }

        let engine = CopyEngine::new();
        let rx = engine.events();
        engine.enqueue_batch(batch);

        let first = wait_for(&rx, |e| matches!(e, Event::Error { needs_interaction: true, .. }));
        assert!(matches!(first, Event::Error { id, .. } if id == ids[0]));
        engine.skip_all();

        // both requests fail without any further prompt
        let mut finished = 0;
        let mut prompts = 0;
        while finished < 2 {
            match recv_event(&rx) {
                Event::Finished { failed, .. } => {
                    assert!(failed);
                    finished += 1;
                }
                Event::Error { needs_interaction: true, .. } => prompts += 1,
                _ => {}
            }
        }
        assert_eq!(prompts, 0);
    }

    #[test]
    fn test_non_interactive_overwrites_existing() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&src, b"fresh").expect("Failed to write source");
        fs::write(&dst, b"keep").expect("Failed to write destination");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&src, &dst, CopyFlags::NON_INTERACTIVE));

        assert!(!wait_finished(&rx, id));
        assert_eq!(fs::read(&dst).expect("Failed to read destination"), b"fresh");
    }

    #[test]
    fn test_non_interactive_failure_does_not_prompt() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("missing.txt");
        let dst = temp.path().join("dst.txt");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&src, &dst, CopyFlags::NON_INTERACTIVE));

        wait_for(&rx, |e| {
            matches!(
                e,
                Event::Error { kind: ErrorKind::SourceNotExists, needs_interaction: false, .. }
            )
        });
        assert!(wait_finished(&rx, id));
    }

    #[test]
    fn test_retry_after_fixing_source() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("late.txt");
        let dst = temp.path().join("dst.txt");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&src, &dst, CopyFlags::empty()));

        wait_for(&rx, |e| {
            matches!(
                e,
                Event::Error { kind: ErrorKind::SourceNotExists, needs_interaction: true, .. }
            )
        });
        fs::write(&src, b"now present").expect("Failed to write source");
        engine.retry();

        assert!(!wait_finished(&rx, id));
        assert_eq!(fs::read(&dst).expect("Failed to read destination"), b"now present");
    }

    #[test]
    fn test_fifo_order_across_independent_requests() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let mut batch = Vec::new();
        let mut ids = Vec::new();
        for n in 0..3 {
            let src = temp.path().join(format!("src{n}.txt"));
            fs::write(&src, b"x").expect("Failed to write source");
            let id = RequestId::new_v4();
            ids.push(id);
            batch.push((
                id,
                TransferRequest::file(&src, temp.path().join(format!("dst{n}.txt")), CopyFlags::empty()),
            ));
        }

        let engine = CopyEngine::new();
        let rx = engine.events();
        engine.enqueue_batch(batch);

        let mut started = Vec::new();
        while started.len() < 3 {
            if let Event::Started { id } = recv_event(&rx) {
                started.push(id);
            }
        }
        assert_eq!(started, ids);
    }

    #[test]
    fn test_cancel_all_drops_queue_with_single_event() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src1 = temp.path().join("src1.txt");
        let dst1 = temp.path().join("dst1.txt");
        let src2 = temp.path().join("src2.txt");
        fs::write(&src1, b"fresh").expect("Failed to write source");
        fs::write(&dst1, b"keep").expect("Failed to write destination");
        fs::write(&src2, b"other").expect("Failed to write source");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id1 = RequestId::new_v4();
        let id2 = RequestId::new_v4();
        engine.enqueue_batch(vec![
            (id1, TransferRequest::file(&src1, &dst1, CopyFlags::empty())),
            (id2, TransferRequest::file(&src2, temp.path().join("dst2.txt"), CopyFlags::empty())),
        ]);

        wait_for(&rx, |e| matches!(e, Event::Error { needs_interaction: true, .. }));
        engine.cancel_all();
        engine.retry(); // wake the suspended worker; the entry is now cancelled

        assert!(wait_finished(&rx, id1));
        let mut saw_batch_cancel = false;
        let mut saw_second_start = false;
        // drain until the batch-cancel lands
        while !saw_batch_cancel {
            match recv_event(&rx) {
                Event::CancelledBatch => saw_batch_cancel = true,
                Event::Started { id } if id == id2 => saw_second_start = true,
                _ => {}
            }
        }
        assert!(!saw_second_start);
        assert!(!temp.path().join("dst2.txt").exists());
    }

    #[test]
    fn test_cancel_directory_descendants_never_start() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src_dir = temp.path().join("tree");
        fs::create_dir(&src_dir).expect("Failed to create source dir");
        // first child's source is missing so the worker suspends on it
        fs::write(src_dir.join("b.txt"), b"b").expect("Failed to write");
        fs::write(src_dir.join("c.txt"), b"c").expect("Failed to write");
        let dst_dir = temp.path().join("out");

        let parent = RequestId::new_v4();
        let c1 = RequestId::new_v4();
        let c2 = RequestId::new_v4();
        let c3 = RequestId::new_v4();
        let batch = vec![
            (
                parent,
                TransferRequest::directory(&src_dir, &dst_dir, CopyFlags::empty(), vec![c1, c2, c3]),
            ),
            (c1, TransferRequest::file(src_dir.join("a.txt"), dst_dir.join("a.txt"), CopyFlags::empty())),
            (c2, TransferRequest::file(src_dir.join("b.txt"), dst_dir.join("b.txt"), CopyFlags::empty())),
            (c3, TransferRequest::file(src_dir.join("c.txt"), dst_dir.join("c.txt"), CopyFlags::empty())),
        ];

        let engine = CopyEngine::new();
        let rx = engine.events();
        engine.enqueue_batch(batch);

        wait_for(&rx, |e| {
            matches!(
                e,
                Event::Error { id, kind: ErrorKind::SourceNotExists, needs_interaction: true }
                    if *id == c1
            )
        });
        engine.cancel(parent);
        // cancel does not resume a suspended worker; skip abandons the
        // current child and lets the cascade take effect
        engine.skip();

        let mut siblings_started = false;
        loop {
            match recv_event(&rx) {
                Event::Started { id } if id == c2 || id == c3 => siblings_started = true,
                Event::Finished { id, failed } if id == parent => {
                    assert!(failed);
                    break;
                }
                _ => {}
            }
        }
        assert!(!siblings_started);
        assert!(!dst_dir.join("b.txt").exists());
        assert!(!dst_dir.join("c.txt").exists());
    }

    #[test]
    fn test_directory_tree_copies_children_before_parent_finishes() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src_dir = temp.path().join("tree");
        let sub_dir = src_dir.join("sub");
        fs::create_dir_all(&sub_dir).expect("Failed to create source tree");
        fs::write(src_dir.join("a.txt"), b"a").expect("Failed to write");
        fs::write(src_dir.join("b.txt"), b"bb").expect("Failed to write");
        fs::write(sub_dir.join("c.txt"), b"ccc").expect("Failed to write");
        let dst_dir = temp.path().join("out");

        let parent = RequestId::new_v4();
        let fa = RequestId::new_v4();
        let fb = RequestId::new_v4();
        let sub = RequestId::new_v4();
        let fc = RequestId::new_v4();
        let batch = vec![
            (
                parent,
                TransferRequest::directory(&src_dir, &dst_dir, CopyFlags::empty(), vec![fa, fb, sub]),
            ),
            (fa, TransferRequest::file(src_dir.join("a.txt"), dst_dir.join("a.txt"), CopyFlags::empty())),
            (fb, TransferRequest::file(src_dir.join("b.txt"), dst_dir.join("b.txt"), CopyFlags::empty())),
            (
                sub,
                TransferRequest::directory(&sub_dir, dst_dir.join("sub"), CopyFlags::empty(), vec![fc]),
            ),
            (
                fc,
                TransferRequest::file(sub_dir.join("c.txt"), dst_dir.join("sub").join("c.txt"), CopyFlags::empty()),
            ),
        ];

        let engine = CopyEngine::new();
        let rx = engine.events();
        engine.enqueue_batch(batch);

        let mut finish_order = Vec::new();
        while finish_order.len() < 5 {
            if let Event::Finished { id, failed } = recv_event(&rx) {
                assert!(!failed, "request {id} failed");
                finish_order.push(id);
            }
        }
        assert_eq!(*finish_order.last().unwrap(), parent);
        let sub_pos = finish_order.iter().position(|i| *i == sub).unwrap();
        let fc_pos = finish_order.iter().position(|i| *i == fc).unwrap();
        assert!(fc_pos < sub_pos);

        assert_eq!(fs::read(dst_dir.join("a.txt")).unwrap(), b"a");
        assert_eq!(fs::read(dst_dir.join("b.txt")).unwrap(), b"bb");
        assert_eq!(fs::read(dst_dir.join("sub").join("c.txt")).unwrap(), b"ccc");
    }

    #[test]
    fn test_move_renames_in_place() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src.bin");
        let dst = temp.path().join("dst.bin");
        fs::write(&src, vec![5u8; 2048]).expect("Failed to write source");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&src, &dst, CopyFlags::empty()).moving());

        // the rename path reports the destination size once, then finishes
        let progress = wait_for(&rx, |e| matches!(e, Event::Progress { .. }));
        assert!(matches!(progress, Event::Progress { bytes: 2048, .. }));
        assert!(!wait_finished(&rx, id));
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).expect("Failed to read destination").len(), 2048);
    }

    #[test]
    fn test_move_directory_renames_children() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src_dir = temp.path().join("tree");
        fs::create_dir(&src_dir).expect("Failed to create source dir");
        fs::write(src_dir.join("a.txt"), b"abc").expect("Failed to write");
        let dst_dir = temp.path().join("moved");

        let parent = RequestId::new_v4();
        let child = RequestId::new_v4();
        let batch = vec![
            (
                parent,
                TransferRequest::directory(&src_dir, &dst_dir, CopyFlags::empty(), vec![child]).moving(),
            ),
            (
                child,
                TransferRequest::file(src_dir.join("a.txt"), dst_dir.join("a.txt"), CopyFlags::empty()).moving(),
            ),
        ];

        let engine = CopyEngine::new();
        let rx = engine.events();
        engine.enqueue_batch(batch);

        assert!(!wait_finished(&rx, child));
        assert!(!wait_finished(&rx, parent));
        assert!(!src_dir.exists());
        assert_eq!(fs::read(dst_dir.join("a.txt")).unwrap(), b"abc");
    }

    #[cfg(unix)]
    #[test]
    fn test_move_symlink_with_follow_links_copies_then_removes() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let real = temp.path().join("real.txt");
        let link = temp.path().join("link.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&real, b"pointed-at").expect("Failed to write target");
        std::os::unix::fs::symlink(&real, &link).expect("Failed to create symlink");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&link, &dst, CopyFlags::FOLLOW_LINKS).moving());

        assert!(!wait_finished(&rx, id));
        // copied through the link, then removed the link itself
        assert!(!crate::fs_ops::exists_or_symlink(&link));
        assert!(real.exists());
        assert!(!crate::fs_ops::is_symlink(&dst));
        assert_eq!(fs::read(&dst).unwrap(), b"pointed-at");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_source_is_replicated_by_default() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let real = temp.path().join("real.txt");
        let link = temp.path().join("link.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&real, b"data").expect("Failed to write target");
        std::os::unix::fs::symlink("real.txt", &link).expect("Failed to create symlink");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&link, &dst, CopyFlags::empty()));

        assert!(!wait_finished(&rx, id));
        assert!(crate::fs_ops::is_symlink(&dst));
        assert_eq!(fs::read_link(&dst).unwrap(), fs::read_link(&link).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_make_links_creates_link_instead_of_copy() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src.txt");
        let out = temp.path().join("out");
        fs::create_dir(&out).expect("Failed to create out dir");
        let dst = out.join("linked.txt");
        fs::write(&src, b"linked content").expect("Failed to write source");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&src, &dst, CopyFlags::MAKE_LINKS));

        assert!(!wait_finished(&rx, id));
        assert!(crate::fs_ops::is_symlink(&dst));
        assert_eq!(fs::read(&dst).unwrap(), b"linked content");
    }

    #[test]
    fn test_mid_copy_cancel_removes_partial_destination() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("big.bin");
        let dst = temp.path().join("dst.bin");
        let file = fs::File::create(&src).expect("Failed to create source");
        file.set_len(64 * 1024 * 1024).expect("Failed to extend source");
        drop(file);

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&src, &dst, CopyFlags::empty()));

        wait_for(&rx, |e| matches!(e, Event::Started { .. }));
        engine.request_progress();
        wait_for(&rx, |e| matches!(e, Event::Progress { .. }));
        engine.cancel(id);

        assert!(wait_finished(&rx, id));
        assert!(!dst.exists());
    }

    #[test]
    fn test_force_overwrite_streams_increasing_progress() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src.bin");
        let dst = temp.path().join("dst.bin");
        let total: u64 = 10 * 1024 * 1024;
        fs::write(&src, vec![7u8; total as usize]).expect("Failed to write source");
        fs::write(&dst, b"x").expect("Failed to write destination");

        let engine = CopyEngine::new();
        engine.set_progress_interval(Duration::from_millis(1));
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(
            id,
            TransferRequest::file(&src, &dst, CopyFlags::NON_INTERACTIVE | CopyFlags::FORCE),
        );

        let mut reported = Vec::new();
        loop {
            match recv_event(&rx) {
                Event::Progress { bytes, .. } => reported.push(bytes),
                Event::Finished { failed, .. } => {
                    assert!(!failed);
                    break;
                }
                _ => {}
            }
        }
        reported.dedup();
        assert!(reported.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*reported.last().unwrap(), total);
        assert_eq!(fs::read(&dst).unwrap().len() as u64, total);
    }

    #[cfg(unix)]
    #[test]
    fn test_force_replaces_readonly_destination() {
        use std::os::unix::fs::PermissionsExt;
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&src, b"fresh").expect("Failed to write source");
        fs::write(&dst, b"keep").expect("Failed to write destination");
        fs::set_permissions(&dst, fs::Permissions::from_mode(0o444))
            .expect("Failed to set permissions");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(
            id,
            TransferRequest::file(&src, &dst, CopyFlags::NON_INTERACTIVE | CopyFlags::FORCE),
        );

        assert!(!wait_finished(&rx, id));
        assert_eq!(fs::read(&dst).unwrap(), b"fresh");
    }

    #[test]
    fn test_drop_while_suspended_resolves_cancelled() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&src, b"fresh").expect("Failed to write source");
        fs::write(&dst, b"keep").expect("Failed to write destination");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&src, &dst, CopyFlags::empty()));

        wait_for(&rx, |e| matches!(e, Event::Error { needs_interaction: true, .. }));
        drop(engine); // joins the worker

        let mut resolved = false;
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(10)) {
            if let Event::Finished { id: fid, failed } = event {
                assert_eq!(fid, id);
                assert!(failed);
                resolved = true;
            }
        }
        assert!(resolved);
        assert_eq!(fs::read(&dst).unwrap(), b"keep");
    }

    #[test]
    fn test_skip_set_persists_without_auto_reset() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = CopyEngine::new();
        engine.set_auto_reset(false);
        let rx = engine.events();

        let src1 = temp.path().join("src1.txt");
        let dst1 = temp.path().join("dst1.txt");
        fs::write(&src1, b"a").expect("Failed to write");
        fs::write(&dst1, b"old").expect("Failed to write");
        let id1 = RequestId::new_v4();
        engine.enqueue(id1, TransferRequest::file(&src1, &dst1, CopyFlags::empty()));
        wait_for(&rx, |e| matches!(e, Event::Error { needs_interaction: true, .. }));
        engine.skip_all();
        assert!(wait_finished(&rx, id1));

        // second batch: same kind resolves without a prompt
        let src2 = temp.path().join("src2.txt");
        let dst2 = temp.path().join("dst2.txt");
        fs::write(&src2, b"b").expect("Failed to write");
        fs::write(&dst2, b"old").expect("Failed to write");
        let id2 = RequestId::new_v4();
        engine.enqueue(id2, TransferRequest::file(&src2, &dst2, CopyFlags::empty()));

        loop {
            match recv_event(&rx) {
                Event::Error { needs_interaction, kind, .. } => {
                    assert!(!needs_interaction, "unexpected prompt for {kind:?}");
                }
                Event::Finished { id, failed } if id == id2 => {
                    assert!(failed);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(fs::read(&dst2).unwrap(), b"old");
    }

    #[test]
    fn test_auto_reset_clears_skip_set_on_idle_wake() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = CopyEngine::new(); // auto-reset defaults to on
        let rx = engine.events();

        let src1 = temp.path().join("src1.txt");
        let dst1 = temp.path().join("dst1.txt");
        fs::write(&src1, b"a").expect("Failed to write");
        fs::write(&dst1, b"old").expect("Failed to write");
        let id1 = RequestId::new_v4();
        engine.enqueue(id1, TransferRequest::file(&src1, &dst1, CopyFlags::empty()));
        wait_for(&rx, |e| matches!(e, Event::Error { needs_interaction: true, .. }));
        engine.skip_all();
        assert!(wait_finished(&rx, id1));
        // make sure the worker is parked before the next batch arrives
        wait_for(&rx, |e| matches!(e, Event::StateChanged { state: State::Idle }));

        let src2 = temp.path().join("src2.txt");
        let dst2 = temp.path().join("dst2.txt");
        fs::write(&src2, b"b").expect("Failed to write");
        fs::write(&dst2, b"old").expect("Failed to write");
        let id2 = RequestId::new_v4();
        engine.enqueue(id2, TransferRequest::file(&src2, &dst2, CopyFlags::empty()));

        wait_for(&rx, |e| {
            matches!(
                e,
                Event::Error { kind: ErrorKind::DestinationExists, needs_interaction: true, .. }
            )
        });
        engine.skip();
        assert!(wait_finished(&rx, id2));
    }

    #[test]
    fn test_introspection_while_suspended() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&src, b"a").expect("Failed to write");
        fs::write(&dst, b"old").expect("Failed to write");

        let engine = CopyEngine::new();
        let rx = engine.events();
        let id = RequestId::new_v4();
        engine.enqueue(id, TransferRequest::file(&src, &dst, CopyFlags::empty()));

        wait_for(&rx, |e| matches!(e, Event::Error { needs_interaction: true, .. }));
        assert_eq!(engine.state(), State::WaitingForInteraction);
        assert_eq!(engine.current_id(), Some(id));
        assert_eq!(engine.pending_requests(), vec![id]);
        assert_eq!(engine.source_file_path(id).as_deref(), Some(src.as_path()));
        assert_eq!(engine.destination_file_path(id).as_deref(), Some(dst.as_path()));
        assert_eq!(engine.is_dir(id), Some(false));
        assert!(engine.children_of(id).is_empty());
        assert!(engine.admitted_at(id).is_some());

        engine.skip();
        assert!(wait_finished(&rx, id));
        assert_eq!(engine.source_file_path(id), None);
    }

    #[test]
    fn test_engines_are_independent() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src.txt");
        fs::write(&src, b"shared").expect("Failed to write");

        let first = CopyEngine::new();
        let second = CopyEngine::new();
        let rx1 = first.events();
        let rx2 = second.events();

        let id1 = RequestId::new_v4();
        let id2 = RequestId::new_v4();
        first.enqueue(id1, TransferRequest::file(&src, temp.path().join("one.txt"), CopyFlags::empty()));
        second.enqueue(id2, TransferRequest::file(&src, temp.path().join("two.txt"), CopyFlags::empty()));

        assert!(!wait_finished(&rx1, id1));
        assert!(!wait_finished(&rx2, id2));
        assert!(temp.path().join("one.txt").exists());
        assert!(temp.path().join("two.txt").exists());
    }

    #[test]
    fn test_directory_into_existing_destination_prompts() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src_dir = temp.path().join("tree");
        fs::create_dir(&src_dir).expect("Failed to create source dir");
        fs::write(src_dir.join("a.txt"), b"a").expect("Failed to write");
        let dst_dir = temp.path().join("out");
        fs::create_dir(&dst_dir).expect("Failed to create destination dir");

        let parent = RequestId::new_v4();
        let child = RequestId::new_v4();
        let engine = CopyEngine::new();
        let rx = engine.events();
        engine.enqueue_batch(vec![
            (
                parent,
                TransferRequest::directory(&src_dir, &dst_dir, CopyFlags::empty(), vec![child]),
            ),
            (child, TransferRequest::file(src_dir.join("a.txt"), dst_dir.join("a.txt"), CopyFlags::empty())),
        ]);

        wait_for(&rx, |e| {
            matches!(
                e,
                Event::Error { id, kind: ErrorKind::DestinationExists, needs_interaction: true }
                    if *id == parent
            )
        });
        engine.overwrite();
        assert!(!wait_finished(&rx, parent));
        assert_eq!(fs::read(dst_dir.join("a.txt")).unwrap(), b"a");
    }
}
