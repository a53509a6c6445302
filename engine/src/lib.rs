//! # CopyKit Engine - Concurrent File Transfer Library
//!
//! A reusable copy/move engine for recursive file-tree transfers, with
//! cancellation, retry, conflict resolution and progress reporting, driven
//! across a producer/consumer thread boundary. It is the kind of engine
//! that sits behind a file manager's copy dialog, packaged as a headless
//! library so any UI (CLI, GUI, automation) can drive it.
//!
//! ## Overview
//!
//! Each [`FileCopier`] (or bare [`CopyEngine`]) owns one worker thread and a
//! queue of pending requests. Every request runs through an ordered policy
//! pipeline - cancellation, source existence, overwrite permission, symlink
//! strategy, the same-volume rename fast path, directory recursion, block
//! copy, and source removal for moves. Conflicts the engine cannot settle on
//! its own suspend the worker and surface as events; the caller answers with
//! [`skip`](FileCopier::skip), [`retry`](FileCopier::retry),
//! [`overwrite`](FileCopier::overwrite) or their "all" variants.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{CopyFlags, Event, FileCopier};
//!
//! let copier = FileCopier::new();
//! let events = copier.events();
//!
//! let ids = copier.copy_directory("/data/photos", "/backup/photos", CopyFlags::empty())?;
//! let root = ids[0];
//!
//! for event in events.iter() {
//!     match event {
//!         Event::Error { needs_interaction: true, .. } => copier.skip(),
//!         Event::Finished { id, .. } if id == root => break,
//!         _ => {}
//!     }
//! }
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! ## Modules
//!
//! - **model**: Request descriptions (TransferRequest, CopyFlags, RequestId)
//! - **error**: The closed failure-kind taxonomy
//! - **events**: Event stream and engine state
//! - **fs_ops**: Low-level filesystem primitives
//! - **pipeline**: The per-attempt policy pipeline
//! - **worker**: Queue, worker thread, interaction protocol
//! - **copier**: Public facade

pub mod copier;
pub mod error;
pub mod events;
pub mod fs_ops;
pub mod model;
mod pipeline;
pub mod worker;

// Re-export main types
pub use copier::FileCopier;
pub use error::ErrorKind;
pub use events::{Event, State};
pub use model::{CopyFlags, RequestId, TransferRequest};
pub use worker::CopyEngine;
