//! transfer - Command-line interface for the file transfer engine.
//!
//! Drives the engine's asynchronous event stream from a terminal: progress
//! rendering, and interactive conflict resolution on stdin
//! (skip / retry / overwrite, each with an "all" variant).

use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use engine::{CopyFlags, ErrorKind, Event, FileCopier, RequestId};

/// transfer - Copy and move files and directories with progress tracking
#[derive(Parser, Debug)]
#[command(name = "transfer")]
#[command(version = "0.1.0")]
#[command(about = "Copy or move files and directories with conflict resolution")]
struct Args {
    /// Source file or directory
    #[arg(long, value_name = "PATH")]
    src: PathBuf,

    /// Destination path
    #[arg(long, value_name = "PATH")]
    dst: PathBuf,

    /// Operation mode: copy or move
    #[arg(long, value_name = "MODE", default_value = "copy")]
    mode: String,

    /// Resolve conflicts without prompting (implies overwrite permission)
    #[arg(long)]
    non_interactive: bool,

    /// Delete an unopenable destination file and retry once
    #[arg(long)]
    force: bool,

    /// Create symlinks at the destination instead of copying
    #[arg(long)]
    make_links: bool,

    /// Copy through symlinks instead of replicating them
    #[arg(long)]
    follow_links: bool,

    /// Milliseconds between unsolicited progress events (0 disables)
    #[arg(long, value_name = "MS", default_value_t = 100)]
    progress_interval: u64,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Ask the user how to resolve a conflict. EOF or an unknown answer skips.
fn prompt_resolution(copier: &FileCopier, id: RequestId, kind: ErrorKind) {
    let path = copier
        .source_file_path(id)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(unknown)".to_string());
    eprintln!();
    eprintln!("{path}: {kind}");
    eprint!("  [s]kip, skip [a]ll, [r]etry, [o]verwrite, overwrite a[l]l, [c]ancel? ");
    let _ = io::stderr().flush();

    let mut answer = String::new();
    let _ = io::stdin().lock().read_line(&mut answer);
    match answer.trim() {
        "r" => copier.retry(),
        "o" => copier.overwrite(),
        "l" => copier.overwrite_all(),
        "a" => copier.skip_all(),
        "c" => {
            copier.cancel_all();
            copier.skip();
        }
        _ => copier.skip(),
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let exit_code = match run_cli(&args) {
        Ok(()) => 0,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<(), String> {
    if !args.src.exists() && !args.src.is_symlink() {
        return Err(format!("Source does not exist: {}", args.src.display()));
    }

    let is_move = match args.mode.to_lowercase().as_str() {
        "copy" => false,
        "move" => true,
        _ => {
            return Err(format!(
                "Invalid mode '{}'. Must be 'copy' or 'move'",
                args.mode
            ))
        }
    };

    let mut flags = CopyFlags::empty();
    if args.non_interactive {
        flags |= CopyFlags::NON_INTERACTIVE;
    }
    if args.force {
        flags |= CopyFlags::FORCE;
    }
    if args.make_links {
        flags |= CopyFlags::MAKE_LINKS;
    }
    if args.follow_links {
        flags |= CopyFlags::FOLLOW_LINKS;
    }

    let copier = FileCopier::new();
    copier.set_progress_interval(Duration::from_millis(args.progress_interval));
    let events = copier.events();

    let source_is_dir = args.src.is_dir() && !args.src.is_symlink();
    let ids: Vec<RequestId> = if source_is_dir {
        let tree = if is_move {
            copier.move_directory(&args.src, &args.dst, flags)
        } else {
            copier.copy_directory(&args.src, &args.dst, flags)
        };
        tree.map_err(|e| format!("Failed to read source tree: {}", e))?
    } else if is_move {
        vec![copier.move_file(&args.src, &args.dst, flags)]
    } else {
        vec![copier.copy(&args.src, &args.dst, flags)]
    };

    eprintln!(
        "Started at {}: {} {} -> {} ({} request{})",
        chrono::Local::now().format("%H:%M:%S"),
        if is_move { "move" } else { "copy" },
        args.src.display(),
        args.dst.display(),
        ids.len(),
        if ids.len() == 1 { "" } else { "s" },
    );

    let start = Instant::now();
    // only top-level requests are guaranteed a Finished event; a skipped
    // subtree drops its queued descendants silently
    let mut remaining: HashSet<RequestId> = if source_is_dir {
        ids.iter().take(1).copied().collect()
    } else {
        ids.iter().copied().collect()
    };
    let mut done = 0usize;
    let mut failed = 0usize;
    let mut cancelled_batch = false;

    while !remaining.is_empty() {
        let event = events
            .recv()
            .map_err(|_| "engine stopped unexpectedly".to_string())?;
        match event {
            Event::Started { id } => {
                if args.verbose {
                    if let Some(path) = copier.source_file_path(id) {
                        eprintln!("Starting: {}", path.display());
                    }
                }
            }
            Event::Progress { bytes, .. } => {
                eprint!("\rProgress: {}          ", format_bytes(bytes));
                let _ = io::stderr().flush();
            }
            Event::Finished { id, failed: request_failed } => {
                remaining.remove(&id);
                if request_failed {
                    failed += 1;
                } else {
                    done += 1;
                }
            }
            Event::Error { id, kind, needs_interaction } => {
                if needs_interaction {
                    prompt_resolution(&copier, id, kind);
                } else if args.verbose && kind != ErrorKind::Cancelled {
                    eprintln!("\n{}: {}", id, kind);
                }
            }
            Event::CancelledBatch => {
                cancelled_batch = true;
                break;
            }
            Event::StateChanged { .. } => {}
        }
    }

    eprintln!();
    if cancelled_batch {
        eprintln!("Cancelled after {}", format_duration(start.elapsed()));
        return Err("transfer cancelled".to_string());
    }
    eprintln!(
        "Summary: {} done, {} failed in {}",
        done,
        failed,
        format_duration(start.elapsed())
    );

    if failed > 0 {
        Err("One or more requests failed".to_string())
    } else {
        Ok(())
    }
}
