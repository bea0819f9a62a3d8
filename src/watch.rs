//! File watching: debounced change batches and the command watcher stream.
//!
//! A background thread owns the OS watcher and collapses raw notifications
//! into batches of distinct paths using a sliding window. [`WatcherStream`]
//! turns those batches into sets of commands to run.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Instant;

use globset::{Glob, GlobSet, GlobSetBuilder};
use log::{debug, error, info};
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::command::{Command, CommandGroup};
use crate::select::{select_on_demand, select_watch};

/// Sliding debounce window for file-system events.
const DEBOUNCE_WINDOW: std::time::Duration = std::time::Duration::from_millis(500);

const BATCH_CHANNEL_DEPTH: usize = 100;

/// Errors that can occur while setting up the file watcher.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Unable to start file watcher: {0}")]
    Watch(#[from] notify::Error),
}

/// Paths that never count as changes: VCS bookkeeping and editor swap files.
fn noise_filter() -> GlobSet {
    let patterns = [
        "**/.git/**",
        "**/.hg/**",
        "**/.svn/**",
        "**/*.swp",
        "**/*.swo",
        "**/*.swx",
        "**/*~",
        "**/.#*",
        "**/#*#",
        "**/4913",
    ];
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// A recursive file-system watcher that yields debounced batches of distinct
/// changed paths.
///
/// Roots that cannot be watched are reported once and skipped; the remaining
/// roots keep working. Dropping the debouncer disconnects the raw event
/// channel, which ends the debounce thread and the OS watches.
pub struct WatchDebouncer {
    rx: mpsc::Receiver<HashSet<PathBuf>>,
    _watcher: RecommendedWatcher,
}

impl WatchDebouncer {
    /// Start watching `roots` recursively.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Watch`] if the OS watcher itself cannot be
    /// created. Per-root failures are logged and skipped instead.
    pub fn new(roots: &[PathBuf]) -> Result<Self, WatchError> {
        let (raw_tx, raw_rx) = std::sync::mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )?;

        for root in roots {
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => info!("Watching path: {}", root.display()),
                Err(e) => error!("Failed to watch {}: {e}", root.display()),
            }
        }

        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_DEPTH);
        std::thread::spawn(move || debounce_loop(&raw_rx, &batch_tx));

        Ok(Self {
            rx: batch_rx,
            _watcher: watcher,
        })
    }

    /// The next debounced batch. Returns `None` once the watcher shuts down.
    pub async fn next_batch(&mut self) -> Option<HashSet<PathBuf>> {
        self.rx.recv().await
    }
}

fn debounce_loop(
    raw_rx: &std::sync::mpsc::Receiver<notify::Result<NotifyEvent>>,
    batch_tx: &mpsc::Sender<HashSet<PathBuf>>,
) {
    let noise = noise_filter();
    loop {
        let first = match raw_rx.recv() {
            Ok(res) => res,
            Err(_) => return,
        };
        let mut batch = HashSet::new();
        collect_paths(first, &noise, &mut batch);

        // Keep the window open while relevant events keep arriving.
        let mut last = Instant::now();
        loop {
            let elapsed = last.elapsed();
            if elapsed >= DEBOUNCE_WINDOW {
                break;
            }
            match raw_rx.recv_timeout(DEBOUNCE_WINDOW - elapsed) {
                Ok(res) => {
                    if collect_paths(res, &noise, &mut batch) {
                        last = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        if batch.is_empty() {
            continue;
        }
        if batch_tx.blocking_send(batch).is_err() {
            return;
        }
    }
}

/// Fold an event's paths into the batch; returns whether the event was
/// relevant (a create/modify/remove touching a non-noise path).
fn collect_paths(
    res: notify::Result<NotifyEvent>,
    noise: &GlobSet,
    batch: &mut HashSet<PathBuf>,
) -> bool {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            debug!("Watch error: {e}");
            return false;
        }
    };
    if !(event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove()) {
        return false;
    }
    let mut relevant = false;
    for path in event.paths {
        if noise.is_match(&path) {
            continue;
        }
        relevant = true;
        batch.insert(path);
    }
    relevant
}

/// A lazy, single-consumer stream of commands that should (re-)run.
///
/// The first poll yields the `always` and git selections in traversal order;
/// every later poll suspends until a debounced batch selects at least one
/// watched command. Dropping the stream tears down the debouncer and the OS
/// watches it created.
pub struct WatcherStream {
    tree: CommandGroup,
    cwd: PathBuf,
    debouncer: WatchDebouncer,
    primed: bool,
}

impl WatcherStream {
    pub(crate) fn new(tree: CommandGroup, cwd: PathBuf) -> Result<Self, WatchError> {
        let roots = watch_roots(&tree);
        if roots.is_empty() {
            debug!("No watchable paths in config");
        }
        let debouncer = WatchDebouncer::new(&roots)?;
        Ok(Self {
            tree,
            cwd,
            debouncer,
            primed: false,
        })
    }

    /// Produce the next set of commands to run. Returns `None` once the
    /// underlying watcher shuts down.
    pub async fn next(&mut self) -> Option<Vec<Command>> {
        if !self.primed {
            self.primed = true;
            let first: Vec<Command> = select_on_demand(&self.tree, &self.cwd)
                .into_iter()
                .cloned()
                .collect();
            return Some(first);
        }
        loop {
            let batch = self.debouncer.next_batch().await?;
            debug!("Watcher batch with {} changed paths", batch.len());
            let matched = select_watch(&self.tree, &batch, &self.cwd);
            if !matched.is_empty() {
                let names: Vec<&str> = matched.iter().map(|cmd| cmd.name.as_str()).collect();
                debug!("Watcher matched commands: {}", names.join(", "));
                return Some(matched.into_iter().cloned().collect());
            }
        }
    }
}

/// Union of resolved watch roots over all watch-enabled commands.
fn watch_roots(tree: &CommandGroup) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    for cmd in tree.all_commands() {
        if !cmd.auto.watch {
            continue;
        }
        for path in &cmd.auto.path {
            if !roots.contains(path) {
                roots.push(path.clone());
            }
        }
    }
    roots
}
