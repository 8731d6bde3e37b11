//! Pure timing and deduplication for file events.
//!
//! No module knowledge here: the debouncer turns a stream of raw notify
//! events into batches of net per-path changes once the configured quiet
//! window has elapsed.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

/// Net effect of the events seen for one path within a window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

impl ChangeKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Removed => "removed",
        }
    }
}

pub type ChangeSet = FxHashMap<PathBuf, ChangeKind>;

/// Collapses bursts of notify events into one batch per quiet window.
pub(super) struct Debouncer {
    changes: ChangeSet,
    last_event: Option<Instant>,
    last_batch: Option<Instant>,
    window: Duration,
    cooldown: Duration,
}

impl Debouncer {
    pub(super) fn new(window: Duration, cooldown: Duration) -> Self {
        Self {
            changes: ChangeSet::default(),
            last_event: None,
            last_batch: None,
            window,
            cooldown,
        }
    }

    /// Fold a raw notify event into the pending batch.
    ///
    /// Net-effect rules per path:
    /// - removed, then created/modified: the file came back, keep the
    ///   restore event
    /// - modified, then removed: keep the removal
    /// - created, then removed: the file never really existed, drop both
    /// - anything else: the first event wins
    pub(super) fn add_event(&mut self, event: &notify::Event) {
        use notify::EventKind;

        let kind = match event.kind {
            EventKind::Create(_) => ChangeKind::Created,
            EventKind::Remove(_) => ChangeKind::Removed,
            EventKind::Modify(modify) => {
                // mtime/chmod noise would retrigger updates forever
                if matches!(modify, notify::event::ModifyKind::Metadata(_)) {
                    return;
                }
                ChangeKind::Modified
            }
            _ => return,
        };

        for path in &event.paths {
            if is_editor_artifact(path) {
                continue;
            }
            let path = path.clone();

            match self.changes.get(&path).copied() {
                None => {
                    crate::debug!("watch"; "event {}: {}", kind.label(), path.display());
                    self.changes.insert(path, kind);
                }
                Some(ChangeKind::Removed)
                    if matches!(kind, ChangeKind::Created | ChangeKind::Modified) =>
                {
                    self.changes.insert(path, kind);
                }
                Some(ChangeKind::Modified) if kind == ChangeKind::Removed => {
                    self.changes.insert(path, ChangeKind::Removed);
                }
                Some(ChangeKind::Created) if kind == ChangeKind::Removed => {
                    self.changes.remove(&path);
                }
                Some(_) => continue,
            }
            self.last_event = Some(Instant::now());
        }
    }

    /// Take the pending batch if the quiet window and cooldown elapsed.
    pub(super) fn take_if_ready(&mut self) -> Option<ChangeSet> {
        if !self.is_ready() {
            return None;
        }
        let changes = std::mem::take(&mut self.changes);
        self.last_event = None;
        if changes.is_empty() {
            return None;
        }
        self.last_batch = Some(Instant::now());
        Some(changes)
    }

    pub(super) fn is_ready(&self) -> bool {
        let Some(last_event) = self.last_event else {
            return false;
        };
        if last_event.elapsed() < self.window {
            return false;
        }
        if let Some(last_batch) = self.last_batch
            && last_batch.elapsed() < self.cooldown
        {
            return false;
        }
        !self.changes.is_empty()
    }

    /// How long to sleep before the batch can possibly become ready.
    pub(super) fn sleep_duration(&self) -> Duration {
        let Some(last_event) = self.last_event else {
            return Duration::from_secs(86400);
        };
        let window_remaining = self.window.saturating_sub(last_event.elapsed());
        let cooldown_remaining = self
            .last_batch
            .map(|t| self.cooldown.saturating_sub(t.elapsed()))
            .unwrap_or(Duration::ZERO);
        window_remaining
            .max(cooldown_remaining)
            .max(Duration::from_millis(1))
    }
}

/// Editor temp/backup artifacts that must never trigger a reload.
fn is_editor_artifact(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bak" | "backup" | "swp" | "swo" | "tmp")
        || name.ends_with('~')
        || name.starts_with('.')
}

// ============================================================================
// Tests
// ============================================================================
