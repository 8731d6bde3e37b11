//! File watcher binding.
//!
//! Bridges file-system changes into the update pipeline:
//!
//! ```text
//! notify → Debouncer (pure timing) → UrlMap (path → module URL)
//!        → Application::notify_changed → debounced request_update
//! ```
//!
//! The watcher starts buffering events as soon as it is constructed, so
//! changes made while the initial dispatch is still running are not lost.

mod debouncer;

pub use debouncer::{ChangeKind, ChangeSet};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;

use crate::application::Application;
use crate::logger::{self, ReportKind};
use debouncer::Debouncer;

// ============================================================================
// Options
// ============================================================================

/// Watch-mode configuration, deserializable from the host's TOML config.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchOptions {
    /// Directories to watch recursively.
    pub roots: Vec<PathBuf>,
    /// Quiet window before a batch of changes is processed.
    pub debounce_ms: u64,
    /// Minimum spacing between two batches.
    pub cooldown_ms: u64,
    /// File extensions that map to modules.
    pub extensions: Vec<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            roots: vec![PathBuf::from(".")],
            debounce_ms: 300,
            cooldown_ms: 800,
            extensions: ["js", "mjs", "cjs", "jsx", "ts", "tsx"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl WatchOptions {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Whether a changed path looks like a module source file.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.extensions.iter().any(|e| e == ext)
    }
}

/// Maps a changed file path to the module URL the graph knows it by.
/// Returning `None` skips the path.
pub type UrlMap = Arc<dyn Fn(&Path) -> Option<String> + Send + Sync>;

/// Default mapping: `file://` URL of the absolute path.
pub fn file_url_map() -> UrlMap {
    Arc::new(|path| Some(format!("file://{}", path.display())))
}

// ============================================================================
// Watcher
// ============================================================================

/// Watches module sources and drives updates through the application.
pub struct ModuleWatcher {
    notify_rx: std::sync::mpsc::Receiver<notify::Result<notify::Event>>,
    /// Must be kept alive for events to flow.
    watcher: RecommendedWatcher,
    debouncer: Debouncer,
    options: WatchOptions,
    url_map: UrlMap,
    application: Arc<Application>,
}

impl ModuleWatcher {
    /// Create the watcher and start buffering events immediately.
    pub fn new(
        options: WatchOptions,
        url_map: UrlMap,
        application: Arc<Application>,
    ) -> notify::Result<Self> {
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = notify_tx.send(res);
        })?;
        for root in &options.roots {
            if root.exists() {
                watcher.watch(root, RecursiveMode::Recursive)?;
            }
        }
        let debouncer = Debouncer::new(
            Duration::from_millis(options.debounce_ms),
            Duration::from_millis(options.cooldown_ms),
        );
        Ok(Self {
            notify_rx,
            watcher,
            debouncer,
            options,
            url_map,
            application,
        })
    }

    /// Run the watch loop until the shutdown signal fires.
    pub async fn run(self, shutdown: crossbeam::channel::Receiver<()>) {
        let Self {
            notify_rx,
            watcher,
            mut debouncer,
            options,
            url_map,
            application,
        } = self;
        let _watcher = watcher;

        // notify and crossbeam are sync; bridge both into the async loop.
        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<notify::Event>(64);
        std::thread::spawn(move || {
            while let Ok(result) = notify_rx.recv() {
                match result {
                    Ok(event) => {
                        if event_tx.blocking_send(event).is_err() {
                            break;
                        }
                    }
                    Err(error) => crate::log!("watch"; "notify error: {error}"),
                }
            }
        });
        let (stop_tx, mut stop_rx) = tokio::sync::mpsc::channel::<()>(1);
        std::thread::spawn(move || {
            let _ = shutdown.recv();
            let _ = stop_tx.blocking_send(());
        });

        crate::log!("watch"; "watching {} root(s)", options.roots.len());
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.recv() => break,
                Some(event) = event_rx.recv() => debouncer.add_event(&event),
                _ = tokio::time::sleep(debouncer.sleep_duration()) => {
                    let Some(changes) = debouncer.take_if_ready() else { continue };
                    flush(&application, &options, &url_map, changes).await;
                }
            }
        }
        crate::debug!("watch"; "stopped");
    }
}

/// Push one batch of file changes through the update pipeline and report
/// the outcome.
async fn flush(
    application: &Arc<Application>,
    options: &WatchOptions,
    url_map: &UrlMap,
    changes: ChangeSet,
) {
    let mut notified = 0usize;
    for (path, kind) in changes {
        if !options.matches(&path) {
            continue;
        }
        if kind == ChangeKind::Removed {
            logger::report(ReportKind::Warning, &format!("removed: {}", path.display()));
            continue;
        }
        let Some(url) = (&**url_map)(&path) else { continue };
        match application.notify_changed(&url).await {
            Ok(()) => notified += 1,
            Err(error) => logger::report(
                ReportKind::Error,
                &format!("import failed: {url}\n{error:#}"),
            ),
        }
    }
    if notified == 0 {
        return;
    }

    match application.request_update_result().await {
        None => logger::report(ReportKind::Idle, "no update needed"),
        Some(status) => match status.kind() {
            "success" => logger::report(ReportKind::Success, &status.to_string()),
            "unaccepted" | "unacceptedEvaluation" | "declined" => {
                logger::report(ReportKind::Warning, &status.to_string());
            }
            _ => logger::report(ReportKind::Error, &status.to_string()),
        },
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_watch_script_extensions() {
        let options = WatchOptions::default();
        assert!(options.matches(Path::new("/src/main.js")));
        assert!(options.matches(Path::new("/src/main.tsx")));
        assert!(!options.matches(Path::new("/src/readme.md")));
        assert!(!options.matches(Path::new("/src/Makefile")));
    }

    #[test]
    fn options_parse_from_toml() {
        let options = WatchOptions::from_toml(
            r#"
            roots = ["src", "lib"]
            debounce_ms = 50
            extensions = ["js"]
            "#,
        )
        .unwrap();
        assert_eq!(options.roots.len(), 2);
        assert_eq!(options.debounce_ms, 50);
        // Unspecified fields fall back to defaults.
        assert_eq!(options.cooldown_ms, 800);
        assert_eq!(options.extensions, ["js"]);
    }

    #[test]
    fn unknown_toml_fields_are_rejected() {
        assert!(WatchOptions::from_toml("debounce = 50").is_err());
    }

    #[test]
    fn file_url_map_formats_paths() {
        let map = file_url_map();
        assert_eq!(
            (&*map)(Path::new("/src/main.js")).unwrap(),
            "file:///src/main.js"
        );
    }

    #[test]
    fn watcher_buffers_events_from_construction() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let options = WatchOptions {
            roots: vec![dir.path().to_path_buf()],
            debounce_ms: 0,
            cooldown_ms: 0,
            ..WatchOptions::default()
        };
        let loader = Arc::new(crate::application::MemoryLoader::new());
        let application = Application::new(loader);
        let watcher = ModuleWatcher::new(options, file_url_map(), application).unwrap();

        // A write after construction lands in the buffered channel even
        // though the run loop has not started.
        let file = dir.path().join("m.js");
        let mut handle = std::fs::File::create(&file).unwrap();
        handle.write_all(b"export const x = 1;").unwrap();
        handle.sync_all().unwrap();

        let received = watcher
            .notify_rx
            .recv_timeout(Duration::from_secs(5))
            .is_ok();
        assert!(received, "watcher did not observe the write");
    }
}
