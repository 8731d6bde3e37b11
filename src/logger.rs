//! Logging utilities with colored output and a reload status display.
//!
//! This module provides:
//! - `log!` macro for formatted terminal output with colored prefixes
//! - `debug!` macro gated on the global verbose flag
//! - [`ReloadReporter`] for the single-block reload outcome display used
//!   in watch mode

use crossterm::{
    cursor, execute,
    terminal::{Clear, ClearType},
};
use owo_colors::OwoColorize;
use parking_lot::Mutex;
use std::{
    io::{Write, stdout},
    sync::LazyLock,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

/// Global verbose flag (set by the embedding host)
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Set verbose mode globally
pub fn set_verbose(v: bool) {
    VERBOSE.store(v, Ordering::SeqCst);
}

/// Check if verbose mode is enabled
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::SeqCst)
}

// ============================================================================
// Log Macro
// ============================================================================

/// Log a message with a colored module prefix
///
/// # Usage
/// ```ignore
/// log!("update"; "message with {} formatting", args);
/// ```
#[macro_export]
macro_rules! log {
    ($module:expr; $($arg:tt)*) => {{
        $crate::logger::log($module, &format!($($arg)*))
    }};
}

/// Log a debug message (only shown when verbose is enabled)
///
/// # Usage
/// ```ignore
/// debug!("update"; "debug info: {}", value);
/// ```
#[macro_export]
macro_rules! debug {
    ($module:expr; $($arg:tt)*) => {{
        if $crate::logger::is_verbose() {
            $crate::logger::log($module, &format!($($arg)*))
        }
    }};
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Log a message with a colored module prefix
#[inline]
pub fn log(module: &str, message: &str) {
    let prefix = colorize_prefix(module);

    let mut stdout = stdout().lock();
    execute!(stdout, Clear(ClearType::UntilNewLine)).ok();
    writeln!(stdout, "{prefix} {message}").ok();
    stdout.flush().ok();
}

/// Apply color to a module prefix based on module type
#[inline]
fn colorize_prefix(module: &str) -> String {
    let prefix = format!("[{module}]");
    match module {
        "watch" => prefix.bright_green().bold().to_string(),
        "update" => prefix.bright_blue().bold().to_string(),
        "hot" => prefix.bright_cyan().bold().to_string(),
        "error" => prefix.bright_red().bold().to_string(),
        _ => prefix.bright_yellow().bold().to_string(),
    }
}

// ============================================================================
// Reload reporter (single-block outcome display for watch mode)
// ============================================================================

/// Outcome class of one reported reload attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportKind {
    /// Update committed.
    Success,
    /// The graph refused the update (declined, unaccepted) or a watched
    /// file disappeared.
    Warning,
    /// Link, evaluation, import or fatal failure.
    Error,
    /// Nothing to do.
    Idle,
}

impl ReportKind {
    fn glyph(self) -> String {
        match self {
            Self::Success => "✓".green().to_string(),
            Self::Warning => "⚠".yellow().to_string(),
            Self::Error => "✗".red().to_string(),
            Self::Idle => "·".dimmed().to_string(),
        }
    }
}

/// Single-block reload outcome display for watch mode.
///
/// Each reported outcome replaces the previous block, so the terminal
/// keeps exactly one visible record of the latest reload: an uptime
/// stamp, an outcome glyph, a running reload counter, and the message.
///
/// # Example
///
/// ```ignore
/// let mut reporter = ReloadReporter::new();
/// reporter.report(ReportKind::Success, "updated: 1 load in 12ms");
/// reporter.report(ReportKind::Error, "evaluation of `file:///a.js` failed");
/// ```
pub struct ReloadReporter {
    /// Watcher start, for the uptime stamp.
    started: Instant,
    /// Reloads reported so far.
    reports: u32,
    /// Terminal height of the currently visible block.
    block_lines: u16,
}

/// Global reporter shared by the watch-mode subsystems, so import
/// failures and update results replace each other in one block.
static REPORTER: LazyLock<Mutex<ReloadReporter>> =
    LazyLock::new(|| Mutex::new(ReloadReporter::new()));

impl Default for ReloadReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReloadReporter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            reports: 0,
            block_lines: 0,
        }
    }

    /// Report one reload outcome, replacing the previous block.
    pub fn report(&mut self, kind: ReportKind, message: &str) {
        self.reports += 1;
        let stamp = uptime_stamp(self.started.elapsed());
        let counter = format!("#{}", self.reports);
        let block = format!(
            "{} {} {} {message}",
            stamp.dimmed(),
            kind.glyph(),
            counter.dimmed()
        );

        let mut stdout = stdout().lock();
        for _ in 0..self.block_lines {
            execute!(
                stdout,
                cursor::MoveToPreviousLine(1),
                Clear(ClearType::CurrentLine)
            )
            .ok();
        }
        writeln!(stdout, "{block}").ok();
        stdout.flush().ok();

        self.block_lines = block_height(&block);
    }

    /// Keep the current block on screen; the next report starts a new one
    /// instead of overwriting.
    pub fn detach(&mut self) {
        self.block_lines = 0;
    }

    /// Reloads reported so far.
    pub fn reports(&self) -> u32 {
        self.reports
    }
}

/// Report a reload outcome through the global watch-mode reporter.
pub fn report(kind: ReportKind, message: &str) {
    REPORTER.lock().report(kind, message);
}

/// Detach the global reporter's current block.
pub fn detach() {
    REPORTER.lock().detach();
}

/// Uptime formatted as HH:MM:SS.
fn uptime_stamp(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

/// Terminal lines a rendered block occupies.
fn block_height(block: &str) -> u16 {
    u16::try_from(block.lines().count()).unwrap_or(u16::MAX)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_stamp_formats_hours_minutes_seconds() {
        assert_eq!(uptime_stamp(Duration::ZERO), "00:00:00");
        assert_eq!(uptime_stamp(Duration::from_secs(5)), "00:00:05");
        assert_eq!(uptime_stamp(Duration::from_secs(3725)), "01:02:05");
    }

    #[test]
    fn block_height_counts_rendered_lines() {
        assert_eq!(block_height("updated: file:///main.js"), 1);
        assert_eq!(block_height("update failed\nboom\n  at file:///a.js"), 3);
    }

    #[test]
    fn reporter_counts_reports_and_tracks_height() {
        let mut reporter = ReloadReporter::new();
        assert_eq!(reporter.reports(), 0);

        reporter.report(ReportKind::Idle, "no update needed");
        assert_eq!(reporter.reports(), 1);
        assert_eq!(reporter.block_lines, 1);

        reporter.report(ReportKind::Error, "update failed\ndetail");
        assert_eq!(reporter.reports(), 2);
        assert_eq!(reporter.block_lines, 2);
    }

    #[test]
    fn detach_forgets_the_visible_block() {
        let mut reporter = ReloadReporter::new();
        reporter.report(ReportKind::Success, "updated");
        reporter.detach();
        assert_eq!(reporter.block_lines, 0);
        // The counter keeps running across detached blocks.
        assert_eq!(reporter.reports(), 1);
    }
}
