//! Update outcome surface: status tags, stats, fatal errors.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::controller::chain::InvalidationChain;
use crate::module::{EvaluationError, LinkError};

/// Counters for one committed update.
#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateStats {
    pub duration: Duration,
    /// Members replaced by a new declaration.
    pub loads: u32,
    /// Members re-evaluated under their previous declaration.
    pub reevaluations: u32,
}

/// Which user callback phase failed fatally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalPhase {
    Dispose,
    Prune,
}

impl FatalPhase {
    fn label(self) -> &'static str {
        match self {
            Self::Dispose => "dispose",
            Self::Prune => "prune",
        }
    }
}

/// A dispose or prune callback threw. Carry-over data is already lost, so
/// the controller records this permanently and every later update
/// short-circuits with the same record.
#[derive(Debug)]
pub struct FatalError {
    url: String,
    phase: FatalPhase,
    source: anyhow::Error,
}

impl FatalError {
    pub(crate) fn new(url: &str, phase: FatalPhase, source: anyhow::Error) -> Self {
        Self {
            url: url.to_string(),
            phase,
            source,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn phase(&self) -> FatalPhase {
        self.phase
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fatal {} failure in `{}`: {}",
            self.phase.label(),
            self.url,
            self.source
        )
    }
}

impl std::error::Error for FatalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

/// Initial-load failure surfaced by `dispatch`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

// ============================================================================
// UpdateStatus
// ============================================================================

/// Outcome of one `request_update` run. A no-op update returns no status
/// at all.
#[derive(Clone, Debug)]
pub enum UpdateStatus {
    /// Replacements evaluated and accepted.
    Success { stats: UpdateStats },
    /// An invalidated module declined replacement; nothing was touched.
    Declined { declined: Vec<String> },
    /// The invalidation reached the root during the dry run; nothing was
    /// touched.
    Unaccepted { chain: InvalidationChain },
    /// The new code failed the pre-commit link test; no user code ran.
    LinkError { error: LinkError },
    /// A replacement body threw; the graph was re-linked to a consistent
    /// state.
    EvaluationError {
        error: EvaluationError,
        stats: UpdateStats,
    },
    /// A dispose or prune callback threw; permanently sticky.
    FatalError { error: Arc<FatalError> },
    /// An invalidation emerged during evaluation and reached the root;
    /// the update is already committed.
    UnacceptedEvaluation { stats: UpdateStats },
}

impl UpdateStatus {
    /// Stable tag for logging and host dispatch.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Declined { .. } => "declined",
            Self::Unaccepted { .. } => "unaccepted",
            Self::LinkError { .. } => "linkError",
            Self::EvaluationError { .. } => "evaluationError",
            Self::FatalError { .. } => "fatalError",
            Self::UnacceptedEvaluation { .. } => "unacceptedEvaluation",
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { stats } => write!(
                f,
                "updated: {} load(s), {} re-evaluation(s) in {:?}",
                stats.loads, stats.reevaluations, stats.duration
            ),
            Self::Declined { declined } => {
                write!(f, "update declined by: {}", declined.join(", "))
            }
            Self::Unaccepted { chain } => write!(f, "update not accepted:\n{chain}"),
            Self::LinkError { error } => write!(f, "link failed: {error}"),
            Self::EvaluationError { error, .. } => write!(f, "{error}"),
            Self::FatalError { error } => write!(f, "{error}"),
            Self::UnacceptedEvaluation { stats } => write!(
                f,
                "update evaluated ({} load(s), {} re-evaluation(s)) but was not accepted at the root",
                stats.loads, stats.reevaluations
            ),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_kinds_are_stable() {
        let stats = UpdateStats::default();
        assert_eq!(UpdateStatus::Success { stats }.kind(), "success");
        assert_eq!(
            UpdateStatus::Declined { declined: vec![] }.kind(),
            "declined"
        );
        assert_eq!(
            UpdateStatus::UnacceptedEvaluation { stats }.kind(),
            "unacceptedEvaluation"
        );
    }

    #[test]
    fn fatal_error_display_names_phase_and_url() {
        let error = FatalError::new(
            "file:///main.js",
            FatalPhase::Dispose,
            anyhow::anyhow!("boom"),
        );
        let display = format!("{error}");
        assert!(display.contains("dispose"));
        assert!(display.contains("file:///main.js"));
        assert!(display.contains("boom"));
    }
}
