//! The hot-reload update algorithm.
//!
//! `request_update` runs from the root controller across the whole
//! reachable graph, in phases:
//!
//! 0. Sticky fatal: a recorded dispose/prune failure short-circuits.
//! 1. Dry run: assign `pending`/`previous` on every reachable controller
//!    and decide, SCC by SCC, what is invalidated, declined, or accepted.
//!    No user code runs; a negative outcome rolls back to a no-op.
//! 2. Link test: clone replaced regions into `temporary` instances and
//!    prove the new code links before committing to evaluate it.
//! 3. Commit: dispose, swap in replacements, link, evaluate in dependency
//!    order with per-SCC rollback, and let previous instances accept or
//!    re-invalidate the result.
//! 4. Finalize: drop `previous` everywhere and prune modules that fell out
//!    of the graph, cloning them back into `staging` for later revival.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use crate::application::Application;
use crate::controller::chain::{self, InvalidatedSccs};
use crate::controller::result::{FatalError, FatalPhase, UpdateStats, UpdateStatus};
use crate::controller::ReloadableModuleController;
use crate::hot::predicates::{self, ChangedDependency};
use crate::module::{EvaluationError, InstanceState, LinkError, Value};
use crate::traverse::{traverse_depth_first, traverse_depth_first_async};

type Controller = Arc<ReloadableModuleController>;

/// Per-SCC outcome of the dry run, forwarded to predecessor SCCs.
#[derive(Clone)]
struct DryRunOutcome {
    /// Any member of this SCC carries new code.
    new_code_here: bool,
    /// New code anywhere in this SCC or below.
    tree_new_code: bool,
    /// Invalidated members of this SCC; parents test acceptance against
    /// these.
    invalidated: Vec<Controller>,
    /// Declined module URLs in this SCC and below.
    declined: Vec<String>,
    /// Work exists in this SCC or below.
    needs_dispatch: bool,
}

#[derive(Clone)]
struct LinkTestOutcome {
    /// A replaced SCC exists here or below.
    has_update: bool,
}

/// Per-SCC outcome of the commit phase.
#[derive(Clone)]
struct CommitOutcome {
    tree_did_update: bool,
    /// Members whose previous instance did not self-accept the
    /// replacement; parents re-test acceptance against these.
    invalidated: Vec<Controller>,
}

enum CommitError {
    Fatal(Arc<FatalError>),
    Evaluation(EvaluationError),
    Link(LinkError),
}

impl ReloadableModuleController {
    /// Run the hot-reload algorithm across the graph reachable from this
    /// (root) controller. Returns `None` when there is nothing to do.
    pub(crate) async fn request_update(
        &self,
        application: &Arc<Application>,
    ) -> Option<UpdateStatus> {
        // Phase 0: sticky fatal.
        if let Some(error) = self.fatal_error() {
            return Some(UpdateStatus::FatalError { error });
        }
        let started = Instant::now();

        // Phase 1: dry-run acceptance.
        let mut visited: Vec<Controller> = Vec::new();
        let mut invalidated_sccs: InvalidatedSccs = FxHashMap::default();
        let dry = self.dry_run(&mut visited, &mut invalidated_sccs);

        if !dry.needs_dispatch {
            rollback(&visited);
            crate::debug!("update"; "no update needed");
            return None;
        }
        if !dry.declined.is_empty() {
            let declined = dedup_strings(dry.declined);
            rollback(&visited);
            return Some(UpdateStatus::Declined { declined });
        }
        if !dry.invalidated.is_empty() {
            let chain = chain::build(self, application, &invalidated_sccs);
            rollback(&visited);
            return Some(UpdateStatus::Unaccepted { chain });
        }

        // Phase 2: link test, proving new code links before any user
        // code runs.
        if dry.tree_new_code
            && let Err(error) = self.link_test(&visited)
        {
            rollback(&visited);
            return Some(UpdateStatus::LinkError { error });
        }

        // Phase 3: commit link & evaluate.
        let previous_controllers = {
            let index = application.visit_indexes().acquire();
            let mut out = Vec::new();
            self.traverse_view(
                index.tag(),
                &|controller| controller.previous().or_else(|| controller.pending()),
                &mut out,
            );
            out
        };

        let loads = Arc::new(AtomicU32::new(0));
        let reevaluations = Arc::new(AtomicU32::new(0));
        let commit: Result<CommitOutcome, CommitError> = traverse_depth_first_async(
            self.arc(),
            |controller: &Controller| {
                controller
                    .pending()
                    .map(|instance| instance.iterate_dependencies())
                    .unwrap_or_default()
            },
            |component: Vec<Controller>, forward: Vec<CommitOutcome>| {
                let application = application.clone();
                let loads = loads.clone();
                let reevaluations = reevaluations.clone();
                async move {
                    commit_component(application, component, forward, loads, reevaluations).await
                }
            },
            |_| {},
        )
        .await;

        let stats = UpdateStats {
            duration: started.elapsed(),
            loads: loads.load(Ordering::SeqCst),
            reevaluations: reevaluations.load(Ordering::SeqCst),
        };
        let status = match commit {
            Ok(outcome) => {
                if outcome.invalidated.is_empty() {
                    UpdateStatus::Success { stats }
                } else {
                    // An invalidation emerged during evaluation that the
                    // dry run had no way to see.
                    UpdateStatus::UnacceptedEvaluation { stats }
                }
            }
            Err(CommitError::Fatal(error)) => {
                self.set_fatal_error(error.clone());
                repair_links(&visited);
                UpdateStatus::FatalError { error }
            }
            Err(CommitError::Evaluation(error)) => {
                repair_links(&visited);
                UpdateStatus::EvaluationError { error, stats }
            }
            Err(CommitError::Link(error)) => {
                repair_links(&visited);
                UpdateStatus::LinkError { error }
            }
        };

        // Phase 4: finalize: drop previous, prune orphans.
        let status = match self.finalize(application, &visited, &previous_controllers) {
            Some(error) => UpdateStatus::FatalError { error },
            None => status,
        };
        crate::debug!("update"; "{}", status);
        Some(status)
    }

    /// Phase 1: assign `pending = staging ?? current`, `previous =
    /// current` on every reachable controller and compute acceptance.
    fn dry_run(
        &self,
        visited: &mut Vec<Controller>,
        invalidated_sccs: &mut InvalidatedSccs,
    ) -> DryRunOutcome {
        let result: Result<DryRunOutcome, std::convert::Infallible> = traverse_depth_first(
            self.arc(),
            |controller: &Controller| {
                {
                    let mut slots = controller.slots.lock();
                    slots.pending = slots.staging.clone().or_else(|| slots.current.clone());
                    slots.previous = slots.current.clone();
                }
                visited.push(controller.clone());
                controller
                    .pending()
                    .map(|instance| instance.iterate_dependencies())
                    .unwrap_or_default()
            },
            |component, forward: Vec<DryRunOutcome>| {
                let new_code_here = component.iter().any(|c| c.has_new_code());
                let forward_updates =
                    dedup_controllers(forward.iter().flat_map(|f| f.invalidated.iter().cloned()));
                let forward_urls: Vec<String> = forward_updates
                    .iter()
                    .map(|c| c.url().to_string())
                    .collect();

                let mut any_member_invalid = false;
                let mut invalidated: Vec<Controller> = Vec::new();
                for controller in component {
                    let current = controller.current();
                    let member_invalid = controller.has_new_code()
                        || current.is_none()
                        || current.as_ref().is_some_and(predicates::is_invalidated)
                        || current
                            .as_ref()
                            .is_some_and(|c| !predicates::is_accepted(c, &forward_urls));
                    any_member_invalid |= member_invalid;
                    let self_accepted =
                        current.as_ref().is_some_and(predicates::is_accepted_self);
                    if member_invalid && !self_accepted {
                        invalidated.push(controller.clone());
                    }
                }

                let mut declined: Vec<String> = forward
                    .iter()
                    .flat_map(|f| f.declined.iter().cloned())
                    .collect();
                for controller in &invalidated {
                    if controller
                        .current()
                        .as_ref()
                        .is_some_and(predicates::is_declined)
                    {
                        declined.push(controller.url().to_string());
                    }
                }

                if !invalidated.is_empty() {
                    let urls = Arc::new(
                        invalidated
                            .iter()
                            .map(|c| c.url().to_string())
                            .collect::<Vec<_>>(),
                    );
                    for controller in component {
                        invalidated_sccs
                            .insert(Arc::as_ptr(controller) as usize, urls.clone());
                    }
                }

                Ok(DryRunOutcome {
                    new_code_here,
                    tree_new_code: new_code_here || forward.iter().any(|f| f.tree_new_code),
                    needs_dispatch: new_code_here
                        || any_member_invalid
                        || forward.iter().any(|f| f.needs_dispatch),
                    invalidated,
                    declined,
                })
            },
            |_| {},
        );
        match result {
            Ok(outcome) => outcome,
            Err(never) => match never {},
        }
    }

    /// Phase 2: clone every replaced region into `temporary` instances
    /// and link them under the `temporary ?? pending` view. Commits no
    /// side effects to user code.
    fn link_test(&self, visited: &[Controller]) -> Result<(), LinkError> {
        let result: Result<LinkTestOutcome, LinkError> = traverse_depth_first(
            self.arc(),
            |controller: &Controller| {
                controller
                    .pending()
                    .map(|instance| instance.iterate_dependencies())
                    .unwrap_or_default()
            },
            |component, forward: Vec<LinkTestOutcome>| {
                let below = forward.iter().any(|f| f.has_update);
                let replaced = component.iter().any(|c| c.has_new_code());
                if replaced || below {
                    for controller in component {
                        if let Some(pending) = controller.pending() {
                            let temporary = pending.clone_instance();
                            temporary.instantiate(None);
                            controller.set_temporary(Some(temporary));
                        }
                    }
                    for controller in component {
                        if let Some(temporary) = controller.temporary() {
                            temporary.link(&|child| {
                                child.temporary().or_else(|| child.pending())
                            })?;
                        }
                    }
                }
                Ok(LinkTestOutcome {
                    has_update: replaced || below,
                })
            },
            |_| {},
        );
        // The test instances never survive, success or not.
        for controller in visited {
            if let Some(temporary) = controller.take_temporary() {
                temporary.unlink();
            }
        }
        result.map(|_| ())
    }

    /// Phase 4: clear `previous` everywhere and prune controllers that
    /// are no longer reachable, staging a clone for later revival.
    /// Returns a fatal error raised by a prune callback.
    fn finalize(
        &self,
        application: &Arc<Application>,
        visited: &[Controller],
        previous_controllers: &[Controller],
    ) -> Option<Arc<FatalError>> {
        let reachable: FxHashSet<usize> = {
            let index = application.visit_indexes().acquire();
            let mut out = Vec::new();
            if self.current().is_some() {
                self.traverse_view(index.tag(), &|controller| controller.current(), &mut out);
            }
            out.iter().map(|c| Arc::as_ptr(c) as usize).collect()
        };

        for controller in visited {
            controller.set_previous(None);
        }

        let mut fatal = None;
        for controller in previous_controllers {
            if reachable.contains(&(Arc::as_ptr(controller) as usize)) {
                continue;
            }
            let Some(current) = controller.current() else {
                continue;
            };
            if let Err(source) = predicates::prune(&current) {
                let error = Arc::new(FatalError::new(
                    controller.url(),
                    FatalPhase::Prune,
                    source,
                ));
                self.set_fatal_error(error.clone());
                fatal = Some(error);
            }
            controller.set_staging(Some(current.clone_instance()));
            controller.set_current(None);
            controller.set_previous(None);
            controller.set_pending(None);
            crate::debug!("update"; "pruned `{}`", controller.url());
        }
        fatal
    }
}

// ============================================================================
// Commit
// ============================================================================

/// Phase 3 body for one SCC: decide whether this component updates, and
/// if so dispose → replace → link → evaluate → self-accept.
async fn commit_component(
    application: Arc<Application>,
    component: Vec<Controller>,
    forward: Vec<CommitOutcome>,
    loads: Arc<AtomicU32>,
    reevaluations: Arc<AtomicU32>,
) -> Result<CommitOutcome, CommitError> {
    let tree_did_update_below = forward.iter().any(|f| f.tree_did_update);
    let forward_updates =
        dedup_controllers(forward.iter().flat_map(|f| f.invalidated.iter().cloned()));

    let mut needs_update = component.iter().any(|controller| {
        controller.staging().is_some()
            || controller
                .current()
                .as_ref()
                .is_some_and(predicates::is_invalidated)
    });

    if !needs_update && tree_did_update_below {
        // Rebind live imports against the replaced children, then give
        // dependency-specific accept handlers a chance to absorb the
        // update without re-evaluating this component.
        let changed: Vec<ChangedDependency> = forward_updates
            .iter()
            .map(|controller| ChangedDependency {
                url: controller.url().to_string(),
                namespace: controller
                    .current()
                    .and_then(|instance| instance.namespace(&|c| c.current()).ok())
                    .unwrap_or(Value::Null),
            })
            .collect();
        for controller in &component {
            if let Some(current) = controller.current() {
                current
                    .relink(&|child| child.current())
                    .map_err(CommitError::Link)?;
            }
        }
        for controller in &component {
            if controller
                .current()
                .as_ref()
                .is_some_and(|current| !predicates::try_accept(current, &changed))
            {
                needs_update = true;
            }
        }
    }

    if !needs_update {
        // current and pending are the same instance here by construction.
        for controller in &component {
            controller.set_pending(None);
        }
        return Ok(CommitOutcome {
            tree_did_update: tree_did_update_below,
            invalidated: Vec::new(),
        });
    }

    // Replace every member: dispose the old instance, adopt the new one.
    for controller in &component {
        let data = match controller.current() {
            Some(current) => Some(predicates::dispose(&current).map_err(|source| {
                CommitError::Fatal(Arc::new(FatalError::new(
                    controller.url(),
                    FatalPhase::Dispose,
                    source,
                )))
            })?),
            None => None,
        };
        let Some(pending) = controller.pending() else {
            continue;
        };
        let next = match controller.current() {
            // Self-update: same declaration must re-run, so clone it.
            Some(current) if Arc::ptr_eq(&current, &pending) => current.clone_instance(),
            _ => pending,
        };
        next.instantiate(data);
        controller.set_current(Some(next));
    }

    // Link the replacement generation; successor SCCs are committed.
    for controller in &component {
        if let Some(current) = controller.current() {
            current
                .link(&|child| child.current())
                .map_err(CommitError::Link)?;
        }
    }

    // Evaluate sequentially; on a throw, revert every member that did not
    // finish evaluating (the thrower and members the loop never reached)
    // so current never points at a half-evaluated tree.
    for controller in &component {
        let Some(current) = controller.current() else {
            continue;
        };
        if let Err(error) = current.evaluate(&application).await {
            for member in &component {
                let Some(instance) = member.current() else {
                    continue;
                };
                let finished = instance.state() == InstanceState::Evaluated
                    && instance.evaluation_error().is_none();
                if !finished {
                    let previous = member.previous();
                    member.set_current(previous);
                }
            }
            return Err(CommitError::Evaluation(error));
        }
        let adopted_staging = controller
            .staging()
            .is_some_and(|staging| Arc::ptr_eq(&staging, &current));
        if adopted_staging {
            controller.set_staging(None);
        }
    }

    // Let the previous generation accept (or re-invalidate) the result.
    let mut invalidated: Vec<Controller> = Vec::new();
    for controller in &component {
        match controller.previous() {
            Some(previous) => {
                let handle = controller.clone();
                let accepted = predicates::try_accept_self(&previous, move || {
                    handle
                        .current()
                        .and_then(|instance| instance.namespace(&|c| c.current()).ok())
                        .unwrap_or(Value::Null)
                });
                if !accepted {
                    invalidated.push(controller.clone());
                }
                let same_declaration = controller.current().is_some_and(|instance| {
                    Arc::ptr_eq(instance.declaration(), previous.declaration())
                });
                if same_declaration {
                    reevaluations.fetch_add(1, Ordering::SeqCst);
                } else {
                    loads.fetch_add(1, Ordering::SeqCst);
                }
            }
            // Fresh load, nothing to ask.
            None => {
                loads.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    for controller in &component {
        controller.set_pending(None);
    }
    Ok(CommitOutcome {
        tree_did_update: true,
        invalidated,
    })
}

// ============================================================================
// Rollback helpers
// ============================================================================

/// Clear update scratch on every controller touched by the dry run.
fn rollback(visited: &[Controller]) {
    for controller in visited {
        let mut slots = controller.slots.lock();
        slots.pending = None;
        slots.previous = None;
        slots.temporary = None;
    }
}

/// After a commit failure: release un-adopted pending instances and
/// re-bind every surviving current instance so the graph stays linked.
fn repair_links(visited: &[Controller]) {
    for controller in visited {
        if let Some(pending) = controller.take_pending() {
            let live = controller
                .current()
                .is_some_and(|current| Arc::ptr_eq(&current, &pending));
            if !live {
                pending.unlink();
            }
        }
    }
    for controller in visited {
        if let Some(current) = controller.current()
            && current.state() != InstanceState::Unlinked
        {
            let _ = current.relink(&|child| child.current());
        }
    }
}

fn dedup_controllers(iter: impl Iterator<Item = Controller>) -> Vec<Controller> {
    let mut seen = FxHashSet::default();
    let mut out = Vec::new();
    for controller in iter {
        if seen.insert(Arc::as_ptr(&controller) as usize) {
            out.push(controller);
        }
    }
    out
}

fn dedup_strings(list: Vec<String>) -> Vec<String> {
    let mut seen = FxHashSet::default();
    let mut out = Vec::new();
    for item in list {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}
