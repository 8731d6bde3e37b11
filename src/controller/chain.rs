//! Human-readable invalidation chains.
//!
//! When a dry run ends with the root un-accepted, the update result
//! carries a tree describing how the invalidation travelled from the
//! changed leaves up to the root: one node per invalidated SCC, with a
//! `...` sentinel where a walk revisits a module.

use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::sync::Arc;

use crate::application::Application;
use crate::controller::ReloadableModuleController;

/// One SCC's worth of invalidated modules and the paths below it.
#[derive(Clone, Debug)]
pub struct ChainNode {
    pub modules: Vec<String>,
    pub children: Vec<ChainNode>,
    /// Set on sentinel nodes produced at repeat visits.
    pub truncated: bool,
}

/// Tree of invalidated SCC node lists, rooted at the update root.
#[derive(Clone, Debug)]
pub struct InvalidationChain {
    root: Option<ChainNode>,
}

impl InvalidationChain {
    pub fn root(&self) -> Option<&ChainNode> {
        self.root.as_ref()
    }

    /// Flat list of every invalidated module URL in the chain.
    pub fn modules(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<&ChainNode> = self.root.iter().collect();
        while let Some(node) = stack.pop() {
            if !node.truncated {
                out.extend(node.modules.iter().cloned());
            }
            stack.extend(node.children.iter());
        }
        out
    }
}

/// Per-controller invalidation info captured during the dry run: every
/// member of an invalidated SCC maps to the shared list of that SCC's
/// invalidated URLs.
pub(crate) type InvalidatedSccs = FxHashMap<usize, Arc<Vec<String>>>;

/// Build the chain by walking the pending view from the root.
///
/// Runs as a nested traversal: it acquires its own visit index so it can
/// cut cycles without touching the suspended update walk's state.
pub(crate) fn build(
    root: &ReloadableModuleController,
    application: &Arc<Application>,
    invalidated: &InvalidatedSccs,
) -> InvalidationChain {
    let index = application.visit_indexes().acquire();
    let mut emitted = FxHashSet::default();
    let root = walk(root, index.tag(), invalidated, &mut emitted);
    InvalidationChain { root }
}

fn walk(
    controller: &ReloadableModuleController,
    tag: u32,
    invalidated: &InvalidatedSccs,
    emitted: &mut FxHashSet<usize>,
) -> Option<ChainNode> {
    if controller.visit_index() == tag {
        return Some(ChainNode {
            modules: vec![controller.url().to_string()],
            children: Vec::new(),
            truncated: true,
        });
    }
    controller.set_visit_index(tag);

    let mut children = Vec::new();
    if let Some(instance) = controller.pending() {
        for child in instance.iterate_dependencies() {
            if let Some(node) = walk(&child, tag, invalidated, emitted) {
                children.push(node);
            }
        }
    }

    let key = controller as *const ReloadableModuleController as usize;
    match invalidated.get(&key) {
        Some(urls) => {
            // Members of one SCC share the same list; emit it once.
            if emitted.insert(Arc::as_ptr(urls) as usize) {
                Some(ChainNode {
                    modules: (**urls).clone(),
                    children,
                    truncated: false,
                })
            } else if children.is_empty() {
                None
            } else {
                Some(ChainNode {
                    modules: Vec::new(),
                    children,
                    truncated: false,
                })
            }
        }
        None if children.is_empty() => None,
        None => Some(ChainNode {
            modules: Vec::new(),
            children,
            truncated: false,
        }),
    }
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for InvalidationChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            Some(root) => fmt_node(f, root, 0),
            None => writeln!(f, "(empty)"),
        }
    }
}

fn fmt_node(f: &mut fmt::Formatter<'_>, node: &ChainNode, depth: usize) -> fmt::Result {
    let next_depth = if node.modules.is_empty() && !node.truncated {
        // Pass-through node: hoist its children to this level.
        depth
    } else {
        let indent = "  ".repeat(depth);
        if node.truncated {
            writeln!(f, "{indent}{} ...", node.modules.join(", "))?;
        } else {
            writeln!(f, "{indent}{}", node.modules.join(", "))?;
        }
        depth + 1
    };
    for child in &node.children {
        fmt_node(f, child, next_depth)?;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn node(modules: &[&str], children: Vec<ChainNode>) -> ChainNode {
        ChainNode {
            modules: modules.iter().map(|m| m.to_string()).collect(),
            children,
            truncated: false,
        }
    }

    #[test]
    fn display_indents_by_depth() {
        let chain = InvalidationChain {
            root: Some(node(
                &["file:///main.js"],
                vec![node(&["file:///a.js", "file:///b.js"], vec![])],
            )),
        };
        let rendered = chain.to_string();
        assert_eq!(
            rendered,
            "file:///main.js\n  file:///a.js, file:///b.js\n"
        );
    }

    #[test]
    fn display_marks_truncated_nodes() {
        let chain = InvalidationChain {
            root: Some(ChainNode {
                modules: vec!["file:///loop.js".into()],
                children: vec![ChainNode {
                    modules: vec!["file:///loop.js".into()],
                    children: vec![],
                    truncated: true,
                }],
                truncated: false,
            }),
        };
        assert!(chain.to_string().contains("file:///loop.js ..."));
    }

    #[test]
    fn modules_flattens_the_tree() {
        let chain = InvalidationChain {
            root: Some(node(
                &["file:///main.js"],
                vec![node(&["file:///a.js"], vec![])],
            )),
        };
        let mut modules = chain.modules();
        modules.sort();
        assert_eq!(modules, ["file:///a.js", "file:///main.js"]);
    }
}
