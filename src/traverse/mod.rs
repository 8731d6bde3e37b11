//! Depth-first traversal over module graphs with SCC grouping.
//!
//! The update algorithm never looks at one module in isolation: cyclic
//! imports make the strongly connected component the atomic unit of
//! linking, evaluation and acceptance. This module provides the one
//! primitive everything else is built on:
//!
//! ```text
//! traverse_depth_first(root, visit_pre, visit_post, on_cancel)
//!   visit_pre(node)          -> children to descend into
//!   visit_post(scc, results) -> result, called children-first per SCC
//!   on_cancel(node)          -> rollback hook for unfinished nodes
//! ```
//!
//! `visit_pre` runs exactly once per node at discovery and chooses which
//! view of the graph to walk (current, pending, temporary) by returning the
//! matching children. `visit_post` runs once per SCC in dependency order
//! and receives the results of its successor SCCs. The async flavor awaits
//! `visit_post` SCC-by-SCC.

mod index;

pub use index::{VisitIndex, VisitIndexAllocator};

use rustc_hash::FxHashMap;
use std::hash::Hash;

/// A node in a traversable graph. Identity is by key, not by value.
pub trait GraphNode: Clone {
    type Id: Copy + Eq + Hash;

    fn id(&self) -> Self::Id;
}

// ============================================================================
// Condensation (Tarjan)
// ============================================================================

/// One strongly connected component, members in discovery order.
struct Component<N> {
    members: Vec<N>,
    /// Indexes of successor components in pop order.
    successors: Vec<usize>,
}

/// The SCC condensation of the reachable graph.
///
/// Components are stored in Tarjan pop order, which is a valid
/// dependency order: every successor of a component appears before it.
/// The root's component is always last.
struct Condensed<N> {
    components: Vec<Component<N>>,
}

struct NodeInfo<N> {
    node: N,
    children: Vec<N>,
    index: u32,
    low: u32,
    on_stack: bool,
}

/// Iterative Tarjan over the graph reachable from `root`.
///
/// `visit_pre` is invoked exactly once per node, at discovery.
fn condense<N: GraphNode>(root: N, visit_pre: &mut impl FnMut(&N) -> Vec<N>) -> Condensed<N> {
    let mut nodes: Vec<NodeInfo<N>> = Vec::new();
    let mut slots: FxHashMap<N::Id, usize> = FxHashMap::default();
    let mut counter: u32 = 0;

    let mut discover = |node: N,
                        nodes: &mut Vec<NodeInfo<N>>,
                        slots: &mut FxHashMap<N::Id, usize>,
                        stack: &mut Vec<usize>,
                        visit_pre: &mut dyn FnMut(&N) -> Vec<N>|
     -> usize {
        let slot = nodes.len();
        slots.insert(node.id(), slot);
        let children = visit_pre(&node);
        nodes.push(NodeInfo {
            node,
            children,
            index: counter,
            low: counter,
            on_stack: true,
        });
        counter += 1;
        stack.push(slot);
        slot
    };

    let mut stack: Vec<usize> = Vec::new();
    let mut call: Vec<(usize, usize)> = Vec::new();
    let mut components: Vec<Component<N>> = Vec::new();
    let mut component_of: FxHashMap<usize, usize> = FxHashMap::default();

    let root_slot = discover(root, &mut nodes, &mut slots, &mut stack, &mut *visit_pre);
    call.push((root_slot, 0));

    while let Some(&(v, cursor)) = call.last() {
        if cursor < nodes[v].children.len() {
            call.last_mut().unwrap().1 += 1;
            let child = nodes[v].children[cursor].clone();
            match slots.get(&child.id()) {
                None => {
                    let w = discover(child, &mut nodes, &mut slots, &mut stack, &mut *visit_pre);
                    call.push((w, 0));
                }
                Some(&w) => {
                    if nodes[w].on_stack {
                        nodes[v].low = nodes[v].low.min(nodes[w].index);
                    }
                }
            }
        } else {
            call.pop();
            if let Some(&(parent, _)) = call.last() {
                nodes[parent].low = nodes[parent].low.min(nodes[v].low);
            }
            if nodes[v].low == nodes[v].index {
                let mut members: Vec<usize> = Vec::new();
                loop {
                    let w = stack.pop().expect("tarjan stack underflow");
                    nodes[w].on_stack = false;
                    members.push(w);
                    if w == v {
                        break;
                    }
                }
                // Popped in reverse-discovery order; flip to discovery order.
                members.reverse();
                let component = components.len();
                for &m in &members {
                    component_of.insert(m, component);
                }
                components.push(Component {
                    members: members.iter().map(|&m| nodes[m].node.clone()).collect(),
                    successors: Vec::new(),
                });
            }
        }
    }

    // Resolve inter-component edges, deduplicated in first-encounter order.
    for (id, slot_members) in collect_members(&component_of, components.len()) {
        let mut seen = vec![false; components.len()];
        let mut successors = Vec::new();
        for v in slot_members {
            for child in &nodes[v].children {
                let w = slots[&child.id()];
                let target = component_of[&w];
                if target != id && !seen[target] {
                    seen[target] = true;
                    successors.push(target);
                }
            }
        }
        components[id].successors = successors;
    }

    debug_assert_eq!(component_of[&root_slot], components.len() - 1);
    Condensed { components }
}

/// Group node slots by component id, members in discovery order.
fn collect_members(
    component_of: &FxHashMap<usize, usize>,
    count: usize,
) -> Vec<(usize, Vec<usize>)> {
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (&slot, &id) in component_of {
        members[id].push(slot);
    }
    for group in &mut members {
        group.sort_unstable();
    }
    members.into_iter().enumerate().collect()
}

// ============================================================================
// Drivers
// ============================================================================

/// Synchronous depth-first traversal with SCC grouping.
///
/// Calls `visit_pre` once per node at discovery; the returned children
/// define the graph view being walked. Calls `visit_post` once per SCC in
/// dependency order (successors first) with the results of its successor
/// SCCs. If `visit_post` fails, `on_cancel` runs for every node whose SCC
/// had not completed, and the error is returned.
///
/// Returns the root SCC's result.
pub fn traverse_depth_first<N, R, E>(
    root: N,
    mut visit_pre: impl FnMut(&N) -> Vec<N>,
    mut visit_post: impl FnMut(&[N], Vec<R>) -> Result<R, E>,
    mut on_cancel: impl FnMut(&N),
) -> Result<R, E>
where
    N: GraphNode,
    R: Clone,
{
    let graph = condense(root, &mut visit_pre);
    let mut results: Vec<Option<R>> = Vec::with_capacity(graph.components.len());
    for (i, component) in graph.components.iter().enumerate() {
        let forward: Vec<R> = component
            .successors
            .iter()
            .map(|&s| results[s].clone().expect("successor completed before"))
            .collect();
        match visit_post(&component.members, forward) {
            Ok(result) => results.push(Some(result)),
            Err(error) => {
                for unfinished in &graph.components[i..] {
                    for node in &unfinished.members {
                        on_cancel(node);
                    }
                }
                return Err(error);
            }
        }
    }
    Ok(results.pop().flatten().expect("root component has a result"))
}

/// Asynchronous flavor of [`traverse_depth_first`].
///
/// The graph shape is still discovered synchronously via `visit_pre`;
/// `visit_post` may suspend and is awaited SCC-by-SCC in dependency order.
pub async fn traverse_depth_first_async<N, R, E, Fut>(
    root: N,
    mut visit_pre: impl FnMut(&N) -> Vec<N>,
    mut visit_post: impl FnMut(Vec<N>, Vec<R>) -> Fut,
    mut on_cancel: impl FnMut(&N),
) -> Result<R, E>
where
    N: GraphNode,
    R: Clone,
    Fut: Future<Output = Result<R, E>>,
{
    let graph = condense(root, &mut visit_pre);
    let mut results: Vec<Option<R>> = Vec::with_capacity(graph.components.len());
    for (i, component) in graph.components.iter().enumerate() {
        let forward: Vec<R> = component
            .successors
            .iter()
            .map(|&s| results[s].clone().expect("successor completed before"))
            .collect();
        match visit_post(component.members.clone(), forward).await {
            Ok(result) => results.push(Some(result)),
            Err(error) => {
                for unfinished in &graph.components[i..] {
                    for node in &unfinished.members {
                        on_cancel(node);
                    }
                }
                return Err(error);
            }
        }
    }
    Ok(results.pop().flatten().expect("root component has a result"))
}

// ============================================================================
// Tests
// ============================================================================
