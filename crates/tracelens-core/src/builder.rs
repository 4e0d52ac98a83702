//! Service node aggregation
//!
//! Turns the raw spans of one trace into a [`Trace`]: spans are grouped into
//! service nodes at every exit -> entry boundary and the nodes are linked into
//! a call tree.

use crate::error::{ApmError, ApmResult};
use crate::service_node::{NodeId, ServiceNode};
use crate::span::Span;
use crate::trace::Trace;
use crate::vendor::ApmType;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Raw spans indexed by id and parent
#[derive(Debug, Default)]
pub struct SpanTree {
    spans: HashMap<String, Span>,
    /// Span ids in insertion order
    order: Vec<String>,
    children: HashMap<String, Vec<String>>,
    root: Option<String>,
}

impl SpanTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_span(&mut self, span: Span) -> ApmResult<()> {
        if self.spans.contains_key(&span.span_id) {
            debug!(span_id = %span.span_id, "Ignoring repeated span");
            return Ok(());
        }

        if span.is_root() {
            if let Some(root) = &self.root {
                return Err(ApmError::MultipleRoots {
                    first: root.clone(),
                    second: span.span_id,
                });
            }
            self.root = Some(span.span_id.clone());
        } else {
            self.children
                .entry(span.parent_span_id.clone())
                .or_default()
                .push(span.span_id.clone());
        }

        self.order.push(span.span_id.clone());
        self.spans.insert(span.span_id.clone(), span);
        Ok(())
    }

    pub fn get(&self, span_id: &str) -> Option<&Span> {
        self.spans.get(span_id)
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    fn children_of(&self, span_id: &str) -> &[String] {
        self.children
            .get(span_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Depth-first pre-order walk from `start`; `visit` returns false to skip a subtree
    fn walk<'a>(&'a self, start: &'a str, mut visit: impl FnMut(&'a Span) -> bool) {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(span) = self.spans.get(id) else {
                continue;
            };
            if visit(span) {
                stack.extend(self.children_of(id).iter().rev().map(String::as_str));
            }
        }
    }

    /// Whether the span opens a callee hop: an entry span, or an internal
    /// span with such a span beneath it before any exit boundary
    fn is_child_entry(&self, span: &Span) -> bool {
        let mut found = false;
        self.walk(&span.span_id, |s| {
            if found || s.kind.is_exit() {
                return false;
            }
            if s.kind.is_entry() {
                found = true;
                return false;
            }
            true
        });
        found
    }

    /// Span ids that start a service node, in insertion order, and whether
    /// the start's parent is missing
    fn node_starts(&self) -> Vec<(&str, bool)> {
        let mut starts = Vec::new();
        for id in &self.order {
            let span = &self.spans[id];
            if span.is_root() {
                starts.push((id.as_str(), false));
                continue;
            }
            match self.spans.get(&span.parent_span_id) {
                Some(parent) => {
                    if parent.kind.is_exit() && self.is_child_entry(span) {
                        starts.push((id.as_str(), false));
                    }
                }
                None if span.kind.is_entry() => starts.push((id.as_str(), true)),
                None => {}
            }
        }
        starts
    }
}

/// Builds a [`Trace`] from raw spans
#[derive(Debug, Clone, Default)]
pub struct TraceBuilder {
    /// Promote nodes carrying exceptions to error nodes
    pub exception_as_error: bool,
}

impl TraceBuilder {
    pub fn new(exception_as_error: bool) -> Self {
        Self { exception_as_error }
    }

    pub fn build(&self, apm_type: ApmType, spans: Vec<Span>) -> ApmResult<Trace> {
        let mut tree = SpanTree::new();
        for span in spans {
            tree.add_span(span)?;
        }
        self.build_from_tree(apm_type, &mut tree)
    }

    pub fn build_from_tree(&self, apm_type: ApmType, tree: &mut SpanTree) -> ApmResult<Trace> {
        let starts: Vec<(String, bool)> = tree
            .node_starts()
            .into_iter()
            .map(|(id, missing)| (id.to_string(), missing))
            .collect();

        // Link each client span to the callee it opened
        for (id, _) in &starts {
            let parent_id = tree.spans[id].parent_span_id.clone();
            if let Some(parent) = tree.spans.get_mut(&parent_id) {
                if parent.kind.is_exit() {
                    parent.next_span_id = id.clone();
                }
            }
        }

        let tree = &*tree;
        let mut trace = Trace::new(apm_type);
        let mut start_nodes: HashMap<&str, NodeId> = HashMap::new();
        for (id, missing) in &starts {
            let span = &tree.spans[id];
            let node = trace.push_node(ServiceNode::new(span.clone()));
            if span.is_root() {
                trace.set_root(node)?;
            }
            if *missing {
                debug!(span_id = %id, service = %span.service_name, "Entry span parent is missing");
                trace.mark_missing_parent(node);
            }
            start_nodes.insert(id.as_str(), node);
        }

        for (id, _) in &starts {
            let node = start_nodes[id.as_str()];
            relate(&mut trace, tree, node, id, &start_nodes);

            relate_exceptions(&mut trace, tree, node, id);
            if self.exception_as_error && trace.node(node).has_exception {
                trace.node_mut(node).is_error = true;
            }
            if trace.node(node).is_error {
                relate_errors(&mut trace, tree, node, id);
            }
        }

        debug!(
            apm_type = %apm_type,
            spans = tree.len(),
            nodes = trace.len(),
            "Built service nodes"
        );
        Ok(trace)
    }
}

/// Attach the spans beneath `start` to `node`, linking child nodes at hop boundaries
fn relate(
    trace: &mut Trace,
    tree: &SpanTree,
    node: NodeId,
    start: &str,
    start_nodes: &HashMap<&str, NodeId>,
) {
    tree.walk(start, |span| {
        if span.span_id != start {
            if let Some(&child) = start_nodes.get(span.span_id.as_str()) {
                trace.add_child(node, child);
                return false;
            }
        }

        trace.register_span(&span.span_id, node);
        if span.kind.is_exit() {
            trace.node_mut(node).add_exit_span(span.clone());
        } else if span.kind.is_entry() {
            trace.node_mut(node).add_entry_span(span.clone());
        }
        true
    });
}

fn relate_exceptions(trace: &mut Trace, tree: &SpanTree, node: NodeId, start: &str) {
    let mut has_exception = false;
    tree.walk(start, |span| {
        if !span.exceptions.is_empty() {
            has_exception = true;
        }
        !span.kind.is_exit()
    });
    if has_exception {
        trace.node_mut(node).has_exception = true;
    }
}

fn relate_errors(trace: &mut Trace, tree: &SpanTree, node: NodeId, start: &str) {
    tree.walk(start, |span| {
        if span.is_error() && !span.kind.is_entry() {
            trace.node_mut(node).add_error_span(span.clone());
        }
        !span.kind.is_exit()
    });
}
