//! Trace - the service node graph of one trace id
//!
//! Nodes live in an arena owned by the trace. Children are held by index and
//! the parent link is a plain index back-reference.

use crate::error::{ApmError, ApmResult};
use crate::sampled::TraceLabels;
use crate::service_node::{NodeId, ServiceNode};
use crate::span::{Span, SpanKind, SpanStatus};
use crate::vendor::ApmType;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Trace {
    pub apm_type: ApmType,
    nodes: Vec<ServiceNode>,
    /// Every span id seen while relating, mapped to its owning node
    span_nodes: HashMap<String, NodeId>,
    /// Externally observed id -> real span id
    aliases: HashMap<String, String>,
    root: Option<NodeId>,
    missing_parent: Vec<NodeId>,
}

impl Trace {
    pub fn new(apm_type: ApmType) -> Self {
        Self {
            apm_type,
            nodes: Vec::new(),
            span_nodes: HashMap::new(),
            aliases: HashMap::new(),
            root: None,
            missing_parent: Vec::new(),
        }
    }

    pub fn push_node(&mut self, node: ServiceNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &ServiceNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ServiceNode {
        &mut self.nodes[id.0]
    }

    /// Nodes in creation order
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ServiceNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Install the structural root, rejecting a second one
    pub fn set_root(&mut self, id: NodeId) -> ApmResult<()> {
        match self.root {
            Some(existing) if existing != id => Err(ApmError::MultipleRoots {
                first: self.node(existing).service_name.clone(),
                second: self.node(id).service_name.clone(),
            }),
            _ => {
                self.root = Some(id);
                Ok(())
            }
        }
    }

    /// Entry nodes whose parent span was never delivered
    pub fn missing_parent(&self) -> &[NodeId] {
        &self.missing_parent
    }

    pub(crate) fn mark_missing_parent(&mut self, id: NodeId) {
        self.missing_parent.push(id);
    }

    pub fn register_span(&mut self, span_id: &str, node: NodeId) {
        self.span_nodes.insert(span_id.to_string(), node);
    }

    /// Alias an externally observed id to a real span id
    pub fn map_span_id(&mut self, observed_id: &str, real_id: &str) {
        self.aliases
            .insert(observed_id.to_string(), real_id.to_string());
    }

    /// Resolve a node by span id, then through the alias map
    pub fn node_by_span_id(&self, span_id: &str) -> Option<NodeId> {
        if let Some(&id) = self.span_nodes.get(span_id) {
            return Some(id);
        }
        self.aliases
            .get(span_id)
            .and_then(|real| self.span_nodes.get(real).copied())
    }

    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent.0].children.push(child);
        self.nodes[child.0].parent = Some(parent);
    }

    /// Nodes without a parent, in creation order
    pub fn top_level_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.parent.is_none())
            .map(|(id, _)| id)
            .collect()
    }

    /// The parent's exit span that called into this node
    pub fn client_span(&self, id: NodeId) -> Option<&Span> {
        let node = self.node(id);
        let parent = self.node(node.parent?);
        parent
            .exit_spans
            .iter()
            .find(|exit| node.matches_entry(&exit.next_span_id))
    }

    /// Correct child start times from their calling client spans, root to leaf
    pub fn fix_start_times(&mut self) {
        let Some(root) = self.root else {
            return;
        };

        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = &mut self.nodes[id.0];
            let start = *node
                .start_time
                .get_or_insert(node.entry_spans[0].start_time);

            let children = self.nodes[id.0].children.clone();
            for child in &children {
                let child_entry = self.nodes[child.0].first_entry();
                let client = self.nodes[id.0]
                    .exit_spans
                    .iter()
                    .rev()
                    .find(|exit| !exit.next_span_id.is_empty() && exit.next_span_id == child_entry.span_id);

                if let Some(client) = client {
                    if self.nodes[child.0].start_time.is_none()
                        && client.duration > child_entry.start_time
                    {
                        let fixed = (start + client.end_time()).saturating_sub(child_entry.end_time());
                        debug!(
                            service = %self.nodes[child.0].service_name,
                            start_time = fixed,
                            "Fixed start time from client span"
                        );
                        self.nodes[child.0].start_time = Some(fixed);
                    }
                }
            }
            stack.extend(children.into_iter().rev());
        }
    }

    /// Build a root from the entry sampled record and adopt every parentless node
    pub fn synthesize_root(&mut self, labels: &TraceLabels) -> NodeId {
        let status = if labels.is_error {
            SpanStatus::Error
        } else {
            SpanStatus::Ok
        };
        let mut span = Span::new(
            labels.service_name.as_str(),
            labels.url.as_str(),
            labels.apm_span_id.as_str(),
            "",
            SpanKind::Server,
        )
        .with_timing(labels.start_time, labels.duration)
        .with_status(status);
        span.not_sampled = !labels.is_sampled;

        let mut root = ServiceNode::new(span);
        root.start_time = Some(labels.start_time);
        root.set_span_id(&labels.apm_span_id);
        root.attributes = labels.attributes.clone();

        let orphans = self.top_level_nodes();
        let root_id = self.push_node(root);
        self.register_span(&labels.apm_span_id, root_id);
        self.root = Some(root_id);

        for orphan in orphans {
            self.add_child(root_id, orphan);
            self.nodes[orphan.0].check_virtual(&labels.apm_span_id);
        }
        debug!(
            service = %labels.service_name,
            children = self.nodes[root_id.0].children.len(),
            "Synthesized root from sampled record"
        );
        root_id
    }
}
