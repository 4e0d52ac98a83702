//! Presentation trees projected from a [`Trace`](crate::trace::Trace)
//!
//! Both projections share an index-based tree. Index 0 is the root, parents
//! are index back-references, and the tree serializes as nested JSON.

mod error_tree;
mod trace_tree;

pub use error_tree::{error_spans, ErrorSpan, ErrorTree, ErrorTreeNode};
pub use trace_tree::{TraceTree, TraceTreeNode};

use crate::sampled::{SampledTrace, ThresholdRange, ThresholdType};
use crate::service_node::ServiceNode;
use serde::{Serialize, Serializer};

/// Fields shared by every projected node
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Instance id when sampled, else the service name
    pub id: String,
    pub service_name: String,
    pub url: String,
    /// Start time (ns)
    pub start_time: u64,
    /// Duration of the authoritative entry span (ns)
    pub total_time: u64,
    /// Percentile baseline (ns), zero when untraced
    pub p90: u64,
    #[serde(rename = "threshold_type")]
    pub threshold_type: ThresholdType,
    #[serde(rename = "threshold_value")]
    pub threshold_value: f64,
    #[serde(rename = "threshold_range")]
    pub threshold_range: ThresholdRange,
    #[serde(rename = "threshold_multiple")]
    pub threshold_multiple: f64,
    pub is_traced: bool,
    pub is_profiled: bool,
    pub pod: String,
    #[serde(rename = "podNS")]
    pub pod_ns: String,
    pub workload: String,
    pub workload_type: String,
    pub is_path: bool,
    pub is_mutated: bool,
    #[serde(rename = "missVNode")]
    pub miss_vnode: bool,
    pub span_id: String,
    #[serde(skip)]
    pub original_span_id: String,
    #[serde(skip)]
    pub container_id: String,
    #[serde(skip)]
    pub node_ip: String,
    #[serde(skip)]
    pub node_name: String,
    #[serde(skip)]
    pub pid: u32,
}

impl NodeInfo {
    pub fn from_service_node(node: &ServiceNode) -> Self {
        let entry = node.entry_span();
        Self {
            id: entry.service_name.clone(),
            service_name: entry.service_name.clone(),
            url: entry.name.clone(),
            start_time: node.start_time.unwrap_or(entry.start_time),
            total_time: entry.duration,
            miss_vnode: node.virtual_node,
            span_id: node.span_id.clone(),
            original_span_id: node.original_span_id.clone(),
            ..Default::default()
        }
    }

    /// Copy baseline and workload metadata from the matched record
    pub fn apply_sampled(&mut self, record: &SampledTrace) {
        let labels = &record.labels;
        self.id = record.instance_id();
        self.url = labels.url.clone();
        self.p90 = labels.p90();
        self.threshold_type = labels.threshold_type;
        self.threshold_value = labels.threshold_value;
        self.threshold_range = labels.threshold_range;
        self.threshold_multiple = labels.threshold_multiple;
        self.is_traced = true;
        self.is_profiled = labels.is_profiled;
        self.pid = labels.pid;
        self.container_id = labels.container_id.clone();
        self.node_ip = labels.node_ip.clone();
        self.node_name = labels.node_name.clone();
        self.pod = record.pod_name.clone();
        self.pod_ns = record.namespace.clone();
        self.workload = record.workload_name.clone();
        self.workload_type = record.workload_kind.clone();
    }
}

/// Access to the shared fields of a projected node
pub trait TreeNode {
    fn info(&self) -> &NodeInfo;
    fn info_mut(&mut self) -> &mut NodeInfo;
}

/// Index-based tree of projected nodes
#[derive(Debug, Clone)]
pub struct Tree<N> {
    nodes: Vec<N>,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
}

impl<N> Default for Tree<N> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            parents: Vec::new(),
            children: Vec::new(),
        }
    }
}

impl<N> Tree<N> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node under `parent`; the first node pushed becomes the root
    pub fn push(&mut self, parent: Option<usize>, node: N) -> usize {
        let index = self.nodes.len();
        self.nodes.push(node);
        self.parents.push(parent);
        self.children.push(Vec::new());
        if let Some(parent) = parent {
            self.children[parent].push(index);
        }
        index
    }

    pub fn root(&self) -> Option<&N> {
        self.nodes.first()
    }

    pub fn get(&self, index: usize) -> &N {
        &self.nodes[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut N {
        &mut self.nodes[index]
    }

    pub fn parent(&self, index: usize) -> Option<usize> {
        self.parents[index]
    }

    pub fn children(&self, index: usize) -> &[usize] {
        &self.children[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in pre-order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &N)> {
        self.nodes.iter().enumerate()
    }
}

impl<N: TreeNode> Tree<N> {
    /// Flag the node and all its ancestors as on-path
    pub fn mark_path(&mut self, index: usize) {
        let mut current = Some(index);
        while let Some(i) = current {
            self.nodes[i].info_mut().is_path = true;
            current = self.parents[i];
        }
    }

    pub fn find_by_span_id(&self, span_id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.info().span_id == span_id)
    }

    /// Whether a direct child of the node is a virtual node
    pub fn has_virtual_child(&self, index: usize) -> bool {
        self.children[index]
            .iter()
            .any(|&c| self.nodes[c].info().miss_vnode)
    }
}

#[derive(Serialize)]
struct Nested<'a, N: Serialize> {
    #[serde(flatten)]
    node: &'a N,
    children: Vec<Nested<'a, N>>,
}

impl<N: Serialize> Tree<N> {
    fn nested(&self, index: usize) -> Nested<'_, N> {
        Nested {
            node: &self.nodes[index],
            children: self.children[index]
                .iter()
                .map(|&c| self.nested(c))
                .collect(),
        }
    }
}

impl<N: Serialize> Serialize for Tree<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.nodes.is_empty() {
            serializer.serialize_none()
        } else {
            self.nested(0).serialize(serializer)
        }
    }
}
