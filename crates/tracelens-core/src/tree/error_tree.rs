//! Error tree used for failed-request analysis

use super::{NodeInfo, Tree, TreeNode};
use crate::error::{ApmError, ApmResult};
use crate::sampled::SampledTraces;
use crate::service_node::{NodeId, ServiceNode};
use crate::span::{Exception, Span};
use crate::trace::Trace;
use serde::Serialize;
use std::collections::HashMap;

const HTTP_ERROR_CODE: &str = "HTTP ERROR CODE";

/// An erroring span as presented in the error tree
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSpan {
    pub name: String,
    /// Start time (ns)
    pub start_time: u64,
    /// Duration (ns)
    pub total_time: u64,
    pub attributes: HashMap<String, String>,
    pub exceptions: Vec<Exception>,
}

impl ErrorSpan {
    pub fn new(name: impl Into<String>, start_time: u64, total_time: u64) -> Self {
        Self {
            name: name.into(),
            start_time,
            total_time,
            ..Default::default()
        }
    }
}

impl From<&Span> for ErrorSpan {
    fn from(span: &Span) -> Self {
        Self {
            name: span.name.clone(),
            start_time: span.start_time,
            total_time: span.duration,
            attributes: span.attributes.clone(),
            exceptions: span.exceptions.clone(),
        }
    }
}

/// Status codes outside 2xx; unparsable codes count as errors
fn is_error_status(code: &str) -> bool {
    match code.trim().parse::<u16>() {
        Ok(status) => !(200..300).contains(&status),
        Err(_) => !code.trim().is_empty(),
    }
}

/// Error spans of a node: collected error spans, entry spans carrying
/// exceptions, and one synthesized span for an HTTP error status reported
/// without an exception
pub fn error_spans(node: &ServiceNode) -> Vec<ErrorSpan> {
    let mut spans: Vec<ErrorSpan> = node.error_spans.iter().map(ErrorSpan::from).collect();
    spans.extend(
        node.entry_spans
            .iter()
            .filter(|s| !s.exceptions.is_empty())
            .map(ErrorSpan::from),
    );

    let status_entry = node
        .entry_spans
        .iter()
        .filter(|s| s.is_error() && s.exceptions.is_empty())
        .filter_map(|s| s.http_status_code().map(|code| (s, code)))
        .filter(|(_, code)| is_error_status(code))
        .last();
    if let Some((entry, code)) = status_entry {
        let mut span = ErrorSpan::new(entry.name.as_str(), entry.start_time, entry.duration);
        span.exceptions.push(Exception::new(
            entry.end_time() / 1000,
            HTTP_ERROR_CODE,
            format!("{}: {}", HTTP_ERROR_CODE, code),
            "",
        ));
        spans.push(span);
    }
    spans
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTreeNode {
    #[serde(flatten)]
    pub info: NodeInfo,
    pub is_sampled: bool,
    pub is_error: bool,
    /// Root is depth 1
    pub depth: usize,
    pub error_spans: Vec<ErrorSpan>,
    #[serde(skip)]
    pub source: NodeId,
}

impl TreeNode for ErrorTreeNode {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut NodeInfo {
        &mut self.info
    }
}

impl ErrorTreeNode {
    /// Earliest exception among the node's error spans
    pub fn root_cause_exception(&self) -> Option<&Exception> {
        let mut earliest: Option<&Exception> = None;
        for exception in self.error_spans.iter().flat_map(|s| &s.exceptions) {
            if earliest.map_or(true, |e| exception.timestamp < e.timestamp) {
                earliest = Some(exception);
            }
        }
        earliest
    }
}

pub type ErrorTree = Tree<ErrorTreeNode>;

impl Tree<ErrorTreeNode> {
    pub fn build(trace: &Trace, records: &SampledTraces) -> ApmResult<Self> {
        let root = trace.root().ok_or(ApmError::NoMatchedEntry)?;
        let index = records.span_id_index();

        let mut tree = Tree::new();
        let mut stack = vec![(root, None, 1usize)];
        while let Some((id, parent, depth)) = stack.pop() {
            let node = trace.node(id);
            let mut projected = ErrorTreeNode {
                info: NodeInfo::from_service_node(node),
                is_sampled: !node.entry_span().not_sampled,
                is_error: node.is_error,
                depth,
                error_spans: error_spans(node),
                source: id,
            };
            if !node.span_id.is_empty() {
                if let Some(record) = index.get(node.span_id.as_str()) {
                    projected.info.apply_sampled(record);
                    projected.is_error = record.labels.is_error;
                }
            }

            let current = tree.push(parent, projected);
            stack.extend(
                node.children
                    .iter()
                    .rev()
                    .map(|&c| (c, Some(current), depth + 1)),
            );
        }
        Ok(tree)
    }

    /// Recompute the error spans of the node projected from `source`
    pub fn refresh_error_spans(&mut self, trace: &Trace, source: NodeId) {
        let spans = error_spans(trace.node(source));
        for index in 0..self.len() {
            if self.get(index).source == source {
                self.get_mut(index).error_spans = spans.clone();
            }
        }
    }
}
