//! APM adapter seam
//!
//! The analyzer fetches spans through this trait. The HTTP implementation
//! lives in `tracelens-adapter`; tests and offline runs use in-memory ones.

use crate::error::ApmResult;
use crate::span::Span;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Parameters of one adapter query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub trace_id: String,
    pub apm_type: String,
    /// Start time (ms)
    pub start_time: u64,
    /// Opaque attribute blob from the sampled record
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub attributes: String,
    #[serde(rename = "clusterId")]
    pub cluster_id: String,
}

/// Source of raw spans for a trace id
#[async_trait]
pub trait TraceAdapter: Send + Sync {
    /// All spans of the trace. An empty list means the trace is unknown.
    async fn query_list(&self, params: &QueryParams) -> ApmResult<Vec<Span>>;

    /// Fuller span set for one node's time window
    async fn query_detail(&self, params: &QueryParams) -> ApmResult<Vec<Span>>;
}

/// Pre-grouped service node as returned by adapter list endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpanGroup {
    pub entry_spans: Vec<Span>,
    pub exit_spans: Vec<Span>,
    pub error_spans: Vec<Span>,
    pub children: Vec<SpanGroup>,
}

/// Flatten span groups into raw spans, keeping the first copy of each span id
pub fn flatten_groups(groups: Vec<SpanGroup>) -> Vec<Span> {
    let mut seen = HashSet::new();
    let mut spans = Vec::new();
    let mut stack: Vec<SpanGroup> = groups.into_iter().rev().collect();

    while let Some(group) = stack.pop() {
        let SpanGroup {
            entry_spans,
            exit_spans,
            error_spans,
            children,
        } = group;
        for span in entry_spans.into_iter().chain(exit_spans).chain(error_spans) {
            if seen.insert(span.span_id.clone()) {
                spans.push(span);
            }
        }
        stack.extend(children.into_iter().rev());
    }
    spans
}
