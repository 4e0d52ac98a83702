//! Captured trace dumps
//!
//! A dump holds everything one analysis needs: the spans the adapter would
//! return, the detail spans, and the sampled records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracelens_core::{
    flatten_groups, ApmError, ApmResult, QueryParams, SampledTrace, SampledTraces, Span,
    SpanGroup, TraceAdapter,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceDump {
    pub trace_id: String,
    /// Flat span list
    pub spans: Vec<Span>,
    /// Span groups as returned by the adapter list endpoint
    pub span_groups: Vec<SpanGroup>,
    pub detail_spans: Vec<Span>,
    pub records: Vec<SampledTrace>,
}

impl TraceDump {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let dump: TraceDump = serde_json::from_str(&content)?;
        Ok(dump)
    }

    pub fn sampled_traces(&self) -> SampledTraces {
        SampledTraces::from_records(self.trace_id.as_str(), self.records.clone())
    }

    /// Adapter answering from the dumped spans
    pub fn into_adapter(self) -> DumpAdapter {
        let mut spans = self.spans;
        spans.extend(flatten_groups(self.span_groups));
        DumpAdapter {
            spans,
            detail: self.detail_spans,
        }
    }
}

pub struct DumpAdapter {
    spans: Vec<Span>,
    detail: Vec<Span>,
}

#[async_trait]
impl TraceAdapter for DumpAdapter {
    async fn query_list(&self, params: &QueryParams) -> ApmResult<Vec<Span>> {
        if self.spans.is_empty() {
            return Err(ApmError::TraceNotFound(params.trace_id.clone()));
        }
        Ok(self.spans.clone())
    }

    async fn query_detail(&self, _params: &QueryParams) -> ApmResult<Vec<Span>> {
        Ok(self.detail.clone())
    }
}
