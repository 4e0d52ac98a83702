//! Trace analyzer - drives one slow or error query end to end
//!
//! Fetch spans through the adapter, aggregate them into service nodes,
//! correlate with the sampled records, apply the vendor root fallback, fix
//! start times, project and rank. Detail spans are fetched for the selected
//! node(s) when the vendor is configured for it.

use crate::adapter::{QueryParams, TraceAdapter};
use crate::builder::TraceBuilder;
use crate::client_call::{client_calls, ClientCall};
use crate::correlate::correlate;
use crate::error::{ApmError, ApmResult};
use crate::rank::{find_mutated_node, find_root_cause_error_node, MutationMode};
use crate::sampled::{SampledTrace, SampledTraces};
use crate::service_node::NodeId;
use crate::trace::Trace;
use crate::tree::{ErrorTree, TraceTree};
use crate::vendor::{ApmType, RootFallback};
use serde::Serialize;
use tracing::{debug, info};

/// Analyzer settings, resolved from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerOptions {
    /// Percent of the entry duration a root cause must account for
    pub mutated_ratio: u32,
    pub mode: MutationMode,
    /// Vendors whose selected nodes are refilled from the detail endpoint
    pub detail_types: Vec<ApmType>,
    pub exception_as_error: bool,
    pub cluster_id: String,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            mutated_ratio: 10,
            mode: MutationMode::default(),
            detail_types: Vec::new(),
            exception_as_error: false,
            cluster_id: String::new(),
        }
    }
}

/// Outcome of a slow-trace query
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowAnalysis {
    pub tree: TraceTree,
    #[serde(skip)]
    pub mutated: usize,
    pub mutated_span_id: String,
    pub client_calls: Vec<ClientCall>,
}

/// Outcome of an error-trace query
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorAnalysis {
    pub tree: ErrorTree,
    #[serde(skip)]
    pub root_cause: usize,
    pub root_cause_span_id: String,
}

pub struct TraceAnalyzer {
    adapter: Box<dyn TraceAdapter>,
    options: AnalyzerOptions,
}

impl TraceAnalyzer {
    pub fn new(adapter: Box<dyn TraceAdapter>, options: AnalyzerOptions) -> Self {
        Self { adapter, options }
    }

    pub fn options(&self) -> &AnalyzerOptions {
        &self.options
    }

    pub fn needs_detail(&self, apm_type: ApmType) -> bool {
        self.options.detail_types.contains(&apm_type)
    }

    fn params(&self, trace_id: &str, apm_type: &str, start_time: u64, attributes: &str) -> QueryParams {
        QueryParams {
            trace_id: trace_id.to_string(),
            apm_type: apm_type.to_string(),
            start_time: start_time / 1_000_000,
            attributes: attributes.to_string(),
            cluster_id: self.options.cluster_id.clone(),
        }
    }

    /// Fetch and assemble the service node graph of `trace_id`
    pub async fn query_trace(&self, trace_id: &str, entry: &SampledTrace, records: &SampledTraces) -> ApmResult<Trace> {
        let labels = &entry.labels;
        let apm_type = ApmType::from_name(&labels.apm_type);

        let params = self.params(trace_id, &labels.apm_type, labels.start_time, &labels.attributes);
        let spans = self.adapter.query_list(&params).await?;
        if spans.is_empty() {
            return Err(ApmError::TraceNotFound(trace_id.to_string()));
        }

        let mut trace = TraceBuilder::new(self.options.exception_as_error).build(apm_type, spans)?;
        correlate(&mut trace, records);

        if trace.root().is_none() {
            match apm_type.root_fallback() {
                RootFallback::SynthesizeFromRecord => {
                    trace.synthesize_root(labels);
                }
                RootFallback::Fail => {
                    return Err(ApmError::MissingRootSpan {
                        trace_id: trace_id.to_string(),
                        apm_type: labels.apm_type.clone(),
                    });
                }
            }
        }

        trace.fix_start_times();
        Ok(trace)
    }

    /// Build the trace tree and select the node responsible for the slowness
    pub async fn analyze_slow(&self, trace_id: &str, records: &SampledTraces) -> ApmResult<SlowAnalysis> {
        let entry = records
            .query_trace()
            .ok_or_else(|| ApmError::NoSampledTraces(trace_id.to_string()))?;
        let labels = &entry.labels;
        if labels.threshold_value as u64 >= labels.duration {
            return Err(ApmError::EntryBelowThreshold {
                service: labels.service_name.clone(),
                duration: labels.duration,
                threshold_type: labels.threshold_type.as_str().to_string(),
                threshold_range: labels.threshold_range.as_str().to_string(),
                threshold_value: labels.threshold_value,
            });
        }

        let mut trace = self.query_trace(trace_id, entry, records).await?;
        let mut tree = TraceTree::build(&trace, records)?;
        let mutated = find_mutated_node(&mut tree, trace_id, self.options.mutated_ratio, self.options.mode)?;

        let source = tree.get(mutated).source;
        if self.needs_detail(trace.apm_type) {
            self.fill_detail_spans(trace_id, &labels.apm_type, &mut trace, source)
                .await?;
        }

        let mutated_span_id = tree.get(mutated).info.span_id.clone();
        let calls = client_calls(&trace, &trace.node(source).span_id);
        info!(
            trace_id,
            span_id = %mutated_span_id,
            service = %tree.get(mutated).info.service_name,
            client_calls = calls.len(),
            "Slow trace analyzed"
        );

        Ok(SlowAnalysis {
            tree,
            mutated,
            mutated_span_id,
            client_calls: calls,
        })
    }

    /// Build the error tree and select the deepest traced error node
    pub async fn analyze_error(&self, trace_id: &str, records: &SampledTraces) -> ApmResult<ErrorAnalysis> {
        let entry = records
            .query_trace()
            .ok_or_else(|| ApmError::NoSampledTraces(trace_id.to_string()))?;

        let mut trace = self.query_trace(trace_id, entry, records).await?;
        let mut tree = ErrorTree::build(&trace, records)?;

        if self.needs_detail(trace.apm_type) {
            let sources: Vec<NodeId> = tree
                .iter()
                .filter(|(_, n)| n.is_error && n.is_sampled)
                .map(|(_, n)| n.source)
                .collect();
            for source in sources {
                self.fill_detail_spans(trace_id, &entry.labels.apm_type, &mut trace, source)
                    .await?;
                tree.refresh_error_spans(&trace, source);
            }
        }

        let root_cause = find_root_cause_error_node(&mut tree, trace_id)?;
        let root_cause_span_id = tree.get(root_cause).info.span_id.clone();
        info!(
            trace_id,
            span_id = %root_cause_span_id,
            depth = tree.get(root_cause).depth,
            "Error trace analyzed"
        );

        Ok(ErrorAnalysis {
            tree,
            root_cause,
            root_cause_span_id,
        })
    }

    /// Merge the detail spans of one node's time window into its error and exit spans
    pub async fn fill_detail_spans(
        &self,
        trace_id: &str,
        apm_type: &str,
        trace: &mut Trace,
        id: NodeId,
    ) -> ApmResult<()> {
        let node = trace.node(id);
        let params = self.params(trace_id, apm_type, node.effective_start_time(), &node.attributes);
        let spans = self.adapter.query_detail(&params).await?;

        debug!(
            trace_id,
            span_id = %node.span_id,
            spans = spans.len(),
            "Merging detail spans"
        );
        let node = trace.node_mut(id);
        for span in spans {
            if span.is_error() {
                node.add_error_span(span.clone());
            }
            if span.kind.is_exit() {
                node.add_exit_span(span);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampled::TraceLabels;
    use crate::span::{Span, SpanKind, SpanStatus};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    const MS: u64 = 1_000_000;

    /// Adapter answering every query from fixed span lists
    #[derive(Default)]
    struct ScriptedAdapter {
        list: Vec<Span>,
        detail: Vec<Span>,
        detail_calls: Arc<Mutex<Vec<QueryParams>>>,
    }

    #[async_trait]
    impl TraceAdapter for ScriptedAdapter {
        async fn query_list(&self, _params: &QueryParams) -> ApmResult<Vec<Span>> {
            Ok(self.list.clone())
        }

        async fn query_detail(&self, params: &QueryParams) -> ApmResult<Vec<Span>> {
            self.detail_calls.lock().unwrap().push(params.clone());
            Ok(self.detail.clone())
        }
    }

    fn record(apm_type: &str, span_id: &str, service: &str, start: u64, duration: u64, threshold: u64) -> SampledTrace {
        SampledTrace::new(TraceLabels {
            apm_type: apm_type.to_string(),
            apm_span_id: span_id.to_string(),
            service_name: service.to_string(),
            url: format!("GET /{}", service),
            start_time: start,
            duration,
            threshold_value: threshold as f64,
            threshold_multiple: 1.0,
            is_sampled: true,
            is_profiled: true,
            ..Default::default()
        })
    }

    /// A(0-100ms) -> c(10-90ms) -> B(10-90ms)
    fn two_hop() -> Vec<Span> {
        vec![
            Span::new("a", "GET /a", "A", "", SpanKind::Server).with_timing(0, 100 * MS),
            Span::new("a", "call b", "c", "A", SpanKind::Client).with_timing(10 * MS, 80 * MS),
            Span::new("b", "GET /b", "B", "c", SpanKind::Server).with_timing(10 * MS, 80 * MS),
        ]
    }

    fn two_hop_records() -> SampledTraces {
        SampledTraces::from_records(
            "t1",
            vec![
                record("otel", "A", "a", 0, 100 * MS, 90 * MS),
                record("otel", "B", "b", 10 * MS, 80 * MS, 20 * MS),
            ],
        )
    }

    fn analyzer(adapter: ScriptedAdapter, options: AnalyzerOptions) -> TraceAnalyzer {
        TraceAnalyzer::new(Box::new(adapter), options)
    }

    #[tokio::test]
    async fn test_slow_single_selects_child() {
        let adapter = ScriptedAdapter {
            list: two_hop(),
            ..Default::default()
        };
        let options = AnalyzerOptions {
            mutated_ratio: 50,
            mode: MutationMode::Single,
            ..Default::default()
        };
        let analysis = analyzer(adapter, options)
            .analyze_slow("t1", &two_hop_records())
            .await
            .unwrap();

        let tree = &analysis.tree;
        let b = tree.get(analysis.mutated);
        assert_eq!(b.info.service_name, "b");
        assert_eq!(b.self_time, 80 * MS);
        assert_eq!(b.mutated_value(), 60 * MS as i64);
        assert!(b.info.is_mutated);
        assert!(b.info.is_path);
        assert!(tree.get(0).info.is_path);
        assert_eq!(analysis.mutated_span_id, "B");
        assert_eq!(tree.mutated_span_id(), Some("B"));
        assert!(analysis.client_calls.is_empty());
    }

    #[tokio::test]
    async fn test_slow_fills_detail_spans() {
        let adapter = ScriptedAdapter {
            list: two_hop(),
            detail: vec![
                Span::new("b", "SELECT", "d1", "B", SpanKind::Client)
                    .with_timing(20 * MS, 60 * MS)
                    .with_status(SpanStatus::Error),
            ],
            ..Default::default()
        };
        let options = AnalyzerOptions {
            mutated_ratio: 50,
            mode: MutationMode::Single,
            detail_types: vec![ApmType::Otel],
            ..Default::default()
        };
        let analyzer = analyzer(adapter, options);
        let analysis = analyzer.analyze_slow("t1", &two_hop_records()).await.unwrap();

        assert_eq!(analysis.client_calls.len(), 1);
        assert_eq!(analysis.client_calls[0].client_name, "SELECT");
        assert!(analysis.client_calls[0].server_name.is_empty());
    }

    #[tokio::test]
    async fn test_detail_query_uses_node_window() {
        const BASE: u64 = 1_700_000_000_000 * MS;
        let spans = vec![
            Span::new("a", "GET /a", "A", "", SpanKind::Server).with_timing(BASE, 100 * MS),
            Span::new("a", "call b", "c", "A", SpanKind::Client).with_timing(BASE + 10 * MS, 80 * MS),
            Span::new("b", "GET /b", "B", "c", SpanKind::Server).with_timing(BASE + 10 * MS, 80 * MS),
        ];
        let mut b_record = record("otel", "B", "b", BASE + 10 * MS, 80 * MS, 20 * MS);
        b_record.labels.attributes = "{\"pod\":\"b-1\"}".to_string();
        let records = SampledTraces::from_records(
            "t1",
            vec![record("otel", "A", "a", BASE, 100 * MS, 90 * MS), b_record],
        );

        let calls = Arc::new(Mutex::new(Vec::new()));
        let adapter = ScriptedAdapter {
            list: spans,
            detail_calls: calls.clone(),
            ..Default::default()
        };
        let options = AnalyzerOptions {
            cluster_id: "prod".to_string(),
            ..Default::default()
        };
        let analyzer = analyzer(adapter, options);
        let entry = records.query_trace().unwrap();
        let mut trace = analyzer.query_trace("t1", entry, &records).await.unwrap();

        let b = trace.node_by_span_id("B").unwrap();
        analyzer
            .fill_detail_spans("t1", "otel", &mut trace, b)
            .await
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].trace_id, "t1");
        assert_eq!(calls[0].start_time, 1_700_000_000_010);
        assert_eq!(calls[0].attributes, "{\"pod\":\"b-1\"}");
        assert_eq!(calls[0].cluster_id, "prod");
    }

    #[tokio::test]
    async fn test_entry_below_threshold() {
        let records = SampledTraces::from_records(
            "t1",
            vec![record("otel", "A", "a", 0, 100 * MS, 100 * MS)],
        );
        let err = analyzer(ScriptedAdapter::default(), AnalyzerOptions::default())
            .analyze_slow("t1", &records)
            .await
            .unwrap_err();
        assert!(matches!(err, ApmError::EntryBelowThreshold { .. }));
        assert!(err.is_insufficient_signal());
    }

    #[tokio::test]
    async fn test_no_records_and_empty_trace() {
        let analyzer = analyzer(ScriptedAdapter::default(), AnalyzerOptions::default());
        let err = analyzer
            .analyze_error("t1", &SampledTraces::new("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApmError::NoSampledTraces(_)));

        let err = analyzer
            .analyze_slow("t1", &two_hop_records())
            .await
            .unwrap_err();
        assert!(matches!(err, ApmError::TraceNotFound(_)));
    }

    #[tokio::test]
    async fn test_other_vendor_uses_default_policies() {
        let records = SampledTraces::from_records(
            "t1",
            vec![
                record("jaeger", "A", "a", 0, 100 * MS, 90 * MS),
                record("jaeger", "B", "b", 10 * MS, 80 * MS, 20 * MS),
            ],
        );
        let adapter = ScriptedAdapter {
            list: two_hop(),
            ..Default::default()
        };
        let trace = analyzer(adapter, AnalyzerOptions::default())
            .query_trace("t1", &records.records()[0], &records)
            .await
            .unwrap();
        assert_eq!(trace.apm_type, ApmType::Other);
        let root = trace.root().unwrap();
        assert_eq!(trace.node(root).span_id, "A");

        let adapter = ScriptedAdapter {
            list: orphan_spans(),
            ..Default::default()
        };
        let err = analyzer(adapter, AnalyzerOptions::default())
            .analyze_slow("t1", &records)
            .await
            .unwrap_err();
        assert!(matches!(err, ApmError::MissingRootSpan { ref apm_type, .. } if apm_type == "jaeger"));
    }

    fn orphan_spans() -> Vec<Span> {
        vec![Span::new("b", "GET /b", "B", "lost", SpanKind::Server).with_timing(10 * MS, 80 * MS)]
    }

    #[tokio::test]
    async fn test_missing_root_fails_for_otel() {
        let adapter = ScriptedAdapter {
            list: orphan_spans(),
            ..Default::default()
        };
        let err = analyzer(adapter, AnalyzerOptions::default())
            .analyze_slow("t1", &two_hop_records())
            .await
            .unwrap_err();
        assert!(matches!(err, ApmError::MissingRootSpan { .. }));
        assert!(err.is_structural());
    }

    #[tokio::test]
    async fn test_arms_synthesizes_virtual_root() {
        let mut root = record("arms", "R", "gateway", 0, 100 * MS, 50 * MS);
        root.labels.top_span = true;
        let records = SampledTraces::from_records(
            "t1",
            vec![root, record("arms", "B", "b", 10 * MS, 80 * MS, 20 * MS)],
        );
        let adapter = ScriptedAdapter {
            list: orphan_spans(),
            ..Default::default()
        };
        let options = AnalyzerOptions {
            mode: MutationMode::Single,
            ..Default::default()
        };
        let analysis = analyzer(adapter, options)
            .analyze_slow("t1", &records)
            .await
            .unwrap();

        let tree = &analysis.tree;
        assert_eq!(tree.get(0).info.service_name, "gateway");
        assert_eq!(tree.get(0).info.span_id, "R");
        let child = tree.children(0)[0];
        assert!(tree.get(child).info.miss_vnode);
        assert_eq!(analysis.mutated, child);
    }

    /// A -> B -> C, every hop erroring
    fn three_hop_errors() -> Vec<Span> {
        let err = SpanStatus::Error;
        vec![
            Span::new("a", "GET /a", "A", "", SpanKind::Server).with_timing(0, 100).with_status(err),
            Span::new("a", "call b", "c1", "A", SpanKind::Client).with_timing(10, 80).with_status(err),
            Span::new("b", "GET /b", "B", "c1", SpanKind::Server).with_timing(10, 80).with_status(err),
            Span::new("b", "call c", "c2", "B", SpanKind::Client).with_timing(20, 60).with_status(err),
            Span::new("c", "GET /c", "C", "c2", SpanKind::Server).with_timing(20, 60).with_status(err),
        ]
    }

    fn error_record(span_id: &str, service: &str, duration: u64) -> SampledTrace {
        let mut record = record("otel", span_id, service, 0, duration, 0);
        record.labels.is_error = true;
        record
    }

    #[tokio::test]
    async fn test_error_deepest_traced() {
        let records = SampledTraces::from_records(
            "t1",
            vec![
                error_record("A", "a", 100),
                error_record("B", "b", 80),
                error_record("C", "c", 60),
            ],
        );
        let adapter = ScriptedAdapter {
            list: three_hop_errors(),
            ..Default::default()
        };
        let analysis = analyzer(adapter, AnalyzerOptions::default())
            .analyze_error("t1", &records)
            .await
            .unwrap();

        let node = analysis.tree.get(analysis.root_cause);
        assert_eq!(node.depth, 3);
        assert_eq!(analysis.root_cause_span_id, "C");
        assert!(analysis.tree.get(0).info.is_path);
    }

    #[tokio::test]
    async fn test_error_deepest_untraced_fails() {
        let records = SampledTraces::from_records(
            "t1",
            vec![error_record("A", "a", 100), error_record("B", "b", 80)],
        );
        let adapter = ScriptedAdapter {
            list: three_hop_errors(),
            ..Default::default()
        };
        let err = analyzer(adapter, AnalyzerOptions::default())
            .analyze_error("t1", &records)
            .await
            .unwrap_err();
        assert!(matches!(err, ApmError::Untraceable { .. }));
    }

    #[tokio::test]
    async fn test_error_detail_refreshes_error_spans() {
        let records = SampledTraces::from_records(
            "t1",
            vec![
                error_record("A", "a", 100),
                error_record("B", "b", 80),
                error_record("C", "c", 60),
            ],
        );
        let mut detail = Span::new("c", "SELECT", "d1", "C", SpanKind::Client)
            .with_timing(30, 10)
            .with_status(SpanStatus::Error);
        detail.add_exception(35, "SQLException", "deadlock", "");
        let adapter = ScriptedAdapter {
            list: three_hop_errors(),
            detail: vec![detail],
            ..Default::default()
        };
        let options = AnalyzerOptions {
            detail_types: vec![ApmType::Otel],
            ..Default::default()
        };
        let analysis = analyzer(adapter, options)
            .analyze_error("t1", &records)
            .await
            .unwrap();

        let node = analysis.tree.get(analysis.root_cause);
        assert!(node.error_spans.iter().any(|s| s.name == "SELECT"));
        assert_eq!(node.root_cause_exception().unwrap().kind, "SQLException");
    }
}
