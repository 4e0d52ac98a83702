//! Sampled record correlation
//!
//! Resolves service nodes against sampled records. Most vendors keep span ids
//! intact so the join is a direct lookup; Pinpoint rewrites ids and is joined
//! by comparing the record interval with each candidate entry span.

use crate::sampled::SampledTraces;
use crate::span::Span;
use crate::trace::Trace;
use crate::vendor::JoinStrategy;
use tracing::debug;

/// Largest accepted overlap cost (ns) for a partial time match
pub const MAX_OVERLAP_COST: u64 = 2_000_000;

/// Symmetric difference between two intervals (ns).
///
/// Zero for identical intervals, the sum of both durations for disjoint
/// ones, otherwise the parts not covered by the overlap.
pub fn overlap_cost(a_start: u64, a_duration: u64, b_start: u64, b_duration: u64) -> u64 {
    let a_end = a_start + a_duration;
    let b_end = b_start + b_duration;

    if a_end < b_start || a_start > b_end {
        return a_duration + b_duration;
    }
    if a_start == b_start && a_end == b_end {
        return 0;
    }

    let left = a_start.max(b_start);
    let right = a_end.min(b_end);
    (a_duration + b_duration).saturating_sub(2 * (right - left))
}

/// Resolve node span ids and attributes from the sampled records
pub fn correlate(trace: &mut Trace, records: &SampledTraces) {
    if trace.apm_type.join() == JoinStrategy::TimeOverlap {
        map_by_time_overlap(trace, records);
    }

    for record in records.records() {
        let labels = &record.labels;
        let Some(id) = trace.node_by_span_id(&labels.apm_span_id) else {
            debug!(span_id = %labels.apm_span_id, service = %labels.service_name, "No service node for sampled record");
            continue;
        };

        let node = trace.node_mut(id);
        node.set_span_id(&labels.apm_span_id);
        if !labels.attributes.is_empty() {
            node.attributes = labels.attributes.clone();
        }
    }
}

fn map_by_time_overlap(trace: &mut Trace, records: &SampledTraces) {
    for record in records.records() {
        let labels = &record.labels;
        if let Some(matched) = best_overlap(trace, &labels.service_name, labels.start_time, labels.duration) {
            debug!(
                record_span_id = %labels.apm_span_id,
                span_id = %matched,
                "Matched sampled record by time overlap"
            );
            trace.map_span_id(&labels.apm_span_id, &matched);
        }
    }
}

/// Entry span of `service` closest to the interval, within [`MAX_OVERLAP_COST`]
fn best_overlap(trace: &Trace, service: &str, start: u64, duration: u64) -> Option<String> {
    let mut best: Option<(&Span, u64)> = None;
    for (_, node) in trace.nodes() {
        for entry in node.entry_spans.iter().filter(|s| s.service_name == service) {
            let cost = overlap_cost(entry.start_time, entry.duration, start, duration);
            if cost == 0 {
                return Some(entry.span_id.clone());
            }
            if best.map_or(true, |(_, c)| cost < c) {
                best = Some((entry, cost));
            }
        }
    }

    match best {
        Some((entry, cost)) if cost <= MAX_OVERLAP_COST => Some(entry.span_id.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TraceBuilder;
    use crate::sampled::{SampledTrace, TraceLabels};
    use crate::span::SpanKind;
    use crate::vendor::ApmType;

    #[test]
    fn test_overlap_cost() {
        assert_eq!(overlap_cost(100, 100, 150, 100), 100);
        assert_eq!(overlap_cost(0, 10, 100, 10), 20);
        assert_eq!(overlap_cost(100, 100, 100, 100), 0);
        // Containment
        assert_eq!(overlap_cost(0, 100, 25, 50), 50);
        assert_eq!(overlap_cost(100, 10, 0, 10), 20);
    }

    fn record(service: &str, span_id: &str, start: u64, duration: u64, attrs: &str) -> SampledTrace {
        SampledTrace::new(TraceLabels {
            service_name: service.to_string(),
            apm_span_id: span_id.to_string(),
            start_time: start,
            duration,
            attributes: attrs.to_string(),
            ..Default::default()
        })
    }

    fn spans() -> Vec<Span> {
        vec![
            Span::new("a", "GET /", "A", "", SpanKind::Server).with_timing(0, 100_000_000),
            Span::new("a", "call", "c", "A", SpanKind::Client).with_timing(10_000_000, 80_000_000),
            Span::new("b", "GET /b", "B", "c", SpanKind::Server).with_timing(11_000_000, 78_000_000),
        ]
    }

    #[test]
    fn test_exact_join() {
        let mut trace = TraceBuilder::default().build(ApmType::Otel, spans()).unwrap();
        let records = SampledTraces::from_records(
            "t1",
            vec![
                record("a", "A", 0, 100_000_000, "{\"k\":1}"),
                record("b", "B", 0, 0, ""),
                record("z", "unknown", 0, 0, ""),
            ],
        );
        correlate(&mut trace, &records);

        let root = trace.node(trace.root().unwrap());
        assert_eq!(root.span_id, "A");
        assert_eq!(root.attributes, "{\"k\":1}");
        let child = trace.node(root.children[0]);
        assert_eq!(child.span_id, "B");
        assert!(child.attributes.is_empty());
    }

    #[test]
    fn test_time_overlap_join() {
        let mut trace = TraceBuilder::default().build(ApmType::Pinpoint, spans()).unwrap();
        let records = SampledTraces::from_records(
            "t1",
            vec![
                record("a", "pp-1", 0, 100_000_000, ""),
                // 1ms off on each side: cost 2ms, still accepted
                record("b", "pp-2", 12_000_000, 76_000_000, ""),
                // Too far off
                record("b", "pp-3", 50_000_000, 10_000_000, ""),
            ],
        );
        correlate(&mut trace, &records);

        let root = trace.root().unwrap();
        assert_eq!(trace.node_by_span_id("pp-1"), Some(root));
        assert_eq!(trace.node(root).span_id, "pp-1");

        let child = trace.node(root).children[0];
        // pp-3 never resolved, so pp-2 keeps the node
        assert_eq!(trace.node(child).span_id, "pp-2");
        assert_eq!(trace.node_by_span_id("pp-3"), None);
    }
}
