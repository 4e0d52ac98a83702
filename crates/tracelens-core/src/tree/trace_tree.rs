//! Trace tree used for slow-trace analysis

use super::{NodeInfo, Tree, TreeNode};
use crate::error::{ApmError, ApmResult};
use crate::sampled::SampledTraces;
use crate::service_node::NodeId;
use crate::trace::Trace;
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceTreeNode {
    #[serde(flatten)]
    pub info: NodeInfo,
    /// Duration of the caller's client span (ns)
    pub client_time: u64,
    /// Total time not covered by children (ns)
    pub self_time: u64,
    /// Share of the baseline left for the node itself (ns)
    #[serde(rename = "selfP90")]
    pub self_p90: u64,
    /// Anomaly score, `None` until computed
    #[serde(serialize_with = "serialize_score")]
    pub mutated_value: Option<i64>,
    /// Service node this entry was projected from
    #[serde(skip)]
    pub source: NodeId,
}

fn serialize_score<S: Serializer>(value: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(value.unwrap_or(0))
}

impl TreeNode for TraceTreeNode {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut NodeInfo {
        &mut self.info
    }
}

impl TraceTreeNode {
    pub fn mutated_value(&self) -> i64 {
        self.mutated_value.unwrap_or(0)
    }
}

pub type TraceTree = Tree<TraceTreeNode>;

impl Tree<TraceTreeNode> {
    /// Project the trace from its root, attaching sampled records by resolved span id
    pub fn build(trace: &Trace, records: &SampledTraces) -> ApmResult<Self> {
        let root = trace.root().ok_or(ApmError::NoMatchedEntry)?;
        let index = records.span_id_index();

        let mut tree = Tree::new();
        let mut stack = vec![(root, None)];
        while let Some((id, parent)) = stack.pop() {
            let node = trace.node(id);
            let mut projected = TraceTreeNode {
                info: NodeInfo::from_service_node(node),
                client_time: trace.client_span(id).map_or(0, |s| s.duration),
                self_time: 0,
                self_p90: 0,
                mutated_value: None,
                source: id,
            };
            if !node.span_id.is_empty() {
                if let Some(record) = index.get(node.span_id.as_str()) {
                    projected.info.apply_sampled(record);
                }
            }

            let current = tree.push(parent, projected);
            stack.extend(node.children.iter().rev().map(|&c| (c, Some(current))));
        }

        let root = tree.get(0);
        if !root.info.is_traced {
            return Err(ApmError::EntryNotCollected(root.info.id.clone()));
        }
        Ok(tree)
    }

    /// Compute and cache self time, self baseline and anomaly score
    pub fn calc_mutated_value(&mut self, index: usize) -> i64 {
        if let Some(value) = self.get(index).mutated_value {
            return value;
        }

        let mut out_time = 0u64;
        let mut out_p90 = 0u64;
        for &child in self.children(index) {
            let child = &self.get(child).info;
            out_time += child.total_time;
            out_p90 += if child.is_traced {
                child.p90
            } else {
                child.total_time
            };
        }

        let node = self.get_mut(index);
        node.self_time = node.info.total_time.saturating_sub(out_time);
        let p90 = node.info.p90;
        let value = if p90 > 0 {
            node.self_p90 = if p90 >= out_p90 { p90 - out_p90 } else { p90 / 2 };
            node.self_time as i64 - node.self_p90 as i64
        } else {
            node.self_p90 = 0;
            0
        };
        node.mutated_value = Some(value);
        value
    }

    pub fn calc_all_mutated_values(&mut self) {
        for index in 0..self.len() {
            self.calc_mutated_value(index);
        }
    }

    /// Span id of the mutated node, following the on-path chain from the root
    pub fn mutated_span_id(&self) -> Option<&str> {
        let mut current = if self.is_empty() { None } else { Some(0) };
        while let Some(index) = current {
            let info = &self.get(index).info;
            if info.is_mutated {
                return Some(info.span_id.as_str());
            }
            current = self
                .children(index)
                .iter()
                .copied()
                .find(|&c| self.get(c).info.is_path);
        }
        None
    }

    /// Fail on the first node, in pre-order, without a percentile baseline
    pub fn check_p90(&self) -> ApmResult<()> {
        match self.iter().find(|(_, n)| n.info.p90 == 0) {
            Some((_, node)) => Err(ApmError::MissingP90(node.info.id.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TraceBuilder;
    use crate::correlate::correlate;
    use crate::sampled::{SampledTrace, TraceLabels};
    use crate::span::{Span, SpanKind};
    use crate::vendor::ApmType;

    const MS: u64 = 1_000_000;

    fn record(service: &str, span_id: &str, threshold_ms: u64) -> SampledTrace {
        SampledTrace::new(TraceLabels {
            service_name: service.to_string(),
            url: format!("/{}", service),
            apm_span_id: span_id.to_string(),
            threshold_value: (threshold_ms * MS) as f64,
            threshold_multiple: 1.0,
            ..Default::default()
        })
    }

    fn trace() -> Trace {
        let mut client = Span::new("a", "call b", "c", "A", SpanKind::Client).with_timing(5 * MS, 90 * MS);
        client.add_attribute("http.url", "http://b/");
        let spans = vec![
            Span::new("a", "GET /a", "A", "", SpanKind::Server).with_timing(0, 100 * MS),
            client,
            Span::new("b", "GET /b", "B", "c", SpanKind::Server).with_timing(10 * MS, 80 * MS),
        ];
        TraceBuilder::default().build(ApmType::Otel, spans).unwrap()
    }

    #[test]
    fn test_projection_copies_record() {
        let mut trace = trace();
        let records = SampledTraces::from_records("t1", vec![record("a", "A", 90), record("b", "B", 20)]);
        correlate(&mut trace, &records);

        let tree = TraceTree::build(&trace, &records).unwrap();
        assert_eq!(tree.len(), 2);
        let root = tree.get(0);
        assert_eq!(root.info.url, "/a");
        assert_eq!(root.info.p90, 90 * MS);
        assert!(root.info.is_traced);

        let child = tree.get(tree.children(0)[0]);
        assert_eq!(child.client_time, 90 * MS);
        assert_eq!(child.info.total_time, 80 * MS);
        assert_eq!(tree.parent(1), Some(0));
    }

    #[test]
    fn test_untraced_root_rejected() {
        let trace = trace();
        let records = SampledTraces::from_records("t1", vec![record("b", "B", 20)]);
        let err = TraceTree::build(&trace, &records).unwrap_err();
        assert!(matches!(err, ApmError::EntryNotCollected(ref id) if id == "a"));
    }

    #[test]
    fn test_missing_root_rejected() {
        let trace = Trace::new(ApmType::Otel);
        let err = TraceTree::build(&trace, &SampledTraces::new("t1")).unwrap_err();
        assert!(matches!(err, ApmError::NoMatchedEntry));
    }

    #[test]
    fn test_scores() {
        let mut trace = trace();
        let records = SampledTraces::from_records("t1", vec![record("a", "A", 90), record("b", "B", 20)]);
        correlate(&mut trace, &records);
        let mut tree = TraceTree::build(&trace, &records).unwrap();
        tree.calc_all_mutated_values();

        let root = tree.get(0);
        assert_eq!(root.self_time, 20 * MS);
        // 90 - 20
        assert_eq!(root.self_p90, 70 * MS);
        assert_eq!(root.mutated_value(), -50 * MS as i64);

        let child = tree.get(1);
        assert_eq!(child.self_time, 80 * MS);
        assert_eq!(child.self_p90, 20 * MS);
        assert_eq!(child.mutated_value(), 60 * MS as i64);
    }

    #[test]
    fn test_self_time_floors_at_zero_for_concurrent_children() {
        // Two parallel calls whose durations add up past the caller's
        let spans = vec![
            Span::new("a", "GET /a", "A", "", SpanKind::Server).with_timing(0, 100 * MS),
            Span::new("a", "call b", "c1", "A", SpanKind::Client).with_timing(10 * MS, 80 * MS),
            Span::new("a", "call c", "c2", "A", SpanKind::Client).with_timing(10 * MS, 80 * MS),
            Span::new("b", "GET /b", "B", "c1", SpanKind::Server).with_timing(10 * MS, 80 * MS),
            Span::new("c", "GET /c", "C", "c2", SpanKind::Server).with_timing(10 * MS, 80 * MS),
        ];
        let mut trace = TraceBuilder::default().build(ApmType::Otel, spans).unwrap();
        let records = SampledTraces::from_records(
            "t1",
            vec![record("a", "A", 90), record("b", "B", 20), record("c", "C", 20)],
        );
        correlate(&mut trace, &records);
        let mut tree = TraceTree::build(&trace, &records).unwrap();
        assert_eq!(tree.children(0).len(), 2);

        let value = tree.calc_mutated_value(0);
        let root = tree.get(0);
        assert_eq!(root.self_time, 0);
        // 90 - (20 + 20)
        assert_eq!(root.self_p90, 50 * MS);
        assert_eq!(value, -50 * MS as i64);
        assert_eq!(root.mutated_value(), value);
    }

    #[test]
    fn test_self_baseline_floor() {
        let mut trace = trace();
        // Root baseline below the child's baseline
        let records = SampledTraces::from_records("t1", vec![record("a", "A", 10), record("b", "B", 20)]);
        correlate(&mut trace, &records);
        let mut tree = TraceTree::build(&trace, &records).unwrap();
        tree.calc_all_mutated_values();
        assert_eq!(tree.get(0).self_p90, 5 * MS);
    }

    #[test]
    fn test_check_p90_and_untraced_child() {
        let mut trace = trace();
        let records = SampledTraces::from_records("t1", vec![record("a", "A", 90)]);
        correlate(&mut trace, &records);
        let mut tree = TraceTree::build(&trace, &records).unwrap();

        let err = tree.check_p90().unwrap_err();
        assert!(matches!(err, ApmError::MissingP90(ref id) if id == "b"));

        tree.calc_all_mutated_values();
        // Untraced child counts with its total time: 90 - 80
        assert_eq!(tree.get(0).self_p90, 10 * MS);
        assert_eq!(tree.get(1).mutated_value(), 0);
    }

    #[test]
    fn test_mutated_span_id() {
        let mut trace = trace();
        let records = SampledTraces::from_records("t1", vec![record("a", "A", 90), record("b", "B", 20)]);
        correlate(&mut trace, &records);
        let mut tree = TraceTree::build(&trace, &records).unwrap();
        assert_eq!(tree.mutated_span_id(), None);

        tree.get_mut(1).info.is_mutated = true;
        tree.mark_path(1);
        assert_eq!(tree.mutated_span_id(), Some("B"));
    }
}
