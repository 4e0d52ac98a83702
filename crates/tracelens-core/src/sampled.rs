//! Sampled trace records
//!
//! One record per observed hop, produced by the low-overhead sampler and
//! supplied by the caller. Records are read-only input to correlation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Percentile the threshold value was computed for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdType {
    #[serde(rename = "LatencyP90")]
    P90,
    #[serde(rename = "LatencyP95")]
    P95,
    #[serde(rename = "LatencyP99")]
    P99,
    #[default]
    #[serde(rename = "", other)]
    Unknown,
}

impl ThresholdType {
    pub fn percentile(&self) -> f64 {
        match self {
            ThresholdType::P90 => 0.9,
            ThresholdType::P95 => 0.95,
            ThresholdType::P99 => 0.99,
            ThresholdType::Unknown => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdType::P90 => "LatencyP90",
            ThresholdType::P95 => "LatencyP95",
            ThresholdType::P99 => "LatencyP99",
            ThresholdType::Unknown => "",
        }
    }
}

/// Window the threshold value was computed over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdRange {
    #[serde(rename = "last1h")]
    Last1h,
    #[serde(rename = "yesterday")]
    Yesterday,
    #[serde(rename = "constant")]
    Constant,
    #[default]
    #[serde(rename = "", other)]
    Unknown,
}

impl ThresholdRange {
    /// Length of the baseline window
    pub fn duration(&self) -> &'static str {
        match self {
            ThresholdRange::Yesterday => "24h",
            _ => "1h",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdRange::Last1h => "last1h",
            ThresholdRange::Yesterday => "yesterday",
            ThresholdRange::Constant => "constant",
            ThresholdRange::Unknown => "",
        }
    }
}

/// Labels reported with each sampled record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceLabels {
    pub pid: u32,
    pub tid: u32,
    pub top_span: bool,
    pub protocol: String,
    pub service_name: String,
    #[serde(rename = "content_key")]
    pub url: String,
    pub http_url: String,
    pub is_silent: bool,
    pub is_sampled: bool,
    pub is_slow: bool,
    pub is_server: bool,
    pub is_error: bool,
    pub is_profiled: bool,
    pub sample_value: i32,
    /// 1=slow, 2=normal, 3=error, 4=slow+error, >4=single trace
    pub report_type: u32,
    pub threshold_type: ThresholdType,
    /// Threshold (ns)
    pub threshold_value: f64,
    pub threshold_range: ThresholdRange,
    pub threshold_multiple: f64,
    pub trace_id: String,
    pub apm_type: String,
    pub apm_span_id: String,
    pub attributes: String,
    pub container_id: String,
    pub container_name: String,
    /// Start time (ns)
    pub start_time: u64,
    /// Duration (ns)
    pub duration: u64,
    pub end_time: u64,
    pub node_name: String,
    pub node_ip: String,
    pub offset_ts: i64,
}

impl TraceLabels {
    pub fn is_slow_report(&self) -> bool {
        self.report_type == 1 || self.report_type == 4
    }

    pub fn is_normal_report(&self) -> bool {
        self.report_type == 2
    }

    pub fn is_error_report(&self) -> bool {
        self.report_type == 3 || self.report_type == 4
    }

    pub fn is_single_trace(&self) -> bool {
        self.report_type > 4
    }

    /// P90 baseline (ns) derived from the threshold
    pub fn p90(&self) -> u64 {
        let multiple = if self.threshold_multiple > 0.0 {
            self.threshold_multiple
        } else {
            1.0
        };
        (self.threshold_value / multiple) as u64
    }
}

/// One sampled record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampledTrace {
    pub timestamp: u64,
    #[serde(rename = "data_version")]
    pub version: String,
    #[serde(rename = "data_source")]
    pub source: String,
    pub labels: TraceLabels,
    pub workload_name: String,
    pub workload_kind: String,
    pub pod_ip: String,
    pub pod_name: String,
    pub namespace: String,
}

impl SampledTrace {
    pub fn new(labels: TraceLabels) -> Self {
        Self {
            labels,
            ..Default::default()
        }
    }

    /// Instance identity: pod, else service@node@container, else service@node@pid
    pub fn instance_id(&self) -> String {
        let labels = &self.labels;
        if !self.pod_name.is_empty() {
            return self.pod_name.clone();
        }
        if !labels.container_id.is_empty() {
            return format!(
                "{}@{}@{}",
                labels.service_name, labels.node_name, labels.container_id
            );
        }
        if labels.pid > 0 {
            return format!("{}@{}@{}", labels.service_name, labels.node_name, labels.pid);
        }
        labels.service_name.clone()
    }
}

/// All sampled records of one trace id
#[derive(Debug, Clone, Default)]
pub struct SampledTraces {
    pub trace_id: String,
    records: Vec<SampledTrace>,
    root: Option<usize>,
    has_slow: bool,
    has_error: bool,
}

impl SampledTraces {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            ..Default::default()
        }
    }

    pub fn from_records(trace_id: impl Into<String>, records: Vec<SampledTrace>) -> Self {
        let mut traces = Self::new(trace_id);
        for record in records {
            traces.add(record);
        }
        traces
    }

    pub fn add(&mut self, record: SampledTrace) {
        if record.labels.apm_span_id.is_empty() {
            warn!(
                trace_id = %self.trace_id,
                service = %record.labels.service_name,
                "Sampled record without apm span id"
            );
        }
        if record.labels.top_span {
            self.root = Some(self.records.len());
        }
        if record.labels.is_profiled {
            if record.labels.is_slow_report() {
                self.has_slow = true;
            }
            if record.labels.is_error_report() {
                self.has_error = true;
            }
        }
        self.records.push(record);
    }

    pub fn records(&self) -> &[SampledTrace] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record flagged as top span, if any
    pub fn root(&self) -> Option<&SampledTrace> {
        self.root.map(|i| &self.records[i])
    }

    pub fn has_slow(&self) -> bool {
        self.has_slow
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// Record used to query the APM backend: the top span, else the longest record
    pub fn query_trace(&self) -> Option<&SampledTrace> {
        if let Some(root) = self.root() {
            return Some(root);
        }
        let mut best: Option<&SampledTrace> = None;
        for record in &self.records {
            if best.map_or(true, |b| b.labels.duration < record.labels.duration) {
                best = Some(record);
            }
        }
        best
    }

    pub fn find(&self, span_id: &str) -> Option<&SampledTrace> {
        if span_id.is_empty() {
            return None;
        }
        self.records
            .iter()
            .find(|r| r.labels.apm_span_id == span_id)
    }

    pub fn has_single_trace(&self) -> bool {
        self.records.iter().any(|r| r.labels.is_single_trace())
    }

    /// Whether records disagree on the sample value
    pub fn has_changed_sample(&self) -> bool {
        match self.records.first() {
            Some(first) => self
                .records
                .iter()
                .any(|r| r.labels.sample_value != first.labels.sample_value),
            None => false,
        }
    }

    /// Records indexed by apm span id (the last record wins on duplicates)
    pub fn span_id_index(&self) -> HashMap<&str, &SampledTrace> {
        self.records
            .iter()
            .map(|r| (r.labels.apm_span_id.as_str(), r))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(span_id: &str, duration: u64) -> SampledTrace {
        SampledTrace::new(TraceLabels {
            service_name: "svc".to_string(),
            apm_span_id: span_id.to_string(),
            duration,
            ..Default::default()
        })
    }

    #[test]
    fn test_query_trace_prefers_top_span() {
        let mut traces = SampledTraces::new("t1");
        traces.add(record("a", 500));
        let mut top = record("b", 100);
        top.labels.top_span = true;
        traces.add(top);

        assert_eq!(traces.query_trace().unwrap().labels.apm_span_id, "b");
    }

    #[test]
    fn test_query_trace_falls_back_to_longest() {
        let traces =
            SampledTraces::from_records("t1", vec![record("a", 100), record("b", 300), record("c", 300)]);
        assert_eq!(traces.query_trace().unwrap().labels.apm_span_id, "b");
        assert!(SampledTraces::new("t2").query_trace().is_none());
    }

    #[test]
    fn test_report_flags() {
        let mut slow = record("a", 1);
        slow.labels.report_type = 4;
        slow.labels.is_profiled = true;
        let mut single = record("b", 1);
        single.labels.report_type = 5;

        let traces = SampledTraces::from_records("t1", vec![slow, single]);
        assert!(traces.has_slow());
        assert!(traces.has_error());
        assert!(traces.has_single_trace());
    }

    #[test]
    fn test_unprofiled_reports_do_not_count() {
        let mut slow = record("a", 1);
        slow.labels.report_type = 1;
        let traces = SampledTraces::from_records("t1", vec![slow]);
        assert!(!traces.has_slow());
    }

    #[test]
    fn test_changed_sample() {
        let mut a = record("a", 1);
        a.labels.sample_value = 1;
        let mut b = record("b", 1);
        b.labels.sample_value = 1;
        let traces = SampledTraces::from_records("t1", vec![a.clone(), b.clone()]);
        assert!(!traces.has_changed_sample());

        b.labels.sample_value = 2;
        let traces = SampledTraces::from_records("t1", vec![a, b]);
        assert!(traces.has_changed_sample());
    }

    #[test]
    fn test_instance_id() {
        let mut r = record("a", 1);
        r.labels.node_name = "node-1".to_string();
        assert_eq!(r.instance_id(), "svc");

        r.labels.pid = 42;
        assert_eq!(r.instance_id(), "svc@node-1@42");

        r.labels.container_id = "c0ffee".to_string();
        assert_eq!(r.instance_id(), "svc@node-1@c0ffee");

        r.pod_name = "svc-7d9f".to_string();
        assert_eq!(r.instance_id(), "svc-7d9f");
    }

    #[test]
    fn test_p90_from_threshold() {
        let mut labels = TraceLabels {
            threshold_value: 300.0,
            threshold_multiple: 1.5,
            ..Default::default()
        };
        assert_eq!(labels.p90(), 200);

        labels.threshold_multiple = 0.0;
        assert_eq!(labels.p90(), 300);
    }

    #[test]
    fn test_wire_format() {
        let json = r#"{
            "timestamp": 1,
            "labels": {
                "service_name": "order",
                "content_key": "GET /orders",
                "apm_span_id": "s1",
                "threshold_type": "LatencyP95",
                "threshold_range": "yesterday",
                "threshold_value": 2000000.0
            },
            "pod_name": "order-0"
        }"#;
        let record: SampledTrace = serde_json::from_str(json).unwrap();
        assert_eq!(record.labels.url, "GET /orders");
        assert_eq!(record.labels.threshold_type, ThresholdType::P95);
        assert_eq!(record.labels.threshold_type.percentile(), 0.95);
        assert_eq!(record.labels.threshold_range.duration(), "24h");

        let odd: TraceLabels = serde_json::from_str(r#"{"threshold_type": "Custom"}"#).unwrap();
        assert_eq!(odd.threshold_type, ThresholdType::Unknown);
    }
}
