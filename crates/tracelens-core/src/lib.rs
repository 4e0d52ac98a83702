//! Tracelens Core - trace reconstruction and root-cause ranking
//!
//! This crate turns the raw spans of one trace id into a service-level call
//! tree and points at the hop most likely responsible for a slow or failed
//! request:
//!
//! - **Spans**: vendor-neutral span model and semantic-convention helpers
//! - **Builder**: aggregation of spans into service nodes
//! - **Correlate**: joining service nodes with sampled trace records
//! - **Tree**: trace and error tree projections
//! - **Rank**: mutated node and root-cause error node selection
//! - **Analyzer**: end-to-end query orchestration over a [`TraceAdapter`]

pub mod adapter;
pub mod analyzer;
pub mod builder;
pub mod client_call;
pub mod config;
pub mod correlate;
pub mod error;
pub mod rank;
pub mod sampled;
pub mod service_node;
pub mod span;
pub mod trace;
pub mod transform;
pub mod tree;
pub mod vendor;

// Re-export commonly used types
pub use adapter::{flatten_groups, QueryParams, SpanGroup, TraceAdapter};
pub use analyzer::{AnalyzerOptions, ErrorAnalysis, SlowAnalysis, TraceAnalyzer};
pub use builder::{SpanTree, TraceBuilder};
pub use client_call::{client_calls, ClientCall, ClientInfo, RequestKind};
pub use config::{ConfigError, ConfigLoader, TracelensConfig};
pub use error::{ApmError, ApmResult};
pub use rank::{find_mutated_node, find_root_cause_error_node, MutationMode};
pub use sampled::{SampledTrace, SampledTraces, ThresholdRange, ThresholdType, TraceLabels};
pub use service_node::{NodeId, ServiceNode};
pub use span::{Exception, Span, SpanKind, SpanStatus};
pub use trace::Trace;
pub use tree::{ErrorSpan, ErrorTree, ErrorTreeNode, NodeInfo, TraceTree, TraceTreeNode, Tree};
pub use vendor::ApmType;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
