//! Error types for tracelens-core

use thiserror::Error;

/// Errors raised while building, correlating or ranking a trace
#[derive(Debug, Error)]
pub enum ApmError {
    /// Two parentless spans (or two root service nodes) in one trace
    #[error("more than one root entry: {first}, {second}")]
    MultipleRoots { first: String, second: String },

    /// No root span and the vendor has no fallback
    #[error("miss root span for trace[{trace_id}] of {apm_type}")]
    MissingRootSpan { trace_id: String, apm_type: String },

    /// Projection found nothing to start from
    #[error("no matched entry span is found in the APM system")]
    NoMatchedEntry,

    /// The root entry was never seen by the sampled trace collector
    #[error("entry[{0}] is not collected by the sampled trace system")]
    EntryNotCollected(String),

    /// Vendor name that has no correlation policy
    #[error("no match apmType is found: {0}")]
    UnknownApmType(String),

    /// The caller supplied no sampled trace records
    #[error("trace[{0}] has no sampled trace records")]
    NoSampledTraces(String),

    /// The entry request is not slower than its own threshold
    #[error(
        "entry service({service}) duration({duration}) is less than threshold({threshold_type}({threshold_range})={threshold_value})"
    )]
    EntryBelowThreshold {
        service: String,
        duration: u64,
        threshold_type: String,
        threshold_range: String,
        threshold_value: f64,
    },

    /// Nothing left to rank
    #[error("trace[{0}] has no candidate node")]
    NoCandidate(String),

    /// Best node is mutated but does not carry enough of the total duration
    #[error("Instance({instance}) selfTime({self_time_ms:.2}ms) has not enough duration ratio({percent:.2}%)")]
    InsufficientRatio {
        instance: String,
        self_time_ms: f64,
        percent: f64,
    },

    /// Best service group does not carry enough of the total duration
    #[error("service({service}) selfTime({self_time_ms:.2}ms) has not enough duration ratio({percent:.2}%)")]
    InsufficientServiceRatio {
        service: String,
        self_time_ms: f64,
        percent: f64,
    },

    /// Selected node is not slower than its baseline
    #[error("Instance({instance}) URL({url}) is not mutated. Mutated[{mutated_value}], Self: {self_time}")]
    NotMutated {
        instance: String,
        url: String,
        mutated_value: i64,
        self_time: u64,
    },

    /// No node scored above its baseline
    #[error("trace[{0}] has no mutated service")]
    NoMutatedService(String),

    /// None of the top three service groups cleared the ratio threshold
    #[error("trace[{0}]: no Top3 service has enough duration ratio")]
    NoQualifiedService(String),

    /// A top three candidate cleared the threshold but has no profile data
    #[error("top3 node [{0}] has enough duration ratio but is not profiled")]
    NotProfiled(String),

    /// A projected node has no percentile baseline
    #[error("p90 is not found for Instance({0})")]
    MissingP90(String),

    /// Error tree without any erroring node
    #[error("trace[{0}] has no error node")]
    NoErrorNode(String),

    /// Deepest erroring node was never matched to a sampled record
    #[error("trace[{trace_id}] span({span_id}) is not traced")]
    Untraceable { trace_id: String, span_id: String },

    /// Adapter answered with an empty span list
    #[error("[x Trace NotFound] traceId: {0}")]
    TraceNotFound(String),

    /// Adapter or transport failure, passed through untouched
    #[error("adapter error: {0}")]
    Upstream(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ApmError {
    /// Fatal to the query: the trace cannot be assembled
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ApmError::MultipleRoots { .. }
                | ApmError::MissingRootSpan { .. }
                | ApmError::NoMatchedEntry
                | ApmError::EntryNotCollected(_)
                | ApmError::UnknownApmType(_)
                | ApmError::NoSampledTraces(_)
        )
    }

    /// Expected outcome: the trace was assembled but no node qualifies
    pub fn is_insufficient_signal(&self) -> bool {
        matches!(
            self,
            ApmError::EntryBelowThreshold { .. }
                | ApmError::NoCandidate(_)
                | ApmError::InsufficientRatio { .. }
                | ApmError::InsufficientServiceRatio { .. }
                | ApmError::NotMutated { .. }
                | ApmError::NoMutatedService(_)
                | ApmError::NoQualifiedService(_)
                | ApmError::NotProfiled(_)
                | ApmError::MissingP90(_)
                | ApmError::NoErrorNode(_)
                | ApmError::Untraceable { .. }
        )
    }

    /// Fetch failure from the adapter
    pub fn is_upstream(&self) -> bool {
        matches!(self, ApmError::TraceNotFound(_) | ApmError::Upstream(_))
    }

    /// Wrap an adapter-side error
    pub fn upstream(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ApmError::Upstream(Box::new(err))
    }
}

/// Result type for trace analysis
pub type ApmResult<T> = Result<T, ApmError>;
