//! Service node - the spans of one logical hop

use crate::span::Span;

/// Index of a service node inside its trace arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One logical hop of a trace, possibly observed through several entry spans
#[derive(Debug, Clone, Default)]
pub struct ServiceNode {
    /// Start time (ns) after clock-skew correction, `None` until fixed
    pub start_time: Option<u64>,

    pub service_name: String,

    /// Never empty: the first entry is the span that started the node
    pub entry_spans: Vec<Span>,

    pub exit_spans: Vec<Span>,

    /// Erroring non-entry spans beneath the node (error nodes only)
    pub error_spans: Vec<Span>,

    pub children: Vec<NodeId>,

    pub parent: Option<NodeId>,

    /// No entry span is a direct callee of the assigned parent
    pub virtual_node: bool,

    /// Span id of the correlated sampled record, empty until resolved
    pub span_id: String,

    /// Vendor-native id of the resolved entry span
    pub original_span_id: String,

    pub is_root: bool,

    pub is_error: bool,

    pub has_exception: bool,

    /// Opaque attribute blob copied from the sampled record
    pub attributes: String,
}

impl ServiceNode {
    pub fn new(span: Span) -> Self {
        Self {
            service_name: span.service_name.clone(),
            is_root: span.is_root(),
            is_error: span.is_error(),
            entry_spans: vec![span],
            ..Default::default()
        }
    }

    /// Add an entry span unless one with the same id is already present
    pub fn add_entry_span(&mut self, span: Span) {
        if self.matches_entry(&span.span_id) {
            return;
        }
        if span.is_root() {
            self.is_root = true;
        }
        if span.is_error() {
            self.is_error = true;
        }
        self.entry_spans.push(span);
    }

    pub fn add_exit_span(&mut self, span: Span) {
        self.exit_spans.push(span);
    }

    pub fn add_error_span(&mut self, span: Span) {
        self.error_spans.push(span);
    }

    /// The entry span that started the node
    pub fn first_entry(&self) -> &Span {
        &self.entry_spans[0]
    }

    /// Authoritative entry span: the one with the largest duration
    pub fn entry_span(&self) -> &Span {
        let mut best = self.first_entry();
        for span in &self.entry_spans[1..] {
            if span.duration > best.duration {
                best = span;
            }
        }
        best
    }

    pub fn matches_entry(&self, span_id: &str) -> bool {
        self.entry_spans.iter().any(|s| s.span_id == span_id)
    }

    /// Whether any entry span reports itself as a trace root
    pub fn is_top_node(&self) -> bool {
        self.entry_spans.iter().any(Span::is_root)
    }

    /// Mark the node virtual when none of its entries was called by `parent_span_id`
    pub fn check_virtual(&mut self, parent_span_id: &str) {
        if !self
            .entry_spans
            .iter()
            .any(|s| s.parent_span_id == parent_span_id)
        {
            self.virtual_node = true;
        }
    }

    /// Record the resolved span id and pick up the matching entry's original id
    pub fn set_span_id(&mut self, span_id: &str) {
        self.span_id = span_id.to_string();
        if let Some(entry) = self.entry_spans.iter().find(|s| s.span_id == span_id) {
            self.original_span_id = entry.original_span_id().to_string();
        }
    }

    /// Start time after correction, else the first entry's own start
    pub fn effective_start_time(&self) -> u64 {
        self.start_time.unwrap_or(self.first_entry().start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{SpanKind, SpanStatus};

    fn server(id: &str, parent: &str, duration: u64) -> Span {
        Span::new("svc", "GET /", id, parent, SpanKind::Server).with_timing(0, duration)
    }

    #[test]
    fn test_entry_dedup_and_flags() {
        let mut node = ServiceNode::new(server("a", "p", 10));
        assert!(!node.is_root);

        node.add_entry_span(server("a", "", 99));
        assert_eq!(node.entry_spans.len(), 1);
        assert!(!node.is_root);

        node.add_entry_span(server("b", "", 20).with_status(SpanStatus::Error));
        assert_eq!(node.entry_spans.len(), 2);
        assert!(node.is_root);
        assert!(node.is_error);
        assert!(node.is_top_node());
    }

    #[test]
    fn test_entry_span_prefers_longest() {
        let mut node = ServiceNode::new(server("a", "p", 10));
        node.add_entry_span(server("b", "p", 30));
        node.add_entry_span(server("c", "p", 30));
        assert_eq!(node.entry_span().span_id, "b");
        assert_eq!(node.first_entry().span_id, "a");
    }

    #[test]
    fn test_check_virtual() {
        let mut node = ServiceNode::new(server("a", "p", 10));
        node.check_virtual("p");
        assert!(!node.virtual_node);
        node.check_virtual("other");
        assert!(node.virtual_node);
    }

    #[test]
    fn test_set_span_id_picks_original() {
        let mut span = server("a", "p", 10);
        span.set_original_span_id("skywalking", "seg.0");
        let mut node = ServiceNode::new(span);

        node.set_span_id("a");
        assert_eq!(node.span_id, "a");
        assert_eq!(node.original_span_id, "seg.0");
    }
}
