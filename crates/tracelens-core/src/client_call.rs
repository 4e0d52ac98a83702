//! Cross-service calls made by a service node

use crate::span::{Span, ATTR_DB_STATEMENT, ATTR_DB_SYSTEM, ATTR_HTTP_URL, ATTR_MQ_BROKER, ATTR_URL_FULL};
use crate::trace::Trace;
use serde::Serialize;
use std::collections::HashMap;

/// A client span paired with the callee's entry span, when captured
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientCall {
    pub client_start_time: u64,
    pub client_end_time: u64,
    pub client_name: String,
    #[serde(rename = "client_spanid")]
    pub client_span_id: String,
    pub client_attributes: HashMap<String, String>,
    /// Zero when the callee was not captured
    pub server_duration: u64,
    /// Empty when the callee was not captured
    pub server_name: String,
    #[serde(skip)]
    pub client_original_span_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Unknown,
    Http,
    Sql,
    Mq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub kind: RequestKind,
    pub request_type: String,
    pub content: String,
}

impl ClientInfo {
    fn new(kind: RequestKind, request_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind,
            request_type: request_type.into(),
            content: content.into(),
        }
    }
}

impl ClientCall {
    pub fn new(client: &Span, server: Option<&Span>) -> Self {
        let mut call = Self {
            client_start_time: client.start_time,
            client_end_time: client.end_time(),
            client_name: client.name.clone(),
            client_span_id: client.span_id.clone(),
            client_attributes: client.attributes.clone(),
            client_original_span_id: client.original_span_id().to_string(),
            ..Default::default()
        };
        if let Some(server) = server {
            call.server_duration = server.duration;
            call.server_name = server.service_name.clone();
        }
        call
    }

    /// Classify the call as HTTP, SQL or MQ from the client attributes
    pub fn client_info(&self) -> ClientInfo {
        if self.client_name.is_empty() || self.client_attributes.is_empty() {
            return ClientInfo::new(RequestKind::Unknown, "unknown", "unknown");
        }
        let attrs = &self.client_attributes;

        if let Some(url) = attrs.get(ATTR_HTTP_URL).or_else(|| attrs.get(ATTR_URL_FULL)) {
            return ClientInfo::new(RequestKind::Http, "http", url.as_str());
        }
        if let Some(statement) = attrs.get(ATTR_DB_STATEMENT) {
            let db_type = attrs.get(ATTR_DB_SYSTEM).cloned().unwrap_or_default();
            let content = if statement.is_empty() {
                &self.client_name
            } else {
                statement
            };
            return ClientInfo::new(RequestKind::Sql, db_type, content.as_str());
        }
        if let Some(broker) = attrs.get(ATTR_MQ_BROKER) {
            return ClientInfo::new(
                RequestKind::Mq,
                self.client_name.as_str(),
                format!("Broker-{}", broker),
            );
        }
        ClientInfo::new(RequestKind::Unknown, "unknown", self.client_name.as_str())
    }
}

/// Client calls of the node resolved by `span_id`, in exit span order
pub fn client_calls(trace: &Trace, span_id: &str) -> Vec<ClientCall> {
    let Some(id) = trace.node_by_span_id(span_id) else {
        return Vec::new();
    };

    trace
        .node(id)
        .exit_spans
        .iter()
        .map(|exit| {
            let server = trace
                .node_by_span_id(&exit.next_span_id)
                .filter(|_| !exit.next_span_id.is_empty())
                .map(|callee| trace.node(callee).entry_span());
            ClientCall::new(exit, server)
        })
        .collect()
}
