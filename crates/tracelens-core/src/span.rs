//! Raw distributed-tracing spans as delivered by the APM adapter
//!
//! Timing fields are nanoseconds. Kind and status codes travel as
//! OpenTelemetry integers on the wire.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const ATTR_HTTP_URL: &str = "http.url"; // 1.x
pub const ATTR_URL_FULL: &str = "url.full"; // 2.x
pub const ATTR_HTTP_METHOD: &str = "http.method"; // 1.x
pub const ATTR_HTTP_REQUEST_METHOD: &str = "http.request.method"; // 2.x
pub const ATTR_HTTP_STATUS_CODE: &str = "http.status_code";

pub const ATTR_DB_STATEMENT: &str = "db.statement";
pub const ATTR_DB_SYSTEM: &str = "db.system";

pub const ATTR_RPC_SERVICE: &str = "rpc.service";
pub const ATTR_RPC_METHOD: &str = "rpc.method";

pub const ATTR_NET_PEER_NAME: &str = "net.peer.name"; // 1.x
pub const ATTR_NET_PEER_PORT: &str = "net.peer.port"; // 1.x
pub const ATTR_SERVER_ADDRESS: &str = "server.address"; // 2.x
pub const ATTR_SERVER_PORT: &str = "server.port"; // 2.x
pub const ATTR_NET_SOCK_PEER_ADDR: &str = "net.sock.peer.addr"; // 1.x
pub const ATTR_NET_SOCK_PEER_PORT: &str = "net.sock.peer.port"; // 1.x
pub const ATTR_NETWORK_PEER_ADDRESS: &str = "network.peer.address"; // 2.x
pub const ATTR_NETWORK_PEER_PORT: &str = "network.peer.port"; // 2.x

pub const ATTR_MESSAGING_DESTINATION: &str = "messaging.destination"; // 1.x
pub const ATTR_MESSAGING_DESTINATION_NAME: &str = "messaging.destination.name"; // 2.x
pub const ATTR_MQ_BROKER: &str = "mq.broker";

pub const ATTR_APM_SPAN_TYPE: &str = "apm.span.type";
pub const ATTR_APM_ORIGINAL_SPAN_ID: &str = "apm.original.span.id";

/// Span kind (OpenTelemetry numbering)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum SpanKind {
    #[default]
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    /// Inbound side of a hop
    pub fn is_entry(self) -> bool {
        matches!(self, SpanKind::Server | SpanKind::Consumer)
    }

    /// Outbound side of a hop
    pub fn is_exit(self) -> bool {
        matches!(self, SpanKind::Client | SpanKind::Producer)
    }
}

impl TryFrom<i32> for SpanKind {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SpanKind::Unspecified),
            1 => Ok(SpanKind::Internal),
            2 => Ok(SpanKind::Server),
            3 => Ok(SpanKind::Client),
            4 => Ok(SpanKind::Producer),
            5 => Ok(SpanKind::Consumer),
            other => Err(format!("invalid span kind: {}", other)),
        }
    }
}

impl From<SpanKind> for i32 {
    fn from(kind: SpanKind) -> Self {
        match kind {
            SpanKind::Unspecified => 0,
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
            SpanKind::Client => 3,
            SpanKind::Producer => 4,
            SpanKind::Consumer => 5,
        }
    }
}

/// Span status code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

impl TryFrom<i32> for SpanStatus {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, String> {
        match value {
            0 => Ok(SpanStatus::Unset),
            1 => Ok(SpanStatus::Ok),
            2 => Ok(SpanStatus::Error),
            other => Err(format!("invalid status code: {}", other)),
        }
    }
}

impl From<SpanStatus> for i32 {
    fn from(status: SpanStatus) -> Self {
        match status {
            SpanStatus::Unset => 0,
            SpanStatus::Ok => 1,
            SpanStatus::Error => 2,
        }
    }
}

/// Exception recorded on a span. `timestamp` is in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub stack: String,
}

impl Exception {
    pub fn new(
        timestamp: u64,
        kind: impl Into<String>,
        message: impl Into<String>,
        stack: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            kind: kind.into(),
            message: message.into(),
            stack: stack.into(),
        }
    }
}

/// One observed operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    /// Start time (ns)
    pub start_time: u64,

    /// Duration (ns)
    pub duration: u64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,

    /// Operation name
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub span_id: String,

    /// Parent span id, empty for the trace root
    #[serde(default, rename = "pSpanId", skip_serializing_if = "String::is_empty")]
    pub parent_span_id: String,

    /// Entry span id of the callee, set on exit spans
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub next_span_id: String,

    #[serde(default)]
    pub kind: SpanKind,

    #[serde(default, rename = "code")]
    pub status: SpanStatus,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub not_sampled: bool,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<Exception>,
}

impl Span {
    pub fn new(
        service_name: impl Into<String>,
        name: impl Into<String>,
        span_id: impl Into<String>,
        parent_span_id: impl Into<String>,
        kind: SpanKind,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            name: name.into(),
            span_id: span_id.into(),
            parent_span_id: parent_span_id.into(),
            kind,
            ..Default::default()
        }
    }

    /// Set start time and duration (ns)
    pub fn with_timing(mut self, start_time: u64, duration: u64) -> Self {
        self.start_time = start_time;
        self.duration = duration;
        self
    }

    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == SpanStatus::Error
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_empty()
    }

    pub fn end_time(&self) -> u64 {
        self.start_time + self.duration
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn add_exception(
        &mut self,
        timestamp: u64,
        kind: impl Into<String>,
        message: impl Into<String>,
        stack: impl Into<String>,
    ) {
        self.exceptions
            .push(Exception::new(timestamp, kind, message, stack));
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    fn non_empty_attr(&self, key: &str) -> Option<&str> {
        self.attr(key).filter(|v| !v.is_empty())
    }

    /// Tag the span with the vendor and the id it had before normalization
    pub fn set_original_span_id(&mut self, apm_type: &str, span_id: &str) {
        self.add_attribute(ATTR_APM_SPAN_TYPE, apm_type);
        self.add_attribute(ATTR_APM_ORIGINAL_SPAN_ID, span_id);
    }

    pub fn original_span_id(&self) -> &str {
        self.attr(ATTR_APM_ORIGINAL_SPAN_ID).unwrap_or_default()
    }

    pub fn apm_type(&self) -> &str {
        self.attr(ATTR_APM_SPAN_TYPE).unwrap_or_default()
    }

    pub fn http_method(&self) -> &str {
        self.non_empty_attr(ATTR_HTTP_METHOD)
            .or_else(|| self.attr(ATTR_HTTP_REQUEST_METHOD))
            .unwrap_or_default()
    }

    pub fn http_detail(&self) -> &str {
        self.non_empty_attr(ATTR_HTTP_URL)
            .or_else(|| self.attr(ATTR_URL_FULL))
            .unwrap_or_default()
    }

    pub fn http_status_code(&self) -> Option<&str> {
        self.attr(ATTR_HTTP_STATUS_CODE)
    }

    /// Remote peer, checked in order: socket peer (1.x, 2.x), then logical peer (1.x, 2.x)
    pub fn peer(&self, default: &str) -> String {
        const FAMILIES: [(&str, &str); 4] = [
            (ATTR_NET_SOCK_PEER_ADDR, ATTR_NET_SOCK_PEER_PORT),
            (ATTR_NETWORK_PEER_ADDRESS, ATTR_NETWORK_PEER_PORT),
            (ATTR_NET_PEER_NAME, ATTR_NET_PEER_PORT),
            (ATTR_SERVER_ADDRESS, ATTR_SERVER_PORT),
        ];

        for (addr_key, port_key) in FAMILIES {
            if let Some(addr) = self.attr(addr_key) {
                return match self.attr(port_key) {
                    Some(port) => format!("{}:{}", addr, port),
                    None => addr.to_string(),
                };
            }
        }
        default.to_string()
    }

    pub fn message_destination<'a>(&'a self, default: &'a str) -> &'a str {
        self.attr(ATTR_MESSAGING_DESTINATION)
            .or_else(|| self.attr(ATTR_MESSAGING_DESTINATION_NAME))
            .unwrap_or(default)
    }

    pub fn rpc_detail(&self, default: &str) -> String {
        if let (Some(service), Some(method)) = (
            self.non_empty_attr(ATTR_RPC_SERVICE),
            self.non_empty_attr(ATTR_RPC_METHOD),
        ) {
            return format!("{}/{}", service, method);
        }
        // Skywalking reports the full url instead
        if let Some(url) = self.non_empty_attr(ATTR_URL_FULL) {
            return url.to_string();
        }
        default.to_string()
    }
}
