//! Tracelens Adapter - HTTP access to the APM adapter service
//!
//! Implements [`tracelens_core::TraceAdapter`] over the adapter's
//! `/trace/list` and `/trace/detail` endpoints.

pub mod error;
pub mod http;

pub use error::{AdapterError, AdapterResult};
pub use http::HttpAdapter;
