//! APM vendor identity and per-vendor policies

use crate::error::ApmError;
use crate::transform;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How sampled records are joined onto service nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStrategy {
    /// Record span id equals a node entry span id
    ExactId,
    /// Ids are unreliable, match by service name and interval overlap
    TimeOverlap,
}

/// What to do when the built trace has no root node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootFallback {
    Fail,
    /// Build a root from the entry sampled record
    SynthesizeFromRecord,
}

/// Supported APM backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ApmType {
    Otel,
    Skywalking,
    Pinpoint,
    Arms,
    Tingyun,
    /// Any other adapter-backed vendor, handled with the default policies
    Other,
}

impl ApmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApmType::Otel => "otel",
            ApmType::Skywalking => "skywalking",
            ApmType::Pinpoint => "pinpoint",
            ApmType::Arms => "arms",
            ApmType::Tingyun => "tingyun3",
            ApmType::Other => "other",
        }
    }

    pub fn join(&self) -> JoinStrategy {
        match self {
            ApmType::Pinpoint => JoinStrategy::TimeOverlap,
            _ => JoinStrategy::ExactId,
        }
    }

    pub fn root_fallback(&self) -> RootFallback {
        match self {
            ApmType::Arms => RootFallback::SynthesizeFromRecord,
            _ => RootFallback::Fail,
        }
    }

    /// Normalize a vendor-native span identifier
    pub fn derive_span_id(&self, raw: &str, seq: u32) -> String {
        match self {
            ApmType::Skywalking => transform::segment_id_to_span_id(raw, seq),
            ApmType::Tingyun => transform::guid_to_span_id(raw, seq),
            _ => raw.to_string(),
        }
    }
}

impl fmt::Display for ApmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApmType {
    type Err = ApmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "otel" | "opentelemetry" => Ok(ApmType::Otel),
            "skywalking" => Ok(ApmType::Skywalking),
            "pinpoint" => Ok(ApmType::Pinpoint),
            "arms" => Ok(ApmType::Arms),
            "tingyun" | "tingyun3" => Ok(ApmType::Tingyun),
            _ => Err(ApmError::UnknownApmType(s.to_string())),
        }
    }
}

impl ApmType {
    /// Lenient lookup: names without a dedicated policy map to [`ApmType::Other`]
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or(ApmType::Other)
    }
}

impl From<String> for ApmType {
    fn from(value: String) -> Self {
        ApmType::from_name(&value)
    }
}

impl From<ApmType> for String {
    fn from(apm_type: ApmType) -> Self {
        apm_type.as_str().to_string()
    }
}
