// SPDX-License-Identifier: Apache-2.0

//! The canonical log envelope passed between input and output adapters.
//!
//! Reserved keys use the `@` prefix on the wire: `@timestamp`, `@message`,
//! `@source`, `@source_host`, `@type`, `@fields`. Any other keys present in
//! a decoded event are carried through untouched.

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(rename = "@message")]
    pub message: String,

    #[serde(rename = "@timestamp", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(rename = "@source", skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(rename = "@source_host", skip_serializing_if = "Option::is_none")]
    pub source_host: Option<String>,

    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(rename = "@fields", default)]
    pub fields: Map<String, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogEvent {
    /// Fallback envelope for a raw line that could not be decoded: the line
    /// becomes `@message`, tagged with the configured source and type.
    pub fn from_line(line: impl Into<String>, source: &str, kind: Option<&str>) -> Self {
        LogEvent {
            message: line.into(),
            timestamp: Some(now_timestamp()),
            source: Some(source.to_string()),
            source_host: Some(local_hostname()),
            kind: kind.map(|k| k.to_string()),
            fields: Map::new(),
            extra: Map::new(),
        }
    }

    /// Decode a line as a full envelope. Fails when the payload is not JSON
    /// or carries no `@message`; callers fall back to [`LogEvent::from_line`].
    pub fn decode(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Look up a field by envelope name. Reserved `@` names resolve to the
    /// typed fields; anything else is searched in `@fields`, then in the
    /// passthrough keys.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "@message" => Some(self.message.clone()),
            "@timestamp" => self.timestamp.clone(),
            "@source" => self.source.clone(),
            "@source_host" => self.source_host.clone(),
            "@type" => self.kind.clone(),
            other => self
                .fields
                .get(other)
                .or_else(|| self.extra.get(other))
                .map(value_to_string),
        }
    }

    /// Expand `#{name}` references in a pattern against this event, e.g.
    /// `logs:#{@type}`. Unresolvable references expand to the empty string.
    pub fn interpolate(&self, pattern: &str) -> String {
        static REFERENCE: OnceLock<Regex> = OnceLock::new();
        let re = REFERENCE.get_or_init(|| Regex::new(r"#\{([^}]+)\}").unwrap());

        re.replace_all(pattern, |caps: &regex::Captures<'_>| {
            self.field(&caps[1]).unwrap_or_default()
        })
        .into_owned()
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Current time in the envelope's wire format (ISO-8601, millisecond
/// precision, UTC).
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}
