// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The queued unit: one structured error/log record.
//!
//! Entries serialize with camelCase field names, which is both the persisted layout
//! and the collector's wire format:
//!
//! ```json
//! {
//!   "level": "Error",
//!   "message": "Failed to load dashboard",
//!   "exceptionMessage": "connection reset",
//!   "stackTracePrefix": "at fetch (client.js:10)",
//!   "requestUrl": "https://api.example.com/widgets",
//!   "statusCode": 503,
//!   "userAgent": "telemetry-queue/0.1.0",
//!   "clientTimestamp": "2024-05-01T12:00:00Z"
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::constants::STACK_TRACE_PREFIX_CHARS;

/// User agent stamped on entries captured without an explicit one.
pub const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Severity of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Level::Debug => "Debug",
            Level::Info => "Info",
            Level::Warning => "Warning",
            Level::Error => "Error",
            Level::Critical => "Critical",
        };
        f.write_str(name)
    }
}

/// A structured error/log record.
///
/// Once handed to [`crate::ReliabilityQueue::enqueue`] an entry is never mutated; the
/// queue only changes whether it is pending or gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub level: Level,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
    /// First [`STACK_TRACE_PREFIX_CHARS`] characters of the stack trace. Part of the
    /// deduplication signature, unlike `stack_trace`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Capture time; records arriving without one are stamped when deserialized.
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub client_timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_context: BTreeMap<String, Value>,
}

impl Entry {
    /// Captures a new entry stamped with the current time and the default user agent.
    #[must_use]
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            exception_message: None,
            stack_trace_prefix: None,
            stack_trace: None,
            source_context: None,
            request_url: None,
            status_code: None,
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            client_timestamp: OffsetDateTime::now_utc(),
            additional_context: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Level::Error, message)
    }

    #[must_use]
    pub fn with_exception(mut self, exception_message: impl Into<String>) -> Self {
        self.exception_message = Some(exception_message.into());
        self
    }

    /// Stores the full trace and derives `stack_trace_prefix` from it.
    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        let stack_trace = stack_trace.into();
        self.stack_trace_prefix = Some(stack_trace_prefix(&stack_trace));
        self.stack_trace = Some(stack_trace);
        self
    }

    #[must_use]
    pub fn with_source_context(mut self, source_context: impl Into<String>) -> Self {
        self.source_context = Some(source_context.into());
        self
    }

    /// Attaches the HTTP context of a failed network call.
    #[must_use]
    pub fn with_request(mut self, request_url: impl Into<String>, status_code: Option<u16>) -> Self {
        self.request_url = Some(request_url.into());
        self.status_code = status_code;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, client_timestamp: OffsetDateTime) -> Self {
        self.client_timestamp = client_timestamp;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.additional_context.insert(key.into(), value.into());
        self
    }
}

/// Truncates a stack trace to its first [`STACK_TRACE_PREFIX_CHARS`] characters.
#[must_use]
pub fn stack_trace_prefix(stack_trace: &str) -> String {
    stack_trace.chars().take(STACK_TRACE_PREFIX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn serializes_with_camel_case_names() {
        let entry = Entry::error("Failed to load widgets")
            .with_exception("connection reset")
            .with_request("https://api.example.com/widgets", Some(503))
            .with_source_context("WidgetGrid")
            .with_timestamp(datetime!(2024-05-01 12:00:00 UTC));

        let json = serde_json::to_value(&entry).expect("serialize");

        assert_eq!(json["level"], "Error");
        assert_eq!(json["message"], "Failed to load widgets");
        assert_eq!(json["exceptionMessage"], "connection reset");
        assert_eq!(json["requestUrl"], "https://api.example.com/widgets");
        assert_eq!(json["statusCode"], 503);
        assert_eq!(json["sourceContext"], "WidgetGrid");
        assert_eq!(json["clientTimestamp"], "2024-05-01T12:00:00Z");
        assert!(json.get("stackTracePrefix").is_none());
        assert!(json.get("additionalContext").is_none());
    }

    #[test]
    fn deserializes_minimal_record() {
        let entry: Entry = serde_json::from_str(
            r#"{"level":"Warning","message":"slow render","clientTimestamp":"2024-05-01T12:00:00Z"}"#,
        )
        .expect("deserialize");

        assert_eq!(entry.level, Level::Warning);
        assert_eq!(entry.message, "slow render");
        assert!(entry.user_agent.is_none());
        assert!(entry.additional_context.is_empty());
    }

    #[test]
    fn missing_timestamp_is_stamped_at_capture() {
        let before = OffsetDateTime::now_utc();
        let entry: Entry = serde_json::from_str(
            r#"{"level":"Critical","message":"checkout failed","requestUrl":"https://shop.example.com/pay","statusCode":502}"#,
        )
        .unwrap();

        assert_eq!(entry.level, Level::Critical);
        assert_eq!(entry.request_url.as_deref(), Some("https://shop.example.com/pay"));
        assert_eq!(entry.status_code, Some(502));
        assert!(entry.client_timestamp >= before);
    }

    #[test]
    fn stack_trace_prefix_is_truncated_on_char_boundary() {
        let trace = "é".repeat(150);
        let entry = Entry::error("boom").with_stack_trace(trace.clone());

        let prefix = entry.stack_trace_prefix.expect("prefix");
        assert_eq!(prefix.chars().count(), STACK_TRACE_PREFIX_CHARS);
        assert_eq!(entry.stack_trace, Some(trace));
    }

    #[test]
    fn short_stack_trace_is_kept_whole() {
        let entry = Entry::error("boom").with_stack_trace("at main (app.js:1)");
        assert_eq!(entry.stack_trace_prefix.as_deref(), Some("at main (app.js:1)"));
    }

    #[test]
    fn new_entries_carry_default_user_agent() {
        let entry = Entry::new(Level::Info, "hello");
        assert_eq!(entry.user_agent.as_deref(), Some(DEFAULT_USER_AGENT));
    }

    #[test]
    fn additional_context_round_trips() {
        let entry = Entry::error("boom")
            .with_context("widget", "weather")
            .with_context("attempt", 3);

        let json = serde_json::to_string(&entry).expect("serialize");
        let decoded: Entry = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(decoded, entry);
        assert_eq!(decoded.additional_context["attempt"], 3);
    }
}
