//! Wire types of the Relay REST API

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Default number of history entries requested
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;

/// Server-side state of a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u64,
    pub consumer_count: u64,
    pub created_at: DateTime<Utc>,
}

/// A stored message returned by the history endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub subject: String,
    pub data: String,
    pub timestamp: DateTime<Utc>,
    /// Server-assigned per-subject ordering key
    pub sequence: u64,
}

/// Body of `POST /queues`
#[derive(Debug, Serialize)]
pub(crate) struct CreateQueueRequest<'a> {
    pub name: &'a str,
}

/// Parameters of a history lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub subject: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl HistoryQuery {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            start_time: None,
            end_time: None,
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn end_time(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Query string pairs in wire order
    pub(crate) fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(3);
        if let Some(start) = self.start_time {
            pairs.push(("start_time", format_time(start)));
        }
        if let Some(end) = self.end_time {
            pairs.push(("end_time", format_time(end)));
        }
        pairs.push(("limit", self.limit.to_string()));
        pairs
    }
}

/// ISO-8601 UTC, seconds precision, `Z` suffix
fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}
