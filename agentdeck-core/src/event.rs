//! Run events and the bounded per-run event buffer.
//!
//! Sequence numbers start at 0 and increase by one per emitted event. The
//! buffer drops its oldest events in bulk once it exceeds its cap, so the
//! retained range is always a contiguous suffix `[first_seq, next_seq)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One structured unit of run progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub run_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Source/kind discriminator plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventKind {
    /// A stdout line that parsed as JSON, stored verbatim
    Stdout { payload: serde_json::Value },
    /// A stderr line
    Stderr {
        #[serde(flatten)]
        text: ClippedText,
    },
    /// A stdout line that did not parse as JSON
    Raw {
        #[serde(flatten)]
        text: ClippedText,
        error: String,
    },
    /// Engine-level status transition
    Status {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Warning { message: String },
    Error { message: String },
    /// Marks events `[from, to)` of a run that were trimmed before persisting
    Gap { from: u64, to: u64 },
}

/// Text payload clipped to a per-event byte limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClippedText {
    pub text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_length: Option<usize>,
}

impl ClippedText {
    /// Keep at most `limit` bytes of `text`, cutting on a char boundary.
    pub fn new(text: &str, limit: usize) -> Self {
        if text.len() <= limit {
            return Self {
                text: text.to_string(),
                truncated: false,
                original_length: None,
            };
        }
        let mut end = limit;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            text: text[..end].to_string(),
            truncated: true,
            original_length: Some(text.len()),
        }
    }
}

impl EventKind {
    pub fn status(status: impl Into<String>, error: Option<String>) -> Self {
        EventKind::Status {
            status: status.into(),
            error,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, EventKind::Gap { .. })
    }
}

/// Bounded, ordered event buffer for a single run.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: VecDeque<RunEvent>,
    next_seq: u64,
    dropped: u64,
    cap: usize,
}

impl EventBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_seq: 0,
            dropped: 0,
            cap: cap.max(1),
        }
    }

    /// Rebuild from persisted events.
    ///
    /// `next_seq` is the persisted emission frontier; anything below the
    /// first restored event counts as dropped.
    pub fn restore(cap: usize, mut events: Vec<RunEvent>, next_seq: u64) -> Self {
        events.retain(|e| !e.kind.is_gap());
        events.sort_by_key(|e| e.seq);
        events.dedup_by_key(|e| e.seq);
        let next_seq = events
            .last()
            .map(|e| e.seq + 1)
            .unwrap_or(0)
            .max(next_seq);
        let first = events.first().map(|e| e.seq).unwrap_or(next_seq);
        let mut buffer = Self {
            events: events.into(),
            next_seq,
            dropped: first,
            cap: cap.max(1),
        };
        buffer.trim();
        buffer
    }

    /// Append an event, assigning the next sequence number.
    pub fn push(&mut self, run_id: &str, kind: EventKind) -> RunEvent {
        let event = RunEvent {
            seq: self.next_seq,
            ts: Utc::now(),
            run_id: run_id.to_string(),
            kind,
        };
        self.next_seq += 1;
        self.events.push_back(event.clone());
        self.trim();
        event
    }

    /// Drop to 80% of the cap in one step once the cap is exceeded.
    fn trim(&mut self) {
        if self.events.len() <= self.cap {
            return;
        }
        let target = (self.cap - self.cap / 5).max(1);
        let excess = self.events.len() - target;
        self.events.drain(..excess);
        self.dropped += excess as u64;
    }

    /// Sequence number the next event will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Earliest retained sequence number (equals `next_seq` when empty).
    pub fn first_seq(&self) -> u64 {
        self.events.front().map(|e| e.seq).unwrap_or(self.next_seq)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunEvent> {
        self.events.iter()
    }

    /// Events with `seq >= cursor`, in order.
    pub fn since(&self, cursor: u64) -> Vec<RunEvent> {
        let first = self.first_seq();
        let skip = cursor.saturating_sub(first) as usize;
        self.events.iter().skip(skip).cloned().collect()
    }

    /// The last `n` events.
    pub fn tail(&self, n: usize) -> impl Iterator<Item = &RunEvent> {
        self.events.iter().skip(self.events.len().saturating_sub(n))
    }
}
