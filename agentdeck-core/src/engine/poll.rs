//! Cursor-based event polling.
//!
//! A consumer holds `cursor`, the sequence number of the next event it has
//! not seen. When trimming has already dropped that event the answer is an
//! explicit gap with no events, and the consumer resumes from `gap.to`.

use super::Orchestrator;
use crate::error::{Error, Result};
use crate::event::RunEvent;
use crate::types::{Run, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run fields included in every poll answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub id: String,
    pub window_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<&Run> for RunInfo {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id.clone(),
            window_id: run.window_id.clone(),
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            error: run.error.clone(),
        }
    }
}

/// Events `[from, to)` are gone for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub run: RunInfo,
    pub events: Vec<RunEvent>,
    pub next_cursor: u64,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap: Option<Gap>,
    pub dropped_events: u64,
}

/// Build a poll answer over a retained range `[first_seq, next_seq)`.
///
/// `since` is only called outside the gap case and must return the retained
/// events with `seq >= cursor` in order.
pub(crate) fn answer<F>(
    run: &Run,
    first_seq: u64,
    next_seq: u64,
    dropped_events: u64,
    cursor: u64,
    since: F,
) -> PollResponse
where
    F: FnOnce() -> Vec<RunEvent>,
{
    let terminal = run.status.is_terminal();

    if cursor < first_seq {
        return PollResponse {
            run: RunInfo::from(run),
            events: vec![],
            next_cursor: first_seq,
            done: terminal && first_seq >= next_seq,
            gap: Some(Gap {
                from: cursor,
                to: first_seq,
            }),
            dropped_events,
        };
    }

    let events = if cursor < next_seq { since() } else { vec![] };
    PollResponse {
        run: RunInfo::from(run),
        events,
        next_cursor: next_seq,
        done: terminal,
        gap: None,
        dropped_events,
    }
}

impl Orchestrator {
    /// Events of `run_id` from `cursor` on. Read-only.
    pub fn poll(&self, run_id: &str, cursor: u64) -> Result<PollResponse> {
        let world = self.inner.world();
        let state = world
            .runs
            .get(run_id)
            .ok_or_else(|| Error::run_not_found(run_id))?;
        let mut run = state.run.clone();
        run.next_seq = state.events.next_seq();
        Ok(answer(
            &run,
            state.events.first_seq(),
            state.events.next_seq(),
            state.events.dropped(),
            cursor,
            || state.events.since(cursor),
        ))
    }
}
