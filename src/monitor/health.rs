use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::message::Platform;
use crate::source::{SourceInfo, SourceKind};

/// Per-source scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Polling,
    Processing,
    Backoff,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub name: String,
    pub platform: Platform,
    pub kind: SourceKind,
    pub enabled: bool,
    pub available: bool,
    pub state: SourceState,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub message_count: u64,
}

impl SourceHealth {
    pub fn new(info: &SourceInfo) -> Self {
        Self {
            name: info.name.clone(),
            platform: info.platform,
            kind: info.kind,
            enabled: true,
            available: true,
            state: SourceState::Idle,
            last_poll_at: None,
            last_success_at: None,
            last_error: None,
            consecutive_failures: 0,
            total_failures: 0,
            message_count: 0,
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>, messages: usize) {
        if !self.available {
            info!(
                "Source '{}' recovered after {} consecutive failures",
                self.name, self.consecutive_failures
            );
        }
        self.available = true;
        self.last_poll_at = Some(now);
        self.last_success_at = Some(now);
        self.last_error = None;
        self.consecutive_failures = 0;
        self.message_count += messages as u64;
        self.state = if messages > 0 {
            SourceState::Processing
        } else {
            SourceState::Idle
        };
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>, reason: impl Into<String>) {
        let reason = reason.into();
        self.available = false;
        self.last_poll_at = Some(now);
        self.consecutive_failures += 1;
        self.total_failures += 1;
        self.state = SourceState::Backoff;
        warn!(
            "Source '{}' unavailable ({} consecutive): {}",
            self.name, self.consecutive_failures, reason
        );
        self.last_error = Some(reason);
    }
}
