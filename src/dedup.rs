use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::debug;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::message::Message;

/// Content key for a logical message: same platform, same conversation,
/// same normalized text. Capture time is not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(message: &Message) -> Self {
        Self::from_parts(message.source_platform.as_str(), &message.channel, &message.content)
    }

    pub fn from_parts(platform: &str, channel: &str, content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(platform.as_bytes());
        hasher.update([0x1f]);
        hasher.update(channel.as_bytes());
        hasher.update([0x1f]);
        hasher.update(content.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct RecencyWindow {
    window: ChronoDuration,
    seen: HashMap<Fingerprint, DateTime<Utc>>,
    last_sweep: DateTime<Utc>,
}

impl RecencyWindow {
    fn sweep(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        let before = self.seen.len();
        self.seen.retain(|_, last_seen| now - *last_seen < window);
        self.last_sweep = now;
        let purged = before - self.seen.len();
        if purged > 0 {
            debug!("Dedup sweep purged {} fingerprints, {} remain", purged, self.seen.len());
        }
    }
}

pub struct Deduplicator {
    inner: Mutex<RecencyWindow>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(RecencyWindow {
                window: to_chrono(window),
                seen: HashMap::new(),
                last_sweep: Utc::now(),
            }),
        }
    }

    pub fn should_emit(&self, message: &Message) -> bool {
        self.should_emit_at(message, Utc::now())
    }

    /// Returns true the first time a fingerprint shows up within the window.
    /// A suppressed sighting refreshes the timestamp, so text that stays on
    /// screen stays suppressed until it has been gone for a full window.
    pub fn should_emit_at(&self, message: &Message, now: DateTime<Utc>) -> bool {
        let fingerprint = Fingerprint::of(message);
        let mut guard = self.lock();
        let state = &mut *guard;

        if now - state.last_sweep >= state.window {
            state.sweep(now);
        }

        let window = state.window;
        match state.seen.get_mut(&fingerprint) {
            Some(last_seen) if now - *last_seen < window => {
                *last_seen = now;
                false
            }
            Some(last_seen) => {
                *last_seen = now;
                true
            }
            None => {
                state.seen.insert(fingerprint, now);
                true
            }
        }
    }

    pub fn set_window(&self, window: Duration) {
        self.lock().window = to_chrono(window);
    }

    pub fn window(&self) -> Duration {
        self.lock().window.to_std().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecencyWindow> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn to_chrono(window: Duration) -> ChronoDuration {
    ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX)
}
