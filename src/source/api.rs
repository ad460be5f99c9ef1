use chrono::{DateTime, TimeZone, Utc};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{MonitorError, Result};
use crate::message::{Message, Platform, RawMessage};

const SEEN_IDS_LIMIT: usize = 10_000;
const SEEN_IDS_KEEP: usize = 8_000;
pub const INBOX_CAPACITY: usize = 1_000;

/// Queue between the webhook receiver and the polling loop. Holds at most
/// `INBOX_CAPACITY` payloads; the oldest is dropped when full.
#[derive(Debug, Clone)]
pub struct ApiInbox {
    queue: Arc<Mutex<VecDeque<Value>>>,
    accepting: Arc<AtomicBool>,
}

impl Default for ApiInbox {
    fn default() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl ApiInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the owning source cannot consume payloads.
    pub fn push(&self, payload: Value) -> bool {
        if !self.is_accepting() {
            return false;
        }
        let mut queue = self.lock();
        if queue.len() >= INBOX_CAPACITY {
            queue.pop_front();
            warn!("Push inbox full ({} payloads), dropping the oldest", INBOX_CAPACITY);
        }
        queue.push_back(payload);
        true
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
        if !accepting {
            self.lock().clear();
        }
    }

    pub fn drain(&self) -> Vec<Value> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Value>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiCredentials {
    pub app_id: String,
    pub app_secret: String,
}

// Customer-service push payload; field names follow the upstream platform.
#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "MsgType", default)]
    msg_type: String,
    #[serde(rename = "MsgId", default)]
    msg_id: Option<Value>,
    #[serde(rename = "FromUserName", default)]
    from_user: String,
    #[serde(rename = "Content", default)]
    content: String,
    #[serde(rename = "CreateTime", default)]
    create_time: Option<i64>,
}

pub struct ApiSource {
    name: String,
    platform: Platform,
    credentials: ApiCredentials,
    inbox: ApiInbox,
    enabled: bool,
    seen_ids: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl ApiSource {
    pub fn new(name: &str, platform: Platform, credentials: ApiCredentials, inbox: ApiInbox) -> Self {
        info!(
            "API source '{}' initialised (app id {}...)",
            name,
            credentials.app_id.chars().take(8).collect::<String>()
        );
        let source = Self {
            name: name.to_string(),
            platform,
            credentials,
            inbox,
            enabled: true,
            seen_ids: HashSet::new(),
            seen_order: VecDeque::new(),
        };
        source.inbox.set_accepting(source.is_available());
        source
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self.inbox.set_accepting(self.is_available());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn inbox(&self) -> ApiInbox {
        self.inbox.clone()
    }

    pub fn is_available(&self) -> bool {
        self.enabled
            && !self.credentials.app_id.is_empty()
            && !self.credentials.app_secret.is_empty()
    }

    pub async fn poll(&mut self) -> Result<Vec<Message>> {
        if !self.is_available() {
            return Err(MonitorError::unavailable(
                &self.name,
                "disabled or missing app_id/app_secret",
            ));
        }

        let mut messages = Vec::new();
        for payload in self.inbox.drain() {
            let raw = match parse_payload(payload) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    error!("Source '{}': unparseable push payload: {}", self.name, e);
                    continue;
                }
            };

            let id = raw.id.clone().unwrap_or_default();
            if !self.remember(id) {
                debug!("Source '{}': message already seen, skipping", self.name);
                continue;
            }
            if let Some(message) = Message::from_raw(raw, self.platform, &self.name) {
                messages.push(message);
            }
        }

        if !messages.is_empty() {
            info!("Source '{}' received {} new messages", self.name, messages.len());
        }
        Ok(messages)
    }

    fn remember(&mut self, id: String) -> bool {
        if !self.seen_ids.insert(id.clone()) {
            return false;
        }
        self.seen_order.push_back(id);
        if self.seen_order.len() > SEEN_IDS_LIMIT {
            while self.seen_order.len() > SEEN_IDS_KEEP {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen_ids.remove(&old);
                }
            }
        }
        true
    }
}

/// Converts one push payload into an adapter record. Non-text messages
/// yield `Ok(None)`.
fn parse_payload(payload: Value) -> std::result::Result<Option<RawMessage>, serde_json::Error> {
    let push: PushPayload = serde_json::from_value(payload)?;
    if push.msg_type != "text" {
        debug!("Skipping non-text push message: {}", push.msg_type);
        return Ok(None);
    }

    let create_time = push.create_time.unwrap_or_else(|| Utc::now().timestamp());
    let msg_id = match push.msg_id {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => format!("{}_{}", push.from_user, create_time),
    };
    let observed_at: DateTime<Utc> = Utc
        .timestamp_opt(create_time, 0)
        .single()
        .unwrap_or_else(Utc::now);

    let channel = if push.from_user.chars().count() > 16 {
        format!("{}...", push.from_user.chars().take(16).collect::<String>())
    } else {
        push.from_user.clone()
    };

    Ok(Some(RawMessage {
        id: Some(msg_id),
        channel,
        sender: Some(push.from_user.clone()),
        sender_id: Some(push.from_user),
        content: push.content,
        observed_at,
    }))
}
