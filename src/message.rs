use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    WechatWin,
    WechatKf,
    WechatWork,
    Qq,
    Dingtalk,
    Feishu,
    Slack,
    Custom,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::WechatWin => "wechat_win",
            Platform::WechatKf => "wechat_kf",
            Platform::WechatWork => "wechat_work",
            Platform::Qq => "qq",
            Platform::Dingtalk => "dingtalk",
            Platform::Feishu => "feishu",
            Platform::Slack => "slack",
            Platform::Custom => "custom",
        }
    }

    /// Unknown tags fall back to `Custom` rather than failing.
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "wechat_win" => Platform::WechatWin,
            "wechat_kf" => Platform::WechatKf,
            "wechat_work" => Platform::WechatWork,
            "qq" => Platform::Qq,
            "dingtalk" => Platform::Dingtalk,
            "feishu" => Platform::Feishu,
            "slack" => Platform::Slack,
            _ => Platform::Custom,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a source adapter hands over before the core assigns identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: Option<String>,
    pub channel: String,
    pub sender: Option<String>,
    pub sender_id: Option<String>,
    pub content: String,
    pub observed_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            channel: channel.into(),
            sender: None,
            sender_id: None,
            content: content.into(),
            observed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub source_platform: Platform,
    pub source_name: String,
    pub channel: String,
    pub sender: Option<String>,
    pub sender_id: Option<String>,
    pub content: String,
    pub message_type: String,
    pub observed_at: DateTime<Utc>,
    pub matched_keywords: Vec<String>,
}

impl Message {
    /// Builds a message from an adapter record. Returns `None` when the
    /// normalized content is empty, so empty captures never reach the filter.
    pub fn from_raw(raw: RawMessage, platform: Platform, source_name: &str) -> Option<Self> {
        let content = normalize_content(&raw.content);
        if content.is_empty() {
            return None;
        }

        Some(Self {
            id: raw.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            source_platform: platform,
            source_name: source_name.to_string(),
            channel: raw.channel.trim().to_string(),
            sender: raw.sender.filter(|s| !s.trim().is_empty()),
            sender_id: raw.sender_id.filter(|s| !s.trim().is_empty()),
            content,
            message_type: "text".to_string(),
            observed_at: raw.observed_at,
            matched_keywords: Vec::new(),
        })
    }

    pub fn is_matched(&self) -> bool {
        !self.matched_keywords.is_empty()
    }

    pub fn preview(&self, max_chars: usize) -> String {
        truncate_chars(&self.content, max_chars)
    }
}

/// Trims the text, collapses runs of whitespace inside each line and drops
/// zero-width characters that OCR and rich-text APIs leave behind.
pub fn normalize_content(text: &str) -> String {
    text.lines()
        .map(|line| {
            line.chars()
                .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}'))
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
