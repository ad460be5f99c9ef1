use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::process::Command;

use crate::error::{MonitorError, Result};
use crate::message::{Message, Platform, RawMessage};

/// One capture of a chat surface as recognized text.
#[derive(Debug, Clone, Default)]
pub struct CapturedText {
    pub window_title: Option<String>,
    pub text: String,
}

/// Capture/recognition backend. Fails with `SourceUnavailable` when the
/// surface cannot be reached.
#[async_trait]
pub trait TextCapture: Send + Sync {
    async fn capture(&self) -> Result<CapturedText>;

    fn describe(&self) -> String;
}

/// Runs an external screenshot+OCR command and reads the text from stdout.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandCapture {
    pub fn new(command: &[String], timeout: Duration) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| MonitorError::invalid("capture command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

#[async_trait]
impl TextCapture for CommandCapture {
    async fn capture(&self) -> Result<CapturedText> {
        let label = self.describe();
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program).args(&self.args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| MonitorError::unavailable(&label, format!("capture timed out after {:?}", self.timeout)))?
        .map_err(|e| MonitorError::unavailable(&label, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MonitorError::unavailable(
                &label,
                format!("capture exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        Ok(CapturedText {
            window_title: None,
            text: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    fn describe(&self) -> String {
        format!("command `{}`", self.program)
    }
}

pub struct ScreenSource {
    name: String,
    platform: Platform,
    window_title: String,
    min_line_chars: usize,
    capture: Box<dyn TextCapture>,
    last_frame: Option<String>,
}

impl ScreenSource {
    pub fn new(
        name: &str,
        platform: Platform,
        window_title: &str,
        capture: Box<dyn TextCapture>,
    ) -> Self {
        info!("Screen source '{}' using {}", name, capture.describe());
        Self {
            name: name.to_string(),
            platform,
            window_title: window_title.to_string(),
            min_line_chars: 3,
            capture,
            last_frame: None,
        }
    }

    pub fn with_min_line_chars(mut self, min_line_chars: usize) -> Self {
        self.min_line_chars = min_line_chars;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub async fn poll(&mut self) -> Result<Vec<Message>> {
        let captured = self.capture.capture().await.map_err(|e| match e {
            MonitorError::SourceUnavailable { reason, .. } => {
                MonitorError::unavailable(&self.name, reason)
            }
            other => MonitorError::unavailable(&self.name, other),
        })?;

        let frame = frame_hash(&captured.text);
        if self.last_frame.as_deref() == Some(frame.as_str()) {
            debug!("Source '{}': frame unchanged, skipping", self.name);
            return Ok(Vec::new());
        }
        self.last_frame = Some(frame);

        let channel = captured
            .window_title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.window_title.clone());
        let observed_at = Utc::now();

        let messages: Vec<Message> = extract_lines(&captured.text, self.min_line_chars)
            .into_iter()
            .filter_map(|line| {
                let raw = RawMessage {
                    observed_at,
                    ..RawMessage::new(channel.clone(), line)
                };
                Message::from_raw(raw, self.platform, &self.name)
            })
            .collect();

        debug!("Source '{}': {} candidate lines", self.name, messages.len());
        Ok(messages)
    }
}

fn frame_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn is_punctuation_only(line: &str) -> bool {
    line.chars().all(|c| {
        c.is_whitespace()
            || c.is_ascii_punctuation()
            || matches!(c as u32,
                0x2000..=0x206F   // general punctuation
                | 0x3000..=0x303F // CJK symbols and punctuation
                | 0xFF00..=0xFF0F | 0xFF1A..=0xFF20 | 0xFF3B..=0xFF40 | 0xFF5B..=0xFF65)
    })
}

/// Splits recognized text into candidate chat lines, dropping blank lines,
/// single characters and lines made only of punctuation.
pub fn extract_lines(text: &str, min_chars: usize) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.chars().count() >= 2)
        .filter(|line| !is_punctuation_only(line))
        .filter(|line| line.chars().count() >= min_chars)
        .map(str::to_string)
        .collect()
}
