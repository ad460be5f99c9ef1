use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use super::Priority;
use super::webhook::WebhookChannel;
use crate::config::ChannelsConfig;
use crate::error::{MonitorError, Result};
use crate::message::truncate_chars;

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConsoleChannel;

impl ConsoleChannel {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let rule = "=".repeat(60);
        println!("\n{}", rule);
        println!("【{}】{}", notification.priority, notification.title);
        println!("{}", "-".repeat(60));
        println!("{}", notification.body);
        println!("{}", rule);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FileChannel {
    path: PathBuf,
}

impl FileChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let line = format!(
            "{} - [{}] {}: {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            notification.priority,
            notification.title,
            truncate_chars(&notification.body.replace('\n', " "), 200)
        );

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| MonitorError::delivery("file", format!("{}: {}", self.path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| MonitorError::delivery("file", e))?;
        file.flush().await.map_err(|e| MonitorError::delivery("file", e))?;
        Ok(())
    }
}

/// The fixed set of delivery mechanisms. New transports are new variants.
#[derive(Debug, Clone)]
pub enum Channel {
    Console(ConsoleChannel),
    File(FileChannel),
    Webhook(WebhookChannel),
}

impl Channel {
    pub fn name(&self) -> String {
        match self {
            Channel::Console(_) => "console".to_string(),
            Channel::File(_) => "file".to_string(),
            Channel::Webhook(hook) => format!("webhook:{}", hook.name()),
        }
    }

    pub async fn send(&self, notification: &Notification) -> Result<()> {
        match self {
            Channel::Console(console) => console.send(notification).await,
            Channel::File(file) => file.send(notification).await,
            Channel::Webhook(hook) => hook.send(notification).await,
        }
    }
}

/// Name-to-transport lookup used by the rule engine.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ChannelsConfig) -> Self {
        let mut registry = Self::new();
        if config.console {
            registry.register(Channel::Console(ConsoleChannel));
        }
        if let Some(file) = &config.file {
            registry.register(Channel::File(FileChannel::new(&file.path)));
        }
        for hook in &config.webhooks {
            if hook.url.trim().is_empty() {
                warn!("Webhook '{}' has no URL configured, skipping", hook.name);
                continue;
            }
            registry.register(Channel::Webhook(WebhookChannel::new(
                &hook.name,
                &hook.url,
                hook.flavor,
            )));
        }
        info!("Channel registry ready: {:?}", registry.names());
        registry
    }

    pub fn register(&mut self, channel: Channel) {
        self.channels.insert(channel.name(), channel);
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
