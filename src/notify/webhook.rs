use log::{debug, error};
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

use super::channel::Notification;
use crate::config::WebhookFlavor;
use crate::error::{MonitorError, Result};

const TITLE_PREFIX: &str = "【chatwatch】";

#[derive(Debug, Clone)]
pub struct WebhookChannel {
    name: String,
    url: String,
    flavor: WebhookFlavor,
    client: Client,
}

impl WebhookChannel {
    pub fn new(name: &str, url: &str, flavor: WebhookFlavor) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to build HTTP client for webhook '{}': {}", name, e);
                Client::new()
            });

        Self {
            name: name.to_string(),
            url: url.to_string(),
            flavor,
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self, notification: &Notification) -> Value {
        match self.flavor {
            WebhookFlavor::Generic => json!({
                "title": notification.title,
                "body": notification.body,
                "priority": notification.priority,
                "metadata": notification.metadata,
            }),
            WebhookFlavor::Dingtalk => json!({
                "msgtype": "text",
                "text": { "content": text_content(notification) },
                "at": { "atMobiles": [], "isAtAll": false },
            }),
            WebhookFlavor::Wecom => json!({
                "msgtype": "text",
                "text": { "content": text_content(notification) },
            }),
        }
    }

    pub async fn send(&self, notification: &Notification) -> Result<()> {
        let channel = format!("webhook:{}", self.name);
        let response = self
            .client
            .post(&self.url)
            .json(&self.payload(notification))
            .send()
            .await
            .map_err(|e| MonitorError::delivery(&channel, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::delivery(&channel, format!("HTTP {}", status)));
        }

        match self.flavor {
            WebhookFlavor::Generic => Ok(()),
            // Robot endpoints answer 200 and report failures in the body.
            WebhookFlavor::Dingtalk | WebhookFlavor::Wecom => {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| MonitorError::delivery(&channel, e))?;
                check_errcode(&body).map_err(|reason| MonitorError::delivery(&channel, reason))?;
                debug!("Webhook '{}' accepted notification", self.name);
                Ok(())
            }
        }
    }
}

fn text_content(notification: &Notification) -> String {
    format!("{}{}\n\n{}", TITLE_PREFIX, notification.title, notification.body)
}

fn check_errcode(body: &Value) -> std::result::Result<(), String> {
    match body.get("errcode").and_then(Value::as_i64) {
        Some(0) => Ok(()),
        Some(code) => Err(format!(
            "errcode {}: {}",
            code,
            body.get("errmsg").and_then(Value::as_str).unwrap_or("unknown error")
        )),
        None => Err("response has no errcode".to_string()),
    }
}
