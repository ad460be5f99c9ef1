pub mod api;
pub mod screen;

pub use api::{ApiCredentials, ApiInbox, ApiSource};
pub use screen::{CapturedText, CommandCapture, ScreenSource, TextCapture};

use serde::Serialize;
use std::time::Duration;

use crate::config::SourceConfig;
use crate::error::Result;
use crate::message::{Message, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Screen,
    Api,
}

/// Static identity of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub name: String,
    pub platform: Platform,
    pub kind: SourceKind,
}

/// The fixed set of capture adapters the monitor can drive.
pub enum Source {
    Screen(ScreenSource),
    Api(ApiSource),
}

impl Source {
    /// Builds the adapter described by a `[[sources]]` entry. Screen sources
    /// run their capture command with `poll_timeout` as the hard limit.
    pub fn from_config(config: &SourceConfig, poll_timeout: Duration) -> Result<Self> {
        match config {
            SourceConfig::Screen(c) => {
                let capture = CommandCapture::new(&c.command, poll_timeout)?;
                let window_title = if c.window_title.trim().is_empty() {
                    c.name.as_str()
                } else {
                    c.window_title.as_str()
                };
                let source = ScreenSource::new(
                    &c.name,
                    Platform::parse(&c.platform),
                    window_title,
                    Box::new(capture),
                )
                .with_min_line_chars(c.min_line_chars);
                Ok(Source::Screen(source))
            }
            SourceConfig::Api(c) => {
                let credentials = ApiCredentials {
                    app_id: c.app_id.clone(),
                    app_secret: c.app_secret.clone(),
                };
                let source = ApiSource::new(
                    &c.name,
                    Platform::parse(&c.platform),
                    credentials,
                    ApiInbox::new(),
                )
                .with_enabled(c.enabled);
                Ok(Source::Api(source))
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Source::Screen(s) => s.name(),
            Source::Api(s) => s.name(),
        }
    }

    pub fn describe(&self) -> SourceInfo {
        match self {
            Source::Screen(s) => SourceInfo {
                name: s.name().to_string(),
                platform: s.platform(),
                kind: SourceKind::Screen,
            },
            Source::Api(s) => SourceInfo {
                name: s.name().to_string(),
                platform: s.platform(),
                kind: SourceKind::Api,
            },
        }
    }

    /// Cheap readiness check; does not touch the capture surface.
    pub fn is_available(&self) -> bool {
        match self {
            Source::Screen(_) => true,
            Source::Api(s) => s.is_available(),
        }
    }

    /// One bounded capture cycle. An empty result is not an error.
    pub async fn poll(&mut self) -> Result<Vec<Message>> {
        match self {
            Source::Screen(s) => s.poll().await,
            Source::Api(s) => s.poll().await,
        }
    }

    /// Intake queue for push-based sources.
    pub fn api_inbox(&self) -> Option<ApiInbox> {
        match self {
            Source::Api(s) => Some(s.inbox()),
            Source::Screen(_) => None,
        }
    }
}
