use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{MonitorError, Result};
use crate::filter::MatchMode;
use crate::notify::KeywordRule;
use crate::store::DatabaseConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
    pub dedup_window_secs: u64,
    /// When true, messages without a keyword match are not persisted.
    pub store_only_matches: bool,
    pub keyword_reload_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            poll_timeout_secs: 10,
            dedup_window_secs: 120,
            store_only_matches: false,
            keyword_reload_secs: 60,
            shutdown_grace_secs: 5,
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeywordSettings {
    pub list: Vec<String>,
    pub match_mode: MatchMode,
    pub case_sensitive: bool,
    pub fuzzy_threshold: f64,
}

impl Default for KeywordSettings {
    fn default() -> Self {
        Self {
            list: Vec::new(),
            match_mode: MatchMode::Contain,
            case_sensitive: false,
            fuzzy_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScreenSourceConfig {
    pub name: String,
    #[serde(default = "default_screen_platform")]
    pub platform: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Label used as the message channel, usually the chat window title.
    #[serde(default)]
    pub window_title: String,
    /// External capture/OCR command; its stdout is the captured text.
    pub command: Vec<String>,
    #[serde(default = "default_min_line_chars")]
    pub min_line_chars: usize,
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiSourceConfig {
    pub name: String,
    #[serde(default = "default_api_platform")]
    pub platform: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Screen(ScreenSourceConfig),
    Api(ApiSourceConfig),
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            SourceConfig::Screen(c) => &c.name,
            SourceConfig::Api(c) => &c.name,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            SourceConfig::Screen(c) => c.enabled,
            SourceConfig::Api(c) => c.enabled,
        }
    }

    pub fn poll_interval_secs(&self) -> Option<u64> {
        match self {
            SourceConfig::Screen(c) => c.poll_interval_secs,
            SourceConfig::Api(c) => c.poll_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileChannelConfig {
    #[serde(default = "default_notification_log")]
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookFlavor {
    #[default]
    Generic,
    Dingtalk,
    Wecom,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookChannelConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub flavor: WebhookFlavor,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub console: bool,
    pub file: Option<FileChannelConfig>,
    pub webhooks: Vec<WebhookChannelConfig>,
}

impl ChannelsConfig {
    /// Names rules may refer to, in the form the rule engine looks them up.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.console {
            names.push("console".to_string());
        }
        if self.file.is_some() {
            names.push("file".to_string());
        }
        for hook in &self.webhooks {
            names.push(format!("webhook:{}", hook.name));
        }
        names
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub default_channels: Vec<String>,
    pub send_timeout_secs: u64,
    pub rules: Vec<KeywordRule>,
    pub channels: ChannelsConfig,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            default_channels: Vec::new(),
            send_timeout_secs: 10,
            rules: Vec::new(),
            channels: ChannelsConfig {
                console: true,
                ..ChannelsConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub monitor: MonitorSettings,
    pub keywords: KeywordSettings,
    pub sources: Vec<SourceConfig>,
    pub notification: NotificationSettings,
    pub database: Option<DatabaseConfig>,
    pub server: ServerSettings,
}

impl MonitorConfig {
    /// Reads and validates a TOML file. Any parse or validation problem is
    /// reported as `ConfigurationInvalid`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            MonitorError::invalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: MonitorConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// A missing file is not an error: defaults are used instead. A file that
    /// exists but does not parse or validate still fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                "Config file {} not found. Using default configuration.",
                path.display()
            );
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor.poll_interval_secs == 0 {
            return Err(MonitorError::invalid("monitor.poll_interval_secs must be > 0"));
        }
        if self.monitor.poll_timeout_secs == 0 {
            return Err(MonitorError::invalid("monitor.poll_timeout_secs must be > 0"));
        }
        if self.notification.send_timeout_secs == 0 {
            return Err(MonitorError::invalid("notification.send_timeout_secs must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.keywords.fuzzy_threshold) {
            return Err(MonitorError::invalid(format!(
                "keywords.fuzzy_threshold must be within [0, 1], got {}",
                self.keywords.fuzzy_threshold
            )));
        }

        let mut source_names = HashSet::new();
        for source in &self.sources {
            let name = source.name().trim();
            if name.is_empty() {
                return Err(MonitorError::invalid("source name must not be empty"));
            }
            if !source_names.insert(name.to_string()) {
                return Err(MonitorError::invalid(format!("duplicate source name '{}'", name)));
            }
            if source.poll_interval_secs() == Some(0) {
                return Err(MonitorError::invalid(format!(
                    "source '{}': poll_interval_secs must be > 0",
                    name
                )));
            }
            if let SourceConfig::Screen(screen) = source {
                if screen.command.is_empty() {
                    return Err(MonitorError::invalid(format!(
                        "screen source '{}' needs a capture command",
                        name
                    )));
                }
            }
        }

        let known_channels: HashSet<String> =
            self.notification.channels.channel_names().into_iter().collect();
        let mut rule_names = HashSet::new();
        for rule in &self.notification.rules {
            if rule.name.trim().is_empty() {
                return Err(MonitorError::invalid("notification rule name must not be empty"));
            }
            if !rule_names.insert(rule.name.clone()) {
                return Err(MonitorError::invalid(format!(
                    "duplicate notification rule '{}'",
                    rule.name
                )));
            }
            if let Some(missing) = rule.channels.iter().find(|c| !known_channels.contains(*c)) {
                return Err(MonitorError::invalid(format!(
                    "rule '{}' refers to unconfigured channel '{}'",
                    rule.name, missing
                )));
            }
        }
        if let Some(missing) = self
            .notification
            .default_channels
            .iter()
            .find(|c| !known_channels.contains(*c))
        {
            return Err(MonitorError::invalid(format!(
                "default channel '{}' is not configured",
                missing
            )));
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_screen_platform() -> String {
    "wechat_win".to_string()
}

fn default_api_platform() -> String {
    "wechat_kf".to_string()
}

fn default_min_line_chars() -> usize {
    3
}

fn default_notification_log() -> String {
    "./notifications.log".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Priority;
    use std::fs;
    use tempfile::NamedTempFile;

    const FULL_CONFIG: &str = r#"
[monitor]
poll_interval_secs = 3
dedup_window_secs = 60
store_only_matches = true

[keywords]
list = ["退款", "投诉"]
match_mode = "fuzzy"
case_sensitive = true
fuzzy_threshold = 0.8

[[sources]]
kind = "screen"
name = "wechat-desktop"
window_title = "客户群"
command = ["python", "capture_ocr.py"]

[[sources]]
kind = "api"
name = "wechat-kf"
app_id = "wx123"
app_secret = "secret"
poll_interval_secs = 2

[notification]
enabled = true
default_channels = ["console"]

[notification.channels]
console = true
file = { path = "/tmp/notify.log" }
webhooks = [{ name = "ops", url = "https://example.invalid/hook", flavor = "dingtalk" }]

[[notification.rules]]
name = "refunds"
keywords = ["退款"]
channels = ["console", "webhook:ops"]
priority = "CRITICAL"
cooldown_seconds = 60
"#;

    #[test]
    fn test_monitor_config_default() {
        let config = MonitorConfig::default();

        assert_eq!(config.monitor.poll_interval_secs, 5);
        assert_eq!(config.monitor.dedup_window_secs, 120);
        assert!(!config.monitor.store_only_matches);
        assert_eq!(config.keywords.match_mode, MatchMode::Contain);
        assert!(!config.keywords.case_sensitive);
        assert!((config.keywords.fuzzy_threshold - 0.7).abs() < f64::EPSILON);
        assert!(!config.notification.enabled);
        assert_eq!(config.notification.send_timeout_secs, 10);
        assert!(config.sources.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_monitor_config_from_file() -> anyhow::Result<()> {
        let temp_file = NamedTempFile::new()?;
        fs::write(temp_file.path(), FULL_CONFIG)?;

        let config = MonitorConfig::from_file(temp_file.path())?;

        assert_eq!(config.monitor.poll_interval_secs, 3);
        assert!(config.monitor.store_only_matches);
        assert_eq!(config.monitor.poll_timeout_secs, 10);
        assert_eq!(config.keywords.list, vec!["退款", "投诉"]);
        assert_eq!(config.keywords.match_mode, MatchMode::Fuzzy);
        assert_eq!(config.sources.len(), 2);
        match &config.sources[0] {
            SourceConfig::Screen(screen) => {
                assert_eq!(screen.window_title, "客户群");
                assert_eq!(screen.platform, "wechat_win");
                assert_eq!(screen.min_line_chars, 3);
            }
            other => panic!("expected screen source, got {:?}", other),
        }
        assert_eq!(config.sources[1].poll_interval_secs(), Some(2));

        let rule = &config.notification.rules[0];
        assert_eq!(rule.priority, Priority::Critical);
        assert_eq!(rule.cooldown_seconds, 60);
        assert!(rule.enabled);
        assert_eq!(
            config.notification.channels.channel_names(),
            vec!["console", "file", "webhook:ops"]
        );
        Ok(())
    }

    #[test]
    fn test_monitor_config_file_not_found() {
        let result = MonitorConfig::from_file("nonexistent_file.toml");
        assert!(matches!(result, Err(MonitorError::ConfigurationInvalid(_))));
    }

    #[test]
    fn test_load_or_default_missing_file() -> anyhow::Result<()> {
        let config = MonitorConfig::load_or_default("definitely_missing_chatwatch.toml")?;
        assert_eq!(config.monitor.poll_interval_secs, 5);
        Ok(())
    }

    #[test]
    fn test_monitor_config_invalid_toml() -> anyhow::Result<()> {
        let temp_file = NamedTempFile::new()?;
        fs::write(temp_file.path(), "invalid toml content [[[")?;

        let result = MonitorConfig::load_or_default(temp_file.path());
        assert!(matches!(result, Err(MonitorError::ConfigurationInvalid(_))));
        Ok(())
    }

    #[test]
    fn test_rule_with_unknown_channel_rejected() {
        let toml = r#"
[[notification.rules]]
name = "r"
keywords = ["a"]
channels = ["email"]
"#;
        let err = MonitorConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("email"));
    }

    #[test]
    fn test_duplicate_rule_names_rejected() {
        let toml = r#"
[[notification.rules]]
name = "r"
keywords = ["a"]
channels = ["console"]

[[notification.rules]]
name = "r"
keywords = ["b"]
channels = ["console"]
"#;
        assert!(MonitorConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_invalid_threshold_and_interval() {
        assert!(MonitorConfig::from_toml_str("[keywords]\nfuzzy_threshold = 1.5").is_err());
        assert!(MonitorConfig::from_toml_str("[monitor]\npoll_interval_secs = 0").is_err());
    }

    #[test]
    fn test_zero_send_timeout_rejected() -> anyhow::Result<()> {
        let err = MonitorConfig::from_toml_str("[notification]\nsend_timeout_secs = 0")
            .err()
            .ok_or_else(|| anyhow::anyhow!("zero send timeout accepted"))?;
        assert!(err.to_string().contains("send_timeout_secs"));
        assert!(MonitorConfig::from_toml_str("[notification]\nsend_timeout_secs = 1").is_ok());
        Ok(())
    }

    #[test]
    fn test_negative_cooldown_rejected() {
        let toml = r#"
[[notification.rules]]
name = "r"
keywords = ["a"]
channels = ["console"]
cooldown_seconds = -5
"#;
        assert!(MonitorConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_screen_source_requires_command() {
        let toml = r#"
[[sources]]
kind = "screen"
name = "desk"
command = []
"#;
        assert!(MonitorConfig::from_toml_str(toml).is_err());
    }
}
