pub mod channel;
pub mod webhook;

pub use channel::{Channel, ChannelRegistry, ConsoleChannel, FileChannel, Notification};
pub use webhook::WebhookChannel;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use crate::config::NotificationSettings;
use crate::message::Message;

/// Severity ordering: `Critical` compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "NORMAL" => Ok(Priority::Normal),
            "HIGH" => Ok(Priority::High),
            "CRITICAL" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub name: String,
    pub keywords: Vec<String>,
    pub channels: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_cooldown", alias = "cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_cooldown() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

impl KeywordRule {
    pub fn new(name: &str, keywords: &[&str], channels: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            priority: Priority::Normal,
            cooldown_seconds: default_cooldown(),
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cooldown(mut self, seconds: u64) -> Self {
        self.cooldown_seconds = seconds;
        self
    }

    /// Matched keywords that also belong to this rule, in match order.
    /// Rule keywords are trimmed and compared the way the filter compares.
    pub fn triggered_by<'a>(&self, matched: &'a [String], case_sensitive: bool) -> Vec<&'a str> {
        let fold = |kw: &str| {
            if case_sensitive {
                kw.trim().to_string()
            } else {
                kw.trim().to_lowercase()
            }
        };
        let own: Vec<String> = self.keywords.iter().map(|kw| fold(kw)).collect();
        matched
            .iter()
            .filter(|kw| own.contains(&fold(kw)))
            .map(String::as_str)
            .collect()
    }
}

/// Rule name to last successful fire. Check and stamp happen under one lock,
/// so two messages racing for the same rule cannot both fire it.
#[derive(Debug, Default)]
pub struct CooldownState {
    last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CooldownState {
    pub fn try_acquire(&self, rule: &KeywordRule, now: DateTime<Utc>) -> bool {
        let mut last_fired = self.last_fired.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(last) = last_fired.get(&rule.name) {
            let cooldown = i64::try_from(rule.cooldown_seconds)
                .ok()
                .and_then(ChronoDuration::try_seconds)
                .unwrap_or(ChronoDuration::MAX);
            let elapsed = now.signed_duration_since(*last);
            if elapsed < cooldown {
                debug!(
                    "Rule '{}' in cooldown, {}s remaining",
                    rule.name,
                    cooldown
                        .checked_sub(&elapsed)
                        .map(|left| left.num_seconds())
                        .unwrap_or(i64::MAX)
                );
                return false;
            }
        }
        last_fired.insert(rule.name.clone(), now);
        true
    }

    pub fn last_fired(&self, rule_name: &str) -> Option<DateTime<Utc>> {
        self.last_fired
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(rule_name)
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    PartiallyDelivered,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelResult {
    pub channel: String,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FireReport {
    /// Rule name, or `None` for the default-channel fallback.
    pub rule: Option<String>,
    pub priority: Priority,
    pub results: Vec<ChannelResult>,
    pub outcome: DeliveryOutcome,
}

impl FireReport {
    fn new(rule: Option<String>, priority: Priority, results: Vec<ChannelResult>) -> Self {
        let delivered = results.iter().filter(|r| r.ok).count();
        let outcome = if delivered == results.len() && delivered > 0 {
            DeliveryOutcome::Delivered
        } else if delivered > 0 {
            DeliveryOutcome::PartiallyDelivered
        } else {
            DeliveryOutcome::Failed
        };
        Self {
            rule,
            priority,
            results,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NotifyReport {
    pub message_id: String,
    pub fired: Vec<FireReport>,
    pub suppressed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStatus {
    pub sent: u64,
    pub failed: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

pub struct RuleEngine {
    enabled: bool,
    case_sensitive: AtomicBool,
    rules: RwLock<Vec<KeywordRule>>,
    default_channels: Vec<String>,
    send_timeout: Duration,
    channels: ChannelRegistry,
    cooldowns: CooldownState,
    channel_status: Mutex<HashMap<String, ChannelStatus>>,
}

impl RuleEngine {
    pub fn new(rules: Vec<KeywordRule>, channels: ChannelRegistry) -> Self {
        Self {
            enabled: true,
            case_sensitive: AtomicBool::new(false),
            rules: RwLock::new(rules),
            default_channels: Vec::new(),
            send_timeout: Duration::from_secs(10),
            channels,
            cooldowns: CooldownState::default(),
            channel_status: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &NotificationSettings) -> Self {
        let channels = ChannelRegistry::from_config(&settings.channels);
        let engine = Self::new(settings.rules.clone(), channels)
            .with_default_channels(settings.default_channels.clone())
            .with_send_timeout(Duration::from_secs(settings.send_timeout_secs))
            .with_enabled(settings.enabled);
        info!(
            "Rule engine initialised: {} channels, {} rules, enabled={}",
            engine.channels.len(),
            settings.rules.len(),
            settings.enabled
        );
        engine
    }

    pub fn with_default_channels(mut self, channels: Vec<String>) -> Self {
        self.default_channels = channels;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Follows the keyword filter's case setting.
    pub fn set_case_sensitive(&self, case_sensitive: bool) {
        self.case_sensitive.store(case_sensitive, Ordering::Relaxed);
    }

    pub fn rules(&self) -> Vec<KeywordRule> {
        self.rules.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Swaps the rule set. Cooldown stamps survive for rules that keep their name.
    pub fn replace_rules(&self, rules: Vec<KeywordRule>) {
        *self.rules.write().unwrap_or_else(|p| p.into_inner()) = rules;
    }

    pub fn cooldowns(&self) -> &CooldownState {
        &self.cooldowns
    }

    pub fn channel_status(&self) -> HashMap<String, ChannelStatus> {
        self.channel_status.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub async fn notify(&self, message: &Message) -> NotifyReport {
        self.notify_at(message, Utc::now()).await
    }

    /// Fires every enabled rule whose keywords intersect the message's
    /// matches and whose cooldown has elapsed. Cooldowns are stamped before
    /// any channel is contacted. Delivery failures are recorded, never raised.
    pub async fn notify_at(&self, message: &Message, now: DateTime<Utc>) -> NotifyReport {
        let mut report = NotifyReport {
            message_id: message.id.clone(),
            ..NotifyReport::default()
        };
        if !self.enabled || !message.is_matched() {
            return report;
        }

        let mut firing = Vec::new();
        let mut any_rule_matched = false;
        let case_sensitive = self.case_sensitive.load(Ordering::Relaxed);
        for rule in self.rules().into_iter().filter(|r| r.enabled) {
            let triggers = rule.triggered_by(&message.matched_keywords, case_sensitive);
            if triggers.is_empty() {
                continue;
            }
            any_rule_matched = true;
            if self.cooldowns.try_acquire(&rule, now) {
                info!(
                    "Rule '{}' fired by {:?} (priority {})",
                    rule.name, triggers, rule.priority
                );
                let notification = build_notification(message, &triggers, Some(&rule));
                firing.push((Some(rule.name.clone()), rule.channels.clone(), notification));
            } else {
                report.suppressed.push(rule.name.clone());
            }
        }

        if !any_rule_matched && !self.default_channels.is_empty() {
            let triggers: Vec<&str> = message.matched_keywords.iter().map(String::as_str).collect();
            let notification = build_notification(message, &triggers, None);
            firing.push((None, self.default_channels.clone(), notification));
        }

        let dispatches = firing
            .iter()
            .map(|(rule, channels, notification)| self.dispatch(rule.clone(), channels, notification));
        report.fired = join_all(dispatches).await;
        report
    }

    async fn dispatch(
        &self,
        rule: Option<String>,
        channels: &[String],
        notification: &Notification,
    ) -> FireReport {
        let sends = channels.iter().map(|name| self.send_one(name, notification));
        let results = join_all(sends).await;
        let report = FireReport::new(rule, notification.priority, results);

        let label = report.rule.as_deref().unwrap_or("<default>");
        match report.outcome {
            DeliveryOutcome::Delivered => debug!("Rule '{}' delivered to all channels", label),
            DeliveryOutcome::PartiallyDelivered => warn!(
                "Rule '{}' partially delivered: {}/{} channels",
                label,
                report.results.iter().filter(|r| r.ok).count(),
                report.results.len()
            ),
            DeliveryOutcome::Failed => error!("Rule '{}' failed on every channel", label),
        }
        report
    }

    async fn send_one(&self, name: &str, notification: &Notification) -> ChannelResult {
        let outcome = match self.channels.get(name) {
            Some(channel) => match tokio::time::timeout(self.send_timeout, channel.send(notification)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("send timed out after {:?}", self.send_timeout)),
            },
            None => Err("unknown channel".to_string()),
        };

        let mut status = self.channel_status.lock().unwrap_or_else(|p| p.into_inner());
        let entry = status.entry(name.to_string()).or_default();
        match outcome {
            Ok(()) => {
                entry.sent += 1;
                ChannelResult {
                    channel: name.to_string(),
                    ok: true,
                    error: None,
                }
            }
            Err(reason) => {
                error!("Notification to channel '{}' failed: {}", name, reason);
                entry.failed += 1;
                entry.last_error = Some(reason.clone());
                entry.last_error_at = Some(Utc::now());
                ChannelResult {
                    channel: name.to_string(),
                    ok: false,
                    error: Some(reason),
                }
            }
        }
    }
}

fn build_notification(message: &Message, triggers: &[&str], rule: Option<&KeywordRule>) -> Notification {
    let mut metadata = BTreeMap::new();
    metadata.insert("message_id".to_string(), message.id.clone());
    metadata.insert("platform".to_string(), message.source_platform.to_string());
    metadata.insert("source".to_string(), message.source_name.clone());
    metadata.insert("conversation".to_string(), message.channel.clone());
    metadata.insert("observed_at".to_string(), message.observed_at.to_rfc3339());
    metadata.insert("keywords".to_string(), triggers.join(","));
    if let Some(sender) = &message.sender {
        metadata.insert("sender".to_string(), sender.clone());
    }
    if let Some(rule) = rule {
        metadata.insert("rule".to_string(), rule.name.clone());
    }

    Notification {
        title: format!("Keyword match: {}", triggers.join(", ")),
        body: format!("[{}] {}", message.channel, message.content),
        priority: rule.map(|r| r.priority).unwrap_or_default(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Platform, RawMessage};
    use std::sync::Arc;

    fn matched(content: &str, keywords: &[&str]) -> Message {
        let mut msg =
            Message::from_raw(RawMessage::new("客户群", content), Platform::WechatWin, "desk").unwrap();
        msg.matched_keywords = keywords.iter().map(|k| k.to_string()).collect();
        msg
    }

    fn file_registry(dir: &std::path::Path) -> ChannelRegistry {
        let mut registry = ChannelRegistry::new();
        registry.register(Channel::File(FileChannel::new(dir.join("ok.log"))));
        registry
    }

    #[test]
    fn test_priority_ordering_and_parse() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!("critical".parse::<Priority>(), Ok(Priority::Critical));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_rule_deserialize_cooldown_alias() -> anyhow::Result<()> {
        let rule: KeywordRule =
            toml::from_str("name = \"r\"\nkeywords = [\"a\"]\nchannels = [\"console\"]\ncooldown = 30")?;
        assert_eq!(rule.cooldown_seconds, 30);
        assert_eq!(rule.priority, Priority::Normal);
        Ok(())
    }

    #[test]
    fn test_cooldown_enforcement() {
        let cooldowns = CooldownState::default();
        let rule = KeywordRule::new("refunds", &["退款"], &["file"]).with_cooldown(60);
        let t0 = Utc::now();

        assert!(cooldowns.try_acquire(&rule, t0));
        assert!(!cooldowns.try_acquire(&rule, t0 + ChronoDuration::seconds(10)));
        // suppression does not move the stamp
        assert_eq!(cooldowns.last_fired("refunds"), Some(t0));
        assert!(cooldowns.try_acquire(&rule, t0 + ChronoDuration::seconds(70)));
    }

    #[test]
    fn test_huge_cooldown_suppresses_without_overflow() {
        let cooldowns = CooldownState::default();
        let rule = KeywordRule::new("quiet", &["a"], &["file"]).with_cooldown(10_000_000_000_000_000);
        let now = Utc::now();

        assert!(cooldowns.try_acquire(&rule, now));
        assert!(!cooldowns.try_acquire(&rule, now));
        assert!(!cooldowns.try_acquire(&rule, now - ChronoDuration::seconds(5)));

        let max = KeywordRule::new("max", &["a"], &["file"]).with_cooldown(u64::MAX);
        assert!(cooldowns.try_acquire(&max, now));
        assert!(!cooldowns.try_acquire(&max, now + ChronoDuration::days(365 * 100)));
    }

    #[test]
    fn test_rule_keywords_trimmed_and_case_folded() {
        let rule = KeywordRule::new("r", &[" 退款 ", "REFUND"], &["file"]);
        let matched: Vec<String> = vec!["退款".to_string(), "refund".to_string()];

        assert_eq!(rule.triggered_by(&matched, false), vec!["退款", "refund"]);
        assert_eq!(rule.triggered_by(&matched, true), vec!["退款"]);
    }

    #[test]
    fn test_zero_cooldown_always_fires() {
        let cooldowns = CooldownState::default();
        let rule = KeywordRule::new("r", &["a"], &["file"]).with_cooldown(0);
        let now = Utc::now();
        assert!(cooldowns.try_acquire(&rule, now));
        assert!(cooldowns.try_acquire(&rule, now));
    }

    #[tokio::test]
    async fn test_cooldown_across_messages() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = RuleEngine::new(
            vec![KeywordRule::new("refunds", &["退款"], &["file"]).with_cooldown(60)],
            file_registry(dir.path()),
        );
        let t0 = Utc::now();

        let first = engine.notify_at(&matched("我要退款", &["退款"]), t0).await;
        let second = engine
            .notify_at(&matched("还是要退款", &["退款"]), t0 + ChronoDuration::seconds(10))
            .await;
        let third = engine
            .notify_at(&matched("退款!!", &["退款"]), t0 + ChronoDuration::seconds(70))
            .await;

        assert_eq!(first.fired.len(), 1);
        assert!(second.fired.is_empty());
        assert_eq!(second.suppressed, vec!["refunds"]);
        assert_eq!(third.fired.len(), 1);

        let log = std::fs::read_to_string(dir.path().join("ok.log"))?;
        assert_eq!(log.lines().count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_fan_out_survives_failing_channel() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut registry = file_registry(dir.path());
        registry.register(Channel::Webhook(WebhookChannel::new(
            "down",
            "http://127.0.0.1:9/hook",
            crate::config::WebhookFlavor::Generic,
        )));
        let engine = RuleEngine::new(
            vec![KeywordRule::new("complaints", &["投诉"], &["webhook:down", "file"])],
            registry,
        );

        let report = engine.notify(&matched("我要投诉", &["投诉"])).await;

        assert_eq!(report.fired.len(), 1);
        let fire = &report.fired[0];
        assert_eq!(fire.outcome, DeliveryOutcome::PartiallyDelivered);
        assert!(!fire.results[0].ok);
        assert!(fire.results[1].ok);
        assert!(std::fs::read_to_string(dir.path().join("ok.log"))?.contains("投诉"));

        let status = engine.channel_status();
        assert_eq!(status["webhook:down"].failed, 1);
        assert!(status["webhook:down"].last_error.is_some());
        assert_eq!(status["file"].sent, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_channel_counts_as_failure() {
        let engine = RuleEngine::new(
            vec![KeywordRule::new("r", &["a"], &["email"])],
            ChannelRegistry::new(),
        );
        let report = engine.notify(&matched("a", &["a"])).await;
        assert_eq!(report.fired[0].outcome, DeliveryOutcome::Failed);
        assert_eq!(report.fired[0].results[0].error.as_deref(), Some("unknown channel"));
    }

    #[tokio::test]
    async fn test_overlapping_rules_fire_independently() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = RuleEngine::new(
            vec![
                KeywordRule::new("money", &["退款", "付款"], &["file"]).with_priority(Priority::High),
                KeywordRule::new("refunds", &["退款"], &["file"]).with_priority(Priority::Critical),
                KeywordRule::new("complaints", &["投诉"], &["file"]),
                KeywordRule {
                    enabled: false,
                    ..KeywordRule::new("disabled", &["退款"], &["file"])
                },
            ],
            file_registry(dir.path()),
        );

        let report = engine.notify(&matched("退款付款", &["退款", "付款"])).await;
        let fired: Vec<_> = report.fired.iter().filter_map(|f| f.rule.clone()).collect();
        assert_eq!(fired, vec!["money", "refunds"]);
        assert_eq!(report.fired[1].priority, Priority::Critical);
        Ok(())
    }

    #[tokio::test]
    async fn test_unmatched_message_never_fires() {
        let engine = RuleEngine::new(
            vec![KeywordRule::new("r", &["a"], &["console"])],
            ChannelRegistry::new(),
        );
        let report = engine.notify(&matched("nothing", &[])).await;
        assert!(report.fired.is_empty());
        assert!(report.suppressed.is_empty());
    }

    #[tokio::test]
    async fn test_default_channels_when_no_rule_matches() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = RuleEngine::new(
            vec![KeywordRule::new("r", &["other"], &["file"])],
            file_registry(dir.path()),
        )
        .with_default_channels(vec!["file".to_string()]);

        let report = engine.notify(&matched("发货了吗", &["发货"])).await;
        assert_eq!(report.fired.len(), 1);
        assert!(report.fired[0].rule.is_none());
        assert_eq!(report.fired[0].outcome, DeliveryOutcome::Delivered);
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_engine_is_silent() {
        let engine = RuleEngine::new(
            vec![KeywordRule::new("r", &["a"], &["console"])],
            ChannelRegistry::new(),
        )
        .with_enabled(false);
        assert!(engine.notify(&matched("a", &["a"])).await.fired.is_empty());
    }

    #[tokio::test]
    async fn test_channel_sends_run_concurrently() -> anyhow::Result<()> {
        // Accepts connections and never answers, so every webhook send hangs.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/hook", listener.local_addr()?);
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut registry = ChannelRegistry::new();
        for name in ["slow-a", "slow-b"] {
            registry.register(Channel::Webhook(WebhookChannel::new(
                name,
                &url,
                crate::config::WebhookFlavor::Generic,
            )));
        }
        let timeout = Duration::from_millis(400);
        let engine = RuleEngine::new(
            vec![KeywordRule::new("r", &["急"], &["webhook:slow-a", "webhook:slow-b"])],
            registry,
        )
        .with_send_timeout(timeout);

        let started = std::time::Instant::now();
        let report = engine.notify(&matched("急", &["急"])).await;
        let elapsed = started.elapsed();
        server.abort();

        assert!(elapsed >= timeout);
        assert!(elapsed < timeout * 2, "sends ran one after another: {:?}", elapsed);
        let fire = &report.fired[0];
        assert_eq!(fire.outcome, DeliveryOutcome::Failed);
        for result in &fire.results {
            assert!(result.error.as_deref().is_some_and(|e| e.contains("timed out")));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_messages_fire_rule_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(RuleEngine::new(
            vec![KeywordRule::new("burst", &["急"], &["file"]).with_cooldown(300)],
            file_registry(dir.path()),
        ));
        let now = Utc::now();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.notify_at(&matched(&format!("急 {}", i), &["急"]), now).await
                })
            })
            .collect();

        let mut fired = 0;
        for handle in handles {
            fired += handle.await?.fired.len();
        }
        assert_eq!(fired, 1);
        Ok(())
    }
}
