pub mod health;
pub mod keywords;

pub use health::{SourceHealth, SourceState};
pub use keywords::{KeywordOrigin, resolve_keywords};

use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::config::MonitorConfig;
use crate::dedup::Deduplicator;
use crate::error::{MonitorError, Result};
use crate::filter::KeywordFilter;
use crate::message::Message;
use crate::notify::RuleEngine;
use crate::source::{ApiInbox, Source};
use crate::store::MessageStore;

const BATCH_QUEUE_SIZE: usize = 64;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

/// Counters over every candidate the pipeline has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    pub candidates: u64,
    pub duplicates: u64,
    pub emitted: u64,
    pub matched: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub notifications_fired: u64,
}

#[derive(Debug, Default)]
struct Counters {
    candidates: AtomicU64,
    duplicates: AtomicU64,
    emitted: AtomicU64,
    matched: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
    notifications_fired: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MonitorStats {
        MonitorStats {
            candidates: self.candidates.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            notifications_fired: self.notifications_fired.load(Ordering::Relaxed),
        }
    }
}

/// A batch of messages from one poll of one source.
struct Batch {
    source: String,
    messages: Vec<Message>,
}

struct Shared {
    config: RwLock<MonitorConfig>,
    store: Arc<dyn MessageStore>,
    engine: Arc<RuleEngine>,
    dedup: Deduplicator,
    filter: RwLock<Arc<KeywordFilter>>,
    keyword_origin: RwLock<KeywordOrigin>,
    health: RwLock<BTreeMap<String, SourceHealth>>,
    inboxes: RwLock<HashMap<String, ApiInbox>>,
    counters: Counters,
    notifications: Mutex<JoinSet<()>>,
}

impl Shared {
    fn is_enabled(&self, name: &str) -> bool {
        read(&self.health).get(name).map(|h| h.enabled).unwrap_or(false)
    }

    fn with_health(&self, name: &str, update: impl FnOnce(&mut SourceHealth)) {
        if let Some(health) = write(&self.health).get_mut(name) {
            update(health);
        }
    }

    fn finish_processing(&self, name: &str) {
        self.with_health(name, |h| {
            if h.state == SourceState::Processing {
                h.state = SourceState::Idle;
            }
        });
    }

    async fn refresh_keywords(&self) -> KeywordOrigin {
        let settings = read(&self.config).keywords.clone();
        let (keywords, origin) = resolve_keywords(self.store.as_ref(), &settings.list).await;
        let filter = KeywordFilter::from_settings(keywords, &settings);
        self.engine.set_case_sensitive(settings.case_sensitive);
        debug!(
            "Keyword filter rebuilt: {} keywords, mode {}",
            filter.keywords().len(),
            filter.mode()
        );
        *write(&self.filter) = Arc::new(filter);
        *write(&self.keyword_origin) = origin;
        origin
    }

    /// Store rules override configured ones. A failing store keeps the
    /// rules currently active.
    async fn refresh_rules(&self) {
        match self.store.load_rules().await {
            Ok(rules) if !rules.is_empty() => {
                info!("Loaded {} notification rules from store", rules.len());
                self.engine.replace_rules(rules);
            }
            Ok(_) => {
                let rules = read(&self.config).notification.rules.clone();
                debug!("No stored rules, using {} rules from config", rules.len());
                self.engine.replace_rules(rules);
            }
            Err(e) => warn!(
                "Failed to reload notification rules ({}), keeping {} active rules",
                e,
                self.engine.rules().len()
            ),
        }
    }

    fn spawn_notification(self: &Arc<Self>, message: Message) {
        let shared = Arc::clone(self);
        let mut pending = self.notifications.lock().unwrap_or_else(|p| p.into_inner());
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            let report = shared.engine.notify(&message).await;
            shared
                .counters
                .notifications_fired
                .fetch_add(report.fired.len() as u64, Ordering::Relaxed);
        });
    }

    async fn flush_notifications(&self) {
        let mut pending = std::mem::take(
            &mut *self.notifications.lock().unwrap_or_else(|p| p.into_inner()),
        );
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                error!("Notification task failed: {}", e);
            }
        }
    }

    fn pending_notifications(&self) -> usize {
        self.notifications.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Polls one source under the configured timeout and records the outcome
/// in its health entry. `None` means nothing should be processed.
async fn poll_source(shared: &Shared, source: &mut Source) -> Option<Vec<Message>> {
    let name = source.name().to_string();
    if !shared.is_enabled(&name) {
        debug!("Source '{}' disabled, skipping poll", name);
        return None;
    }

    shared.with_health(&name, |h| h.state = SourceState::Polling);
    let timeout = read(&shared.config).monitor.poll_timeout();
    let outcome = match tokio::time::timeout(timeout, source.poll()).await {
        Ok(result) => result,
        Err(_) => Err(MonitorError::unavailable(
            &name,
            format!("poll timed out after {:?}", timeout),
        )),
    };

    let now = Utc::now();
    match outcome {
        Ok(messages) => {
            shared.with_health(&name, |h| h.record_success(now, messages.len()));
            Some(messages)
        }
        Err(e) => {
            let reason = match e {
                MonitorError::SourceUnavailable { reason, .. } => reason,
                other => other.to_string(),
            };
            shared.with_health(&name, |h| h.record_failure(now, reason));
            None
        }
    }
}

/// Runs dedup, filter, persistence and notification over one batch, in
/// order. Returns the messages that passed the deduplicator.
async fn process_batch(shared: &Arc<Shared>, source: &str, messages: Vec<Message>) -> Vec<Message> {
    let filter = Arc::clone(&*read(&shared.filter));
    let store_only_matches = read(&shared.config).monitor.store_only_matches;
    let counters = &shared.counters;
    let mut emitted = Vec::with_capacity(messages.len());

    for mut message in messages {
        Counters::bump(&counters.candidates);
        if !shared.dedup.should_emit(&message) {
            Counters::bump(&counters.duplicates);
            continue;
        }
        Counters::bump(&counters.emitted);

        let matched = filter.apply(&mut message);
        if matched {
            Counters::bump(&counters.matched);
            info!(
                "[{}] {} matched {:?}: {}",
                source,
                message.channel,
                message.matched_keywords,
                message.preview(50)
            );
        }

        if matched || !store_only_matches {
            match shared.store.insert(&message).await {
                Ok(id) => {
                    Counters::bump(&counters.persisted);
                    debug!("Persisted message {}", id);
                }
                Err(e) => {
                    Counters::bump(&counters.persist_failures);
                    error!("Failed to persist message {}: {}", message.id, e);
                }
            }
        }

        if matched {
            shared.spawn_notification(message.clone());
        }
        emitted.push(message);
    }

    emitted
}

async fn run_source(
    shared: Arc<Shared>,
    mut source: Source,
    every: Duration,
    batches: mpsc::Sender<Batch>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = source.name().to_string();
    info!("Source '{}' polling every {:?}", name, every);

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let Some(messages) = poll_source(&shared, &mut source).await else {
            continue;
        };
        if messages.is_empty() {
            continue;
        }
        let batch = Batch {
            source: name.clone(),
            messages,
        };
        if batches.send(batch).await.is_err() {
            warn!("Pipeline closed, source '{}' stopping", name);
            break;
        }
    }

    shared.with_health(&name, |h| h.state = SourceState::Idle);
    debug!("Source '{}' task stopped", name);
}

async fn run_pipeline(shared: Arc<Shared>, mut batches: mpsc::Receiver<Batch>) {
    while let Some(batch) = batches.recv().await {
        process_batch(&shared, &batch.source, batch.messages).await;
        shared.finish_processing(&batch.source);
    }
    debug!("Pipeline drained");
}

async fn run_reload(shared: Arc<Shared>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; start() already loaded everything.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.refresh_keywords().await;
                shared.refresh_rules().await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Drives every configured source through dedup, filter, persistence and
/// notification.
pub struct Monitor {
    shared: Arc<Shared>,
    sources: Vec<Source>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pipeline: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, store: Arc<dyn MessageStore>, engine: Arc<RuleEngine>) -> Self {
        let dedup = Deduplicator::new(config.monitor.dedup_window());
        let filter = KeywordFilter::from_settings(config.keywords.list.clone(), &config.keywords);
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                store,
                engine,
                dedup,
                filter: RwLock::new(Arc::new(filter)),
                keyword_origin: RwLock::new(KeywordOrigin::Config),
                health: RwLock::new(BTreeMap::new()),
                inboxes: RwLock::new(HashMap::new()),
                counters: Counters::default(),
                notifications: Mutex::new(JoinSet::new()),
            }),
            sources: Vec::new(),
            shutdown,
            tasks: Vec::new(),
            pipeline: None,
        }
    }

    pub fn add_source(&mut self, source: Source) -> Result<()> {
        let info = source.describe();
        let mut health = write(&self.shared.health);
        if health.contains_key(&info.name) {
            return Err(MonitorError::invalid(format!(
                "source '{}' is already registered",
                info.name
            )));
        }
        if let Some(inbox) = source.api_inbox() {
            write(&self.shared.inboxes).insert(info.name.clone(), inbox);
        }
        health.insert(info.name.clone(), SourceHealth::new(&info));
        drop(health);

        info!(
            "Added source '{}' ({:?}, platform {})",
            info.name, info.kind, info.platform
        );
        self.sources.push(source);
        Ok(())
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn set_source_enabled(&self, name: &str, enabled: bool) -> bool {
        self.handle().set_source_enabled(name, enabled)
    }

    /// Spawns one polling task per source, the batch pipeline and the
    /// keyword/rule reload task. Sources move into their tasks.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            warn!("Monitor already running");
            return Ok(());
        }
        if self.sources.is_empty() {
            return Err(MonitorError::invalid("no sources configured"));
        }

        self.shutdown.send_replace(false);
        self.refresh_keywords().await;
        self.refresh_rules().await;

        let config = read(&self.shared.config).clone();
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_QUEUE_SIZE);

        for source in self.sources.drain(..) {
            let every = config
                .sources
                .iter()
                .find(|c| c.name() == source.name())
                .and_then(|c| c.poll_interval_secs())
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.monitor.poll_interval());
            self.tasks.push(tokio::spawn(run_source(
                Arc::clone(&self.shared),
                source,
                every,
                batch_tx.clone(),
                self.shutdown.subscribe(),
            )));
        }
        drop(batch_tx);

        self.pipeline = Some(tokio::spawn(run_pipeline(Arc::clone(&self.shared), batch_rx)));

        if config.monitor.keyword_reload_secs > 0 {
            self.tasks.push(tokio::spawn(run_reload(
                Arc::clone(&self.shared),
                Duration::from_secs(config.monitor.keyword_reload_secs),
                self.shutdown.subscribe(),
            )));
        }

        info!("Monitor started with {} sources", read(&self.shared.health).len());
        Ok(())
    }

    /// Signals every task to stop, lets in-flight polls and batches finish
    /// within the grace period, then aborts whatever is left.
    pub async fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        info!("Stopping monitor...");
        self.shutdown.send_replace(true);

        let grace = read(&self.shared.config).monitor.shutdown_grace();
        let mut handles: Vec<JoinHandle<()>> = self.tasks.drain(..).collect();
        handles.extend(self.pipeline.take());

        let finished = tokio::time::timeout(grace, join_all(handles.iter_mut()))
            .await
            .is_ok();
        if !finished {
            warn!("Monitor tasks did not finish within {:?}, aborting", grace);
            for handle in &handles {
                handle.abort();
            }
        }

        if tokio::time::timeout(grace, self.shared.flush_notifications())
            .await
            .is_err()
        {
            warn!("Pending notifications abandoned after {:?}", grace);
        }
        info!("Monitor stopped");
    }

    /// One sequential pass over the sources not yet handed to `start`.
    pub async fn tick(&mut self) -> Vec<Message> {
        let mut emitted = Vec::new();
        for source in self.sources.iter_mut() {
            let name = source.name().to_string();
            if let Some(messages) = poll_source(&self.shared, source).await {
                emitted.extend(process_batch(&self.shared, &name, messages).await);
                self.shared.finish_processing(&name);
            }
        }
        emitted
    }

    pub async fn refresh_keywords(&self) -> KeywordOrigin {
        self.shared.refresh_keywords().await
    }

    pub async fn refresh_rules(&self) {
        self.shared.refresh_rules().await
    }

    /// Re-reads the configuration file. On failure the active configuration
    /// is left untouched and the error is returned.
    pub async fn reload_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let config = match MonitorConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Config reload from {} failed, keeping last-known-good configuration: {}",
                    path.display(),
                    e
                );
                return Err(e);
            }
        };

        // Channels and poll intervals are fixed at startup.
        self.shared.dedup.set_window(config.monitor.dedup_window());
        *write(&self.shared.config) = config;
        self.shared.refresh_keywords().await;
        self.shared.refresh_rules().await;
        info!("Configuration reloaded from {}", path.display());
        Ok(())
    }

    /// Waits for every notification spawned so far.
    pub async fn flush_notifications(&self) {
        self.shared.flush_notifications().await
    }
}

/// Read side of a monitor for status endpoints and runtime toggles.
#[derive(Clone)]
pub struct MonitorHandle {
    shared: Arc<Shared>,
}

impl MonitorHandle {
    pub fn health(&self) -> Vec<SourceHealth> {
        read(&self.shared.health).values().cloned().collect()
    }

    pub fn source_health(&self, name: &str) -> Option<SourceHealth> {
        read(&self.shared.health).get(name).cloned()
    }

    pub fn stats(&self) -> MonitorStats {
        self.shared.counters.snapshot()
    }

    pub fn keyword_origin(&self) -> KeywordOrigin {
        *read(&self.shared.keyword_origin)
    }

    pub fn keywords(&self) -> Vec<String> {
        read(&self.shared.filter).keywords().to_vec()
    }

    pub fn inbox(&self, source: &str) -> Option<ApiInbox> {
        read(&self.shared.inboxes).get(source).cloned()
    }

    /// Returns false when no source has that name.
    pub fn set_source_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut health = write(&self.shared.health);
        match health.get_mut(name) {
            Some(entry) => {
                entry.enabled = enabled;
                if !enabled {
                    entry.state = SourceState::Idle;
                }
                info!(
                    "Source '{}' {}",
                    name,
                    if enabled { "enabled" } else { "disabled" }
                );
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> Value {
        let filter = Arc::clone(&*read(&self.shared.filter));
        json!({
            "keyword_origin": self.keyword_origin(),
            "keyword_count": filter.keywords().len(),
            "match_mode": filter.mode().to_string(),
            "dedup_entries": self.shared.dedup.len(),
            "rules": self.shared.engine.rules().len(),
            "pending_notifications": self.shared.pending_notifications(),
            "stats": self.stats(),
            "sources": self.health(),
            "channels": self.shared.engine.channel_status(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Platform;
    use crate::monitor::keywords::tests::BrokenStore;
    use crate::notify::{Channel, ChannelRegistry, FileChannel, KeywordRule};
    use crate::source::ScreenSource;
    use crate::source::screen::tests::ScriptedCapture;
    use crate::source::screen::{CapturedText, TextCapture};
    use async_trait::async_trait;
    use crate::store::MemoryStore;
    use std::fs;
    use tempfile::tempdir;

    fn config(keywords: &[&str]) -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.keywords.list = keywords.iter().map(|k| k.to_string()).collect();
        config.monitor.shutdown_grace_secs = 2;
        config
    }

    fn screen(name: &str, script: Vec<std::result::Result<&str, &str>>) -> Source {
        Source::Screen(ScreenSource::new(
            name,
            Platform::WechatWin,
            "客户群",
            Box::new(ScriptedCapture::new(script)),
        ))
    }

    fn engine() -> Arc<RuleEngine> {
        Arc::new(RuleEngine::new(Vec::new(), ChannelRegistry::new()))
    }

    /// Never returns a frame.
    struct HangingCapture;

    #[async_trait]
    impl TextCapture for HangingCapture {
        async fn capture(&self) -> Result<CapturedText> {
            std::future::pending().await
        }

        fn describe(&self) -> String {
            "hanging capture".to_string()
        }
    }

    /// Returns the same text after a fixed delay.
    struct SlowCapture {
        delay: Duration,
        text: &'static str,
    }

    #[async_trait]
    impl TextCapture for SlowCapture {
        async fn capture(&self) -> Result<CapturedText> {
            tokio::time::sleep(self.delay).await;
            Ok(CapturedText {
                window_title: None,
                text: self.text.to_string(),
            })
        }

        fn describe(&self) -> String {
            format!("slow capture ({:?})", self.delay)
        }
    }

    #[tokio::test]
    async fn test_health_after_failures_and_recovery() -> anyhow::Result<()> {
        let mut monitor = Monitor::new(config(&["退款"]), Arc::new(MemoryStore::new()), engine());
        monitor.add_source(screen(
            "desk",
            vec![
                Err("window not found"),
                Err("window not found"),
                Err("window not found"),
                Ok("客户: 我要退款"),
            ],
        ))?;
        let handle = monitor.handle();

        for _ in 0..3 {
            assert!(monitor.tick().await.is_empty());
        }
        let health = handle
            .source_health("desk")
            .ok_or_else(|| anyhow::anyhow!("missing health"))?;
        assert!(!health.available);
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.last_error.as_deref(), Some("window not found"));

        assert_eq!(monitor.tick().await.len(), 1);
        let health = handle
            .source_health("desk")
            .ok_or_else(|| anyhow::anyhow!("missing health"))?;
        assert!(health.available);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.state, SourceState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn test_hanging_source_is_cut_off() -> anyhow::Result<()> {
        let mut settings = config(&["退款"]);
        settings.monitor.poll_timeout_secs = 1;
        let mut monitor = Monitor::new(settings, Arc::new(MemoryStore::new()), engine());
        monitor.add_source(Source::Screen(ScreenSource::new(
            "stuck",
            Platform::Qq,
            "客户群",
            Box::new(HangingCapture),
        )))?;
        monitor.add_source(screen("desk", vec![Ok("客户: 我要退款")]))?;
        let handle = monitor.handle();

        let emitted = monitor.tick().await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].source_name, "desk");

        let stuck = handle
            .source_health("stuck")
            .ok_or_else(|| anyhow::anyhow!("missing health"))?;
        assert!(!stuck.available);
        assert_eq!(stuck.state, SourceState::Backoff);
        assert!(stuck.last_error.as_deref().is_some_and(|e| e.contains("timed out")));
        let desk = handle
            .source_health("desk")
            .ok_or_else(|| anyhow::anyhow!("missing health"))?;
        assert!(desk.available);
        Ok(())
    }

    #[tokio::test]
    async fn test_recaptured_lines_are_suppressed() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut monitor = Monitor::new(config(&["退款"]), store.clone(), engine());
        monitor.add_source(screen(
            "desk",
            vec![
                Ok("客户: 我要退款\n客服: 收到"),
                Ok("客户: 我要退款\n客服: 收到\n客户: 快点"),
            ],
        ))?;

        let first = monitor.tick().await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].matched_keywords, vec!["退款"]);
        assert!(!first[1].is_matched());

        let second = monitor.tick().await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].content, "客户: 快点");

        let stats = monitor.handle().stats();
        assert_eq!(stats.candidates, 5);
        assert_eq!(stats.duplicates, 2);
        assert_eq!(stats.emitted, 3);
        assert_eq!(stats.matched, 1);
        assert_eq!(store.messages().await.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_only_matches() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut settings = config(&["退款"]);
        settings.monitor.store_only_matches = true;
        let mut monitor = Monitor::new(settings, store.clone(), engine());
        monitor.add_source(screen("desk", vec![Ok("客户: 我要退款\n客服: 收到")]))?;

        assert_eq!(monitor.tick().await.len(), 2);
        let stored = store.messages().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].matched_keywords, vec!["退款"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_keywords_take_precedence() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::with_keywords(vec!["快点".to_string()]));
        let mut monitor = Monitor::new(config(&["退款"]), store.clone(), engine());
        monitor.add_source(screen("desk", vec![Ok("客户: 我要退款\n客户: 快点")]))?;

        assert_eq!(monitor.refresh_keywords().await, KeywordOrigin::Store);
        let emitted = monitor.tick().await;
        assert!(!emitted[0].is_matched());
        assert_eq!(emitted[1].matched_keywords, vec!["快点"]);

        store.set_keywords(Vec::new()).await;
        assert_eq!(monitor.refresh_keywords().await, KeywordOrigin::Config);
        assert_eq!(monitor.handle().keywords(), vec!["退款"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_failure_does_not_stop_pipeline() -> anyhow::Result<()> {
        let mut monitor = Monitor::new(config(&["退款"]), Arc::new(BrokenStore), engine());
        monitor.add_source(screen("desk", vec![Ok("客户: 我要退款\n客服: 收到")]))?;

        assert_eq!(monitor.refresh_keywords().await, KeywordOrigin::Config);
        assert_eq!(monitor.tick().await.len(), 2);
        let stats = monitor.handle().stats();
        assert_eq!(stats.persisted, 0);
        assert_eq!(stats.persist_failures, 2);
        assert_eq!(stats.matched, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_matched_message_is_notified() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let log_path = dir.path().join("notify.log");
        let mut channels = ChannelRegistry::new();
        channels.register(Channel::File(FileChannel::new(&log_path)));
        let engine = Arc::new(RuleEngine::new(
            vec![KeywordRule::new("refunds", &["退款"], &["file"])],
            channels,
        ));

        let mut monitor = Monitor::new(config(&["退款"]), Arc::new(MemoryStore::new()), engine);
        monitor.add_source(screen("desk", vec![Ok("客户: 我要退款\n客服: 收到")]))?;
        monitor.tick().await;
        monitor.flush_notifications().await;

        let written = fs::read_to_string(&log_path)?;
        assert_eq!(written.lines().count(), 1);
        assert!(written.contains("客户: 我要退款"));
        assert_eq!(monitor.handle().stats().notifications_fired, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_source_is_skipped() -> anyhow::Result<()> {
        let mut monitor = Monitor::new(config(&["退款"]), Arc::new(MemoryStore::new()), engine());
        monitor.add_source(screen("desk", vec![Ok("客户: 我要退款")]))?;
        let handle = monitor.handle();

        assert!(handle.set_source_enabled("desk", false));
        assert!(!handle.set_source_enabled("missing", false));
        assert!(monitor.tick().await.is_empty());
        assert_eq!(handle.stats().candidates, 0);

        handle.set_source_enabled("desk", true);
        assert_eq!(monitor.tick().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_source_name_rejected() -> anyhow::Result<()> {
        let mut monitor = Monitor::new(config(&[]), Arc::new(MemoryStore::new()), engine());
        monitor.add_source(screen("desk", vec![]))?;
        assert!(monitor.add_source(screen("desk", vec![])).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_start_requires_sources() {
        let mut monitor = Monitor::new(config(&[]), Arc::new(MemoryStore::new()), engine());
        assert!(matches!(
            monitor.start().await,
            Err(MonitorError::ConfigurationInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_stop() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut monitor = Monitor::new(config(&["退款"]), store.clone(), engine());
        monitor.add_source(screen("desk", vec![Ok("客户: 我要退款\n客服: 收到")]))?;
        monitor.add_source(screen("qq", vec![Err("window not found")]))?;
        let handle = monitor.handle();

        monitor.start().await?;
        assert!(monitor.is_running());

        for _ in 0..50 {
            if handle.stats().emitted == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        monitor.stop().await;

        assert!(!monitor.is_running());
        assert_eq!(store.messages().await.len(), 2);
        let qq = handle
            .source_health("qq")
            .ok_or_else(|| anyhow::anyhow!("missing health"))?;
        assert!(!qq.available);
        let status = handle.status();
        assert_eq!(status["stats"]["emitted"], 2);
        assert_eq!(status["sources"].as_array().map(Vec::len), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_persists_in_flight_poll() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut monitor = Monitor::new(config(&["退款"]), store.clone(), engine());
        monitor.add_source(Source::Screen(ScreenSource::new(
            "desk",
            Platform::WechatWin,
            "客户群",
            Box::new(SlowCapture {
                delay: Duration::from_millis(300),
                text: "客户: 我要退款",
            }),
        )))?;
        let handle = monitor.handle();

        monitor.start().await?;
        for _ in 0..50 {
            if handle.source_health("desk").map(|h| h.state) == Some(SourceState::Polling) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.stats().emitted, 0);
        monitor.stop().await;

        let stored = store.messages().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].matched_keywords, vec!["退款"]);
        assert_eq!(handle.stats().persisted, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_reload_keeps_last_known_good() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("chatwatch.toml");
        let monitor = Monitor::new(config(&["退款"]), Arc::new(MemoryStore::new()), engine());

        fs::write(&path, "[keywords]\nlist = [\"投诉\"]\n")?;
        monitor.reload_config(&path).await?;
        assert_eq!(monitor.handle().keywords(), vec!["投诉"]);

        fs::write(&path, "[keywords]\nfuzzy_threshold = 3.0\n")?;
        assert!(monitor.reload_config(&path).await.is_err());
        assert_eq!(monitor.handle().keywords(), vec!["投诉"]);
        Ok(())
    }
}
