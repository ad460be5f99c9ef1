pub mod postgres;

pub use postgres::{DatabaseConfig, PgStore};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::message::Message;
use crate::notify::KeywordRule;

/// Durable side of the pipeline and the source of runtime-edited keywords
/// and rules.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists a message and returns its record id.
    async fn insert(&self, message: &Message) -> Result<String>;

    /// Enabled keywords only. An empty list means "nothing configured here".
    async fn load_keywords(&self) -> Result<Vec<String>>;

    async fn load_rules(&self) -> Result<Vec<KeywordRule>>;
}

/// Process-local store used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: RwLock<Vec<Message>>,
    keywords: RwLock<Vec<String>>,
    rules: RwLock<Vec<KeywordRule>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keywords(keywords: Vec<String>) -> Self {
        Self {
            keywords: RwLock::new(keywords),
            ..Self::default()
        }
    }

    pub async fn set_keywords(&self, keywords: Vec<String>) {
        *self.keywords.write().await = keywords;
    }

    pub async fn set_rules(&self, rules: Vec<KeywordRule>) {
        *self.rules.write().await = rules;
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, message: &Message) -> Result<String> {
        self.messages.write().await.push(message.clone());
        Ok(message.id.clone())
    }

    async fn load_keywords(&self) -> Result<Vec<String>> {
        Ok(self.keywords.read().await.clone())
    }

    async fn load_rules(&self) -> Result<Vec<KeywordRule>> {
        Ok(self.rules.read().await.clone())
    }
}
