use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::env;

use super::MessageStore;
use crate::error::{MonitorError, Result};
use crate::message::Message;
use crate::notify::{KeywordRule, Priority};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY,
    platform TEXT NOT NULL,
    source_name TEXT NOT NULL,
    channel TEXT NOT NULL,
    sender TEXT,
    sender_id TEXT,
    content TEXT NOT NULL,
    message_type TEXT NOT NULL DEFAULT 'text',
    matched_keywords TEXT[] NOT NULL DEFAULT '{}',
    observed_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_observed_at ON chat_messages (observed_at);
CREATE TABLE IF NOT EXISTS keywords (
    id SERIAL PRIMARY KEY,
    keyword TEXT NOT NULL UNIQUE,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE TABLE IF NOT EXISTS notification_rules (
    name TEXT PRIMARY KEY,
    keywords TEXT[] NOT NULL,
    channels TEXT[] NOT NULL,
    priority TEXT NOT NULL DEFAULT 'NORMAL',
    cooldown_seconds BIGINT NOT NULL DEFAULT 300 CHECK (cooldown_seconds >= 0),
    enabled BOOLEAN NOT NULL DEFAULT TRUE
)
"#;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "chatwatch".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("DB_HOST").unwrap_or(defaults.host),
            port: env::var("DB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            database: env::var("DB_NAME").unwrap_or(defaults.database),
            username: env::var("DB_USER").unwrap_or(defaults.username),
            password: env::var("DB_PASSWORD").unwrap_or(defaults.password),
        }
    }

    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    name: String,
    keywords: Vec<String>,
    channels: Vec<String>,
    priority: String,
    cooldown_seconds: i64,
    enabled: bool,
}

impl RuleRow {
    fn into_rule(self) -> Result<KeywordRule> {
        if self.cooldown_seconds < 0 {
            return Err(MonitorError::invalid(format!(
                "rule '{}' has negative cooldown",
                self.name
            )));
        }
        let priority: Priority = self.priority.parse().map_err(MonitorError::invalid)?;
        Ok(KeywordRule {
            name: self.name,
            keywords: self.keywords,
            channels: self.channels,
            priority,
            cooldown_seconds: self.cooldown_seconds as u64,
            enabled: self.enabled,
        })
    }
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPool::connect(&config.connection_string()).await?;
        info!(
            "Connected to PostgreSQL at {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(Self { pool })
    }

    pub async fn initialize_schema(&self) -> Result<()> {
        info!("🔧 Initializing database schema...");

        let statements: Vec<&str> = SCHEMA
            .split(';')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();

        for statement in statements {
            debug!("Executing SQL: {}", statement);
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| MonitorError::Store(format!("schema statement failed: {}", e)))?;
        }

        info!("✅ Database schema ready");
        Ok(())
    }

    pub async fn test_connection(&self) -> Result<bool> {
        let row = sqlx::query("SELECT 1 as test").fetch_one(&self.pool).await?;
        let test_value: i32 = row.get("test");
        Ok(test_value == 1)
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn insert(&self, message: &Message) -> Result<String> {
        sqlx::query(
            r#"
            INSERT INTO chat_messages (
                id, platform, source_name, channel, sender, sender_id,
                content, message_type, matched_keywords, observed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(message.source_platform.as_str())
        .bind(&message.source_name)
        .bind(&message.channel)
        .bind(&message.sender)
        .bind(&message.sender_id)
        .bind(&message.content)
        .bind(&message.message_type)
        .bind(&message.matched_keywords)
        .bind(message.observed_at)
        .execute(&self.pool)
        .await?;

        Ok(message.id.clone())
    }

    async fn load_keywords(&self) -> Result<Vec<String>> {
        let keywords = sqlx::query_scalar::<_, String>(
            "SELECT keyword FROM keywords WHERE enabled = true ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(keywords)
    }

    async fn load_rules(&self) -> Result<Vec<KeywordRule>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            "SELECT name, keywords, channels, priority, cooldown_seconds, enabled \
             FROM notification_rules ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row.name.clone();
            match row.into_rule() {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!("Skipping stored rule '{}': {}", name, e),
            }
        }
        Ok(rules)
    }
}
