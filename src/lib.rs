pub mod config;
pub mod dedup;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod message;
pub mod monitor;
pub mod notify;
pub mod source;
pub mod store;

pub use config::MonitorConfig;
pub use dedup::{Deduplicator, Fingerprint};
pub use error::{MonitorError, Result};
pub use filter::{KeywordFilter, MatchMode};
pub use message::{Message, Platform, RawMessage};
pub use monitor::{Monitor, MonitorHandle, SourceHealth};
pub use notify::{KeywordRule, Priority, RuleEngine};
pub use source::Source;
pub use store::{MemoryStore, MessageStore, PgStore};
