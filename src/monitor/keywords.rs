use log::{info, warn};
use serde::Serialize;

use crate::store::MessageStore;

/// Where the active keyword set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordOrigin {
    Store,
    Config,
}

/// Store keywords win over the configured defaults. An empty store, or one
/// that cannot be read, falls back to the defaults.
pub async fn resolve_keywords(
    store: &dyn MessageStore,
    defaults: &[String],
) -> (Vec<String>, KeywordOrigin) {
    match store.load_keywords().await {
        Ok(keywords) if !keywords.is_empty() => {
            info!("Using {} keywords from store", keywords.len());
            (keywords, KeywordOrigin::Store)
        }
        Ok(_) => {
            info!(
                "Keyword store is empty, falling back to {} keywords from config",
                defaults.len()
            );
            (defaults.to_vec(), KeywordOrigin::Config)
        }
        Err(e) => {
            warn!(
                "Failed to load keywords from store ({}), falling back to {} keywords from config",
                e,
                defaults.len()
            );
            (defaults.to_vec(), KeywordOrigin::Config)
        }
    }
}
