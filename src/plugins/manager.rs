use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::parsers::{SelectorParser, SelectorProfile};
use super::traits::CategoryParser;
use crate::utils::error::AppError;

pub type CategoryParserRef = Arc<dyn CategoryParser>;

/// Store identifier -> parser. Keys are lowercase.
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: Arc<RwLock<HashMap<String, CategoryParserRef>>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            parsers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Builds a registry holding one `SelectorParser` per configured profile.
    pub async fn from_profiles(profiles: &[SelectorProfile]) -> Result<Self, AppError> {
        let registry = Self::new();
        for profile in profiles {
            registry.register_parser(Arc::new(SelectorParser::new(profile)?)).await;
        }
        Ok(registry)
    }

    /// Register a parser, replacing any previous one for the same store.
    pub async fn register_parser(&self, parser: CategoryParserRef) {
        let store = parser.store().to_lowercase();
        let mut parsers = self.parsers.write().await;
        if parsers.insert(store.clone(), parser).is_some() {
            tracing::warn!("Replaced existing parser for store {}", store);
        }
    }

    pub async fn get(&self, store: &str) -> Option<CategoryParserRef> {
        let parsers = self.parsers.read().await;
        parsers.get(&store.to_lowercase()).cloned()
    }

    pub async fn has_parser(&self, store: &str) -> bool {
        let parsers = self.parsers.read().await;
        parsers.contains_key(&store.to_lowercase())
    }

    pub async fn list_stores(&self) -> Vec<String> {
        let parsers = self.parsers.read().await;
        let mut stores: Vec<_> = parsers.keys().cloned().collect();
        stores.sort();
        stores
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}
