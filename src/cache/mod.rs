//! # Cache Module
//!
//! Memoises free-text search lookups so repeated `play` requests for the same
//! term skip the search round-trip to the extractor.
//!
//! ## Features
//!
//! - **LRU Eviction**: removes the least recently used term beyond capacity
//! - **TTL Support**: entries expire so stale search rankings are refreshed
//! - **Thread Safety**: concurrent access from every chat's resolution task
//!
//! Only successful searches are cached; failures always go back to the service.
//!
//! ## Configuration
//!
//! ```env
//! SEARCH_CACHE_SIZE=256   # Maximum number of cached terms
//! SEARCH_CACHE_TTL=1h     # Time-to-live (humantime format)
//! ```

pub mod lru_cache;

use lru_cache::LRUCache;
use std::time::Duration;
use tracing::{debug, info};

use crate::sources::Reference;

/// Cache de búsquedas: término normalizado → mejor referencia
pub type SearchCache = LRUCache<String, Reference>;

impl SearchCache {
    pub fn for_searches(capacity: usize, ttl: Duration) -> Self {
        Self::with_ttl(capacity, Some(ttl))
    }

    /// Normaliza el término para que mayúsculas y espacios no generen entradas distintas
    pub fn normalize(term: &str) -> String {
        term.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }

        let metrics = self.metrics();
        debug!(
            "📊 Cache de búsquedas: {}/{} entradas, {:.1}% aciertos, {} expulsiones",
            self.len(),
            self.capacity(),
            metrics.hit_rate() * 100.0,
            metrics.evictions
        );
    }
}
