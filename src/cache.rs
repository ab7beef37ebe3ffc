//! Per-tenant search result cache for the HTTP server.
//!
//! Responses are keyed on the serialized [`SearchRequest`] and expire
//! after `retrieval.cache_ttl_secs`. Every write path of the server
//! (reindex, record upsert, entity removal) invalidates the tenant it
//! touched. Writes made by another process against the same database are
//! only seen once entries expire.
//!
//! The cache never fails a request: a poisoned lock or an unserializable
//! key just means a miss.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use knowledge_harness_core::models::TenantId;
use knowledge_harness_core::search::{SearchRequest, SearchResponse};

use crate::config::RetrievalConfig;

struct Entry {
    stored: Instant,
    response: SearchResponse,
}

type TenantEntries = HashMap<String, Entry>;

pub struct SearchCache {
    ttl: Duration,
    max_entries: usize,
    tenants: Mutex<HashMap<TenantId, TenantEntries>>,
}

impl SearchCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::new(
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_max_entries,
        )
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero() && self.max_entries > 0
    }

    fn key(req: &SearchRequest) -> Option<String> {
        serde_json::to_string(req)
            .map_err(|e| warn!(error = %e, "search request not cacheable"))
            .ok()
    }

    /// A fresh cached response, marked `from_cache`.
    pub fn get(&self, tenant: &TenantId, req: &SearchRequest) -> Option<SearchResponse> {
        if !self.is_enabled() {
            return None;
        }
        let key = Self::key(req)?;
        let mut tenants = self.tenants.lock().ok()?;
        let entries = tenants.get_mut(tenant)?;

        let fresh = entries.get(&key)?.stored.elapsed() <= self.ttl;
        if !fresh {
            entries.remove(&key);
            return None;
        }
        let mut response = entries.get(&key)?.response.clone();
        response.from_cache = true;
        debug!(tenant = %tenant, "search cache hit");
        Some(response)
    }

    /// Remember a response. Empty result lists are not cached.
    pub fn put(&self, tenant: &TenantId, req: &SearchRequest, response: &SearchResponse) {
        if !self.is_enabled() || response.results.is_empty() {
            return;
        }
        let Some(key) = Self::key(req) else {
            return;
        };
        let Ok(mut tenants) = self.tenants.lock() else {
            return;
        };
        let entries = tenants.entry(tenant.clone()).or_default();

        let ttl = self.ttl;
        entries.retain(|_, e| e.stored.elapsed() <= ttl);
        while entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.stored)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
        entries.insert(
            key,
            Entry {
                stored: Instant::now(),
                response: response.clone(),
            },
        );
    }

    /// Forget everything cached for `tenant`.
    pub fn invalidate(&self, tenant: &TenantId) {
        if let Ok(mut tenants) = self.tenants.lock() {
            if tenants.remove(tenant).is_some() {
                debug!(tenant = %tenant, "search cache invalidated");
            }
        }
    }
}
