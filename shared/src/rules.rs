//! Hostname allow-list with hot-swap updates.
//!
//! The active table is an immutable map behind an atomic pointer: a
//! lookup takes one snapshot and works against it for its whole
//! duration, an update publishes a freshly built map with a single
//! store, so a reader can never observe a partially built or torn
//! table. Positive lookups are cached; the cache is flushed whenever a
//! new table is published.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

pub type BoolMap = HashMap<String, bool>;

pub struct RuleSet {
    table: ArcSwap<BoolMap>,
    update_lock: Mutex<()>,
    cache: DashMap<String, bool>,
    passthrough: bool,
}

impl RuleSet {
    pub fn new(passthrough: bool) -> Self {
        Self {
            table: ArcSwap::from_pointee(BoolMap::new()),
            update_lock: Mutex::new(()),
            cache: DashMap::new(),
            passthrough,
        }
    }

    /// Whether traffic to `host` may be forwarded. In passthrough mode
    /// every host is admitted.
    pub fn is_host_allowed(&self, host: &str) -> bool {
        self.passthrough || self.is_host_allowed_by_rule(host)
    }

    /// Look `host` up against the active table: exact match first, then
    /// each suffix starting at a label boundary. Matching is
    /// case-insensitive and ignores leading/trailing dots. Table hits are
    /// cached under the full query host; misses are not cached.
    pub fn is_host_allowed_by_rule(&self, host: &str) -> bool {
        let normalized = host.to_lowercase();
        let host = normalized.trim_matches('.');
        if let Some(cached) = self.cache.get(host) {
            return *cached;
        }

        // One snapshot for the whole lookup.
        let table = self.table.load();
        if let Some(&allowed) = table.get(host) {
            self.cache.insert(host.to_string(), allowed);
            return allowed;
        }
        for (dot, _) in host.match_indices('.') {
            if let Some(&allowed) = table.get(&host[dot + 1..]) {
                self.cache.insert(host.to_string(), allowed);
                return allowed;
            }
        }
        false
    }

    /// Install a new table. The atomic store is the point where the
    /// update becomes visible; in-flight lookups keep the snapshot they
    /// already hold. Afterwards the lookup cache is dropped so no entry
    /// predates the new table.
    pub async fn set_rules(&self, rules: BoolMap) {
        let _guard = self.update_lock.lock().await;
        self.table.store(Arc::new(rules));
        self.cache.clear();
        debug!("rule table swapped");
    }

    /// The active table serialized as indented JSON `{host: ""}`.
    pub fn to_json(&self) -> String {
        let table = self.table.load();
        let hosts: BTreeMap<&str, &str> = table.keys().map(|k| (k.as_str(), "")).collect();
        // Serializing a string map cannot fail.
        serde_json::to_string_pretty(&hosts).unwrap_or_default()
    }

    /// Replace the table from JSON of the form `{host: ""}` (values are
    /// ignored, keys are lowercased).
    pub async fn put_json(&self, data: &[u8]) -> Result<(), serde_json::Error> {
        let hosts: HashMap<String, String> = serde_json::from_slice(data)?;
        let mut rules = BoolMap::with_capacity(hosts.len());
        for host in hosts.into_keys() {
            rules.insert(host.to_lowercase(), true);
        }
        self.set_rules(rules).await;
        Ok(())
    }
}
