//! Runtime session policy shared by the broker and the executor.
//!
//! Many sessions read it concurrently; configuration reloads and the
//! timing/cache setters write it.

use crate::config::ClientConfig;
use crate::database::system_calls::SystemCall;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

pub type SharedPolicy = Arc<RwLock<SessionPolicy>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPolicy {
    pub cache_enabled: Option<bool>,
    pub cache_ttl: Option<Duration>,
    pub force_disable_cache_for_local: bool,
    pub is_local: bool,
    pub query_timeout: Option<Duration>,
    pub timing_enabled: bool,
    /// Diagnostic rows at or below this id predate timing and are skipped.
    pub diagnostics_baseline: i64,
}

impl SessionPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        let mut policy = Self::default();
        policy.apply_config(config);
        policy
    }

    pub fn shared(self) -> SharedPolicy {
        Arc::new(RwLock::new(self))
    }

    /// Take every config-driven field from `config`, keeping the baseline.
    pub fn apply_config(&mut self, config: &ClientConfig) {
        self.cache_enabled = config.cache.enabled;
        self.cache_ttl = config.cache.ttl();
        self.force_disable_cache_for_local = config.cache.force_disable_for_local;
        self.is_local = config.database.is_local();
        self.query_timeout = config.query.timeout();
        self.timing_enabled = config.query.timing;
    }

    /// Whether asking for `enabled` switches timing on from off. Only then is
    /// a new diagnostics baseline taken.
    pub fn timing_turns_on(&self, enabled: bool) -> bool {
        enabled && !self.timing_enabled
    }

    /// System calls to issue on every acquisition.
    ///
    /// A local database with caching force-disabled always gets a disable call,
    /// whatever the client asked for.
    pub fn cache_calls(&self) -> Vec<SystemCall> {
        if self.is_local && self.force_disable_cache_for_local {
            return vec![SystemCall::CacheDisable];
        }

        let mut calls = Vec::new();
        match self.cache_enabled {
            Some(true) => calls.push(SystemCall::CacheEnable),
            Some(false) => calls.push(SystemCall::CacheDisable),
            None => {}
        }
        if let Some(ttl) = self.cache_ttl {
            calls.push(SystemCall::CacheTtl(ttl));
        }
        calls
    }
}
