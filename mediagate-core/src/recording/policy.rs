use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::{
    config::RetentionPolicy,
    error::{GatewayError, Result},
    frame::StreamKey,
};

/// Retention policies per stream, falling back to the configured default.
pub struct PolicyStore {
    default: RwLock<RetentionPolicy>,
    overrides: DashMap<StreamKey, RetentionPolicy>,
}

impl PolicyStore {
    #[must_use]
    pub fn new(default: RetentionPolicy) -> Self {
        Self {
            default: RwLock::new(default),
            overrides: DashMap::new(),
        }
    }

    /// Seeds overrides from configuration keyed by `app/stream`.
    pub fn with_overrides(default: RetentionPolicy, overrides: &HashMap<String, RetentionPolicy>) -> Result<Self> {
        let store = Self::new(default);
        for (key, policy) in overrides {
            store.set(&key.parse()?, *policy)?;
        }
        Ok(store)
    }

    #[must_use]
    pub fn get(&self, key: &StreamKey) -> RetentionPolicy {
        self.overrides
            .get(key)
            .map_or_else(|| *self.default.read(), |p| *p.value())
    }

    pub fn set(&self, key: &StreamKey, policy: RetentionPolicy) -> Result<()> {
        policy.validate().map_err(GatewayError::InvalidInput)?;
        self.overrides.insert(key.clone(), policy);
        Ok(())
    }

    pub fn remove(&self, key: &StreamKey) -> bool {
        self.overrides.remove(key).is_some()
    }

    #[must_use]
    pub fn default_policy(&self) -> RetentionPolicy {
        *self.default.read()
    }

    #[must_use]
    pub fn overrides(&self) -> Vec<(StreamKey, RetentionPolicy)> {
        let mut all: Vec<_> = self.overrides.iter().map(|e| (e.key().clone(), *e.value())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
