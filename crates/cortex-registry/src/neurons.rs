//! The neuron registry: per-user LM resolution with tier gating and a
//! bounded config cache. Handles themselves are never cached; every call
//! builds a fresh instance so keys and permissions cannot leak across users.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use cortex_core::error::{CortexError, Result};
use cortex_core::model::NeuronConfig;
use cortex_core::traits::{ConfigStore, LmHandle, NeuronSource};
use cortex_core::types::{UserSettings, LOWEST_TIER, SYSTEM_OWNER};

use crate::cache::TtlCache;

const CONFIG_CACHE_CAPACITY: usize = 100;
const CONFIG_CACHE_TTL: Duration = Duration::from_secs(300);

pub struct NeuronRegistry {
    store: Arc<dyn ConfigStore>,
    configs: std::sync::Mutex<TtlCache<(String, String), NeuronConfig>>,
}

impl NeuronRegistry {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            configs: std::sync::Mutex::new(TtlCache::new(
                CONFIG_CACHE_CAPACITY,
                CONFIG_CACHE_TTL,
            )),
        }
    }

    /// Resolve a neuron config for a user, enforcing ownership and tier.
    pub async fn get_config(&self, neuron_id: &str, user_id: &str) -> Result<NeuronConfig> {
        let key = (user_id.to_string(), neuron_id.to_string());
        if let Some(config) = self.configs.lock().unwrap().get(&key) {
            return Ok(config);
        }

        let record = self
            .store
            .find_neuron(neuron_id)
            .await?
            .filter(|n| n.owner_id == user_id || n.owner_id == SYSTEM_OWNER)
            .ok_or_else(|| CortexError::NeuronNotFound(neuron_id.to_string()))?;

        if record.owner_id == SYSTEM_OWNER {
            let user_tier = self.user_tier(user_id).await;
            if user_tier > record.tier {
                return Err(CortexError::AccessDenied {
                    resource: format!("neuron '{}'", neuron_id),
                    user_id: user_id.to_string(),
                });
            }
        }

        let config = resolve_api_key(record)?;
        self.configs.lock().unwrap().insert(key, config.clone());
        debug!(neuron_id, user_id, "Neuron config resolved");
        Ok(config)
    }

    /// Build a fresh LM handle for a neuron.
    pub async fn get_model(&self, neuron_id: &str, user_id: &str) -> Result<Box<dyn LmHandle>> {
        let config = self.get_config(neuron_id, user_id).await?;
        Ok(cortex_llm::build_handle(&config, config.api_key.clone()))
    }

    /// Drop cached configs, for one user or everyone.
    pub fn clear_cache(&self, user_id: Option<&str>) {
        let mut cache = self.configs.lock().unwrap();
        match user_id {
            Some(user) => cache.retain(|(cached_user, _)| cached_user != user),
            None => cache.clear(),
        }
    }

    async fn user_tier(&self, user_id: &str) -> u8 {
        match self.store.user_settings(user_id).await {
            Ok(Some(UserSettings { account_tier, .. })) => account_tier,
            Ok(None) => LOWEST_TIER,
            Err(e) => {
                warn!(user_id, error = %e, "User settings lookup failed, assuming lowest tier");
                LOWEST_TIER
            }
        }
    }
}

/// A key marked encrypted names a process environment variable; the actual
/// secret never sits in the store.
fn resolve_api_key(mut config: NeuronConfig) -> Result<NeuronConfig> {
    if config.api_key_encrypted {
        let var = config.api_key.take().ok_or_else(|| {
            CortexError::Config(format!(
                "neuron '{}' marks its key encrypted but stores none",
                config.neuron_id
            ))
        })?;
        let key = std::env::var(&var).map_err(|_| {
            CortexError::Config(format!(
                "neuron '{}' key variable '{}' is not set",
                config.neuron_id, var
            ))
        })?;
        config.api_key = Some(key);
        config.api_key_encrypted = false;
    }
    Ok(config)
}

impl NeuronSource for NeuronRegistry {
    fn model(&self, neuron_id: &str, user_id: &str) -> BoxFuture<'_, Result<Box<dyn LmHandle>>> {
        let neuron_id = neuron_id.to_string();
        let user_id = user_id.to_string();
        Box::pin(async move { self.get_model(&neuron_id, &user_id).await })
    }

    fn neuron_config(
        &self,
        neuron_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, Result<NeuronConfig>> {
        let neuron_id = neuron_id.to_string();
        let user_id = user_id.to_string();
        Box::pin(async move { self.get_config(&neuron_id, &user_id).await })
    }
}
