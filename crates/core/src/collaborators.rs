//! Interfaces of the systems the presentation pipeline depends on but does
//! not implement: config delivery, rendering, subscriptions, purchases and
//! assignment persistence.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::PaywallResult;
use crate::types::{
    CampaignConfig, PaywallDefinition, PaywallIdentity, PresentationStyle, RenderedUnit,
    StoredAssignment,
};

pub type ConfigChangeHandler = Box<dyn Fn(&Arc<CampaignConfig>) + Send + Sync>;

/// Read-only source of the current campaign configuration.
pub trait ConfigStore: Send + Sync {
    fn current_config(&self) -> Arc<CampaignConfig>;
    fn on_config_changed(&self, handler: ConfigChangeHandler);
}

/// Rendering backend for paywall surfaces.
#[async_trait]
pub trait ContentRenderer: Send + Sync {
    /// Prepare a surface for `identity`. May take a while (content fetch).
    async fn build(
        &self,
        identity: &PaywallIdentity,
        definition: &PaywallDefinition,
    ) -> PaywallResult<RenderedUnit>;

    /// Make a prepared surface visible.
    async fn show(&self, unit: &RenderedUnit, style: PresentationStyle) -> PaywallResult<()>;

    /// Take the surface off screen and detach its observers. The surface
    /// stays prepared for reuse.
    async fn hide(&self, unit: &RenderedUnit);

    /// Release everything held for the surface.
    async fn teardown(&self, unit: &RenderedUnit);
}

#[async_trait]
pub trait SubscriptionOracle: Send + Sync {
    async fn is_subscribed(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseOutcome {
    Purchased,
    Cancelled,
    /// Awaiting external approval (e.g. parental consent).
    Pending,
    Failed(String),
}

#[async_trait]
pub trait PurchaseExecutor: Send + Sync {
    async fn purchase(&self, product_id: &str) -> PurchaseOutcome;
    async fn restore(&self) -> bool;
}

/// Durable storage for sticky experiment assignments.
pub trait AssignmentStore: Send + Sync {
    fn get(&self, user_id: &str, experiment_id: &str) -> PaywallResult<Option<StoredAssignment>>;
    fn put(
        &self,
        user_id: &str,
        experiment_id: &str,
        assignment: StoredAssignment,
    ) -> PaywallResult<()>;
}

/// Config store holding the snapshot in memory. `replace` swaps the snapshot
/// atomically and then notifies subscribers.
#[derive(Default)]
pub struct InMemoryConfigStore {
    current: RwLock<Arc<CampaignConfig>>,
    handlers: RwLock<Vec<ConfigChangeHandler>>,
}

impl InMemoryConfigStore {
    pub fn new(config: CampaignConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn replace(&self, config: CampaignConfig) {
        let config = Arc::new(config);
        *self.current.write() = config.clone();
        let handlers = self.handlers.read();
        debug!(subscribers = handlers.len(), "Campaign config replaced");
        for handler in handlers.iter() {
            handler(&config);
        }
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn current_config(&self) -> Arc<CampaignConfig> {
        self.current.read().clone()
    }

    fn on_config_changed(&self, handler: ConfigChangeHandler) {
        self.handlers.write().push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_replace_notifies_subscribers() {
        let store = InMemoryConfigStore::new(CampaignConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        store.on_config_changed(Box::new(move |config: &Arc<CampaignConfig>| {
            assert!(config.paywall("pw_1").is_some());
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let mut next = CampaignConfig::default();
        next.paywalls.insert(
            "pw_1".into(),
            PaywallDefinition {
                id: "pw_1".into(),
                name: String::new(),
                url: "https://paywalls.example/pw_1".into(),
                products: vec![],
                presentation_style: PresentationStyle::Modal,
            },
        );
        store.replace(next);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.current_config().paywall("pw_1").is_some());
    }
}
