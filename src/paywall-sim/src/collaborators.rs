//! Stand-in collaborators that log instead of rendering or charging.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use paywall_core::collaborators::{
    ContentRenderer, PurchaseExecutor, PurchaseOutcome, SubscriptionOracle,
};
use paywall_core::event_bus::{EventSink, PaywallEvent};
use paywall_core::types::{PaywallDefinition, PaywallIdentity, PresentationStyle, RenderedUnit};
use paywall_core::PaywallResult;
use tracing::info;
use uuid::Uuid;

pub struct LoggingRenderer {
    pub build_delay: Duration,
}

#[async_trait]
impl ContentRenderer for LoggingRenderer {
    async fn build(
        &self,
        identity: &PaywallIdentity,
        definition: &PaywallDefinition,
    ) -> PaywallResult<RenderedUnit> {
        info!(identity = %identity, url = %definition.url, "Building paywall surface");
        tokio::time::sleep(self.build_delay).await;
        Ok(RenderedUnit {
            id: Uuid::new_v4(),
            identity: identity.clone(),
            content_hash: definition.content_hash(),
            built_at: Utc::now(),
        })
    }

    async fn show(&self, unit: &RenderedUnit, style: PresentationStyle) -> PaywallResult<()> {
        info!(identity = %unit.identity, style = ?style, "Showing paywall");
        Ok(())
    }

    async fn hide(&self, unit: &RenderedUnit) {
        info!(identity = %unit.identity, "Hiding paywall");
    }

    async fn teardown(&self, unit: &RenderedUnit) {
        info!(identity = %unit.identity, "Tearing down paywall surface");
    }
}

pub struct FixedSubscription(pub bool);

#[async_trait]
impl SubscriptionOracle for FixedSubscription {
    async fn is_subscribed(&self) -> bool {
        self.0
    }
}

/// Approves every purchase; restores succeed when `restorable` is set.
pub struct ApprovingStore {
    pub restorable: bool,
}

#[async_trait]
impl PurchaseExecutor for ApprovingStore {
    async fn purchase(&self, product_id: &str) -> PurchaseOutcome {
        info!(product_id = %product_id, "Purchase approved");
        PurchaseOutcome::Purchased
    }

    async fn restore(&self) -> bool {
        self.restorable
    }
}

/// Writes telemetry to the log.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PaywallEvent) {
        info!(
            kind = ?event.kind,
            paywall_id = event.paywall_id.as_deref().unwrap_or("-"),
            experiment_id = event.experiment_id.as_deref().unwrap_or("-"),
            detail = event.detail.as_deref().unwrap_or(""),
            "Telemetry"
        );
    }
}
