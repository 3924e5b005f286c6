use paywall_core::types::PresentationStyle;
use serde::{Deserialize, Serialize};

/// Per-request adjustments. Applied to the presentation only; the cached
/// unit is never modified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaywallOverrides {
    /// Replaces the paywall's product list for this presentation.
    #[serde(default)]
    pub products: Option<Vec<String>>,
    #[serde(default)]
    pub presentation_style: Option<PresentationStyle>,
    /// Present even if the user already has an active subscription.
    #[serde(default)]
    pub ignore_subscription_status: bool,
    /// Locale to build the paywall for. Falls back to the configured default.
    #[serde(default)]
    pub locale: Option<String>,
}

/// Messages reported by the rendered paywall while it is on screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_name", rename_all = "snake_case")]
pub enum PaywallAction {
    ContentLoadStarted,
    ContentLoaded,
    /// The user tapped the refresh affordance.
    Refresh,
    Close,
    /// The user tapped the exit affordance after a load timeout.
    Exit,
    DeepLink {
        url: String,
    },
    Purchase {
        product_id: String,
    },
    Restore,
}

impl PaywallAction {
    pub fn name(&self) -> &'static str {
        match self {
            PaywallAction::ContentLoadStarted => "content_load_started",
            PaywallAction::ContentLoaded => "content_loaded",
            PaywallAction::Refresh => "refresh",
            PaywallAction::Close => "close",
            PaywallAction::Exit => "exit",
            PaywallAction::DeepLink { .. } => "deep_link",
            PaywallAction::Purchase { .. } => "purchase",
            PaywallAction::Restore => "restore",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_messages_decode() {
        let action: PaywallAction =
            serde_json::from_value(json!({"event_name": "purchase", "product_id": "monthly"}))
                .unwrap();
        assert_eq!(
            action,
            PaywallAction::Purchase {
                product_id: "monthly".into()
            }
        );

        let action: PaywallAction =
            serde_json::from_value(json!({"event_name": "content_loaded"})).unwrap();
        assert_eq!(action.name(), "content_loaded");

        assert!(serde_json::from_value::<PaywallAction>(json!({"event_name": "unknown"})).is_err());
    }

    #[test]
    fn test_overrides_default_to_none() {
        let overrides: PaywallOverrides = serde_json::from_value(json!({"locale": "de_DE"})).unwrap();
        assert_eq!(overrides.locale.as_deref(), Some("de_DE"));
        assert!(overrides.products.is_none());
        assert!(!overrides.ignore_subscription_status);
    }
}
