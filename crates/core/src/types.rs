use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

/// Flat event parameters or user traits. Values are JSON scalars.
pub type Parameters = BTreeMap<String, serde_json::Value>;

/// An application event submitted through `track`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub parameters: Parameters,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            name: name.into(),
            parameters,
            timestamp: Utc::now(),
        }
    }

    /// Drops parameters whose key carries the reserved prefix and any value
    /// that is not a scalar (arrays and objects).
    pub fn sanitized(mut self, reserved_prefix: &str) -> Self {
        self.parameters.retain(|key, value| {
            let reserved = !reserved_prefix.is_empty() && key.starts_with(reserved_prefix);
            !reserved && !value.is_array() && !value.is_object()
        });
        self
    }
}

/// The user an evaluation runs for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default)]
    pub traits: Parameters,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            traits: Parameters::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(format!("$anon:{}", Uuid::new_v4()))
    }
}

// ------------------------------------------------------------------
// Campaign configuration
// ------------------------------------------------------------------

/// Snapshot of all triggers and paywalls served to this device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignConfig {
    #[serde(default)]
    pub triggers: HashMap<String, Trigger>,
    #[serde(default)]
    pub paywalls: HashMap<String, PaywallDefinition>,
}

impl CampaignConfig {
    pub fn trigger(&self, event_name: &str) -> Option<&Trigger> {
        self.triggers.get(event_name)
    }

    pub fn paywall(&self, paywall_id: &str) -> Option<&PaywallDefinition> {
        self.paywalls.get(paywall_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub event_name: String,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    /// No expression means the rule always matches.
    #[serde(default)]
    pub expression: Option<RuleExpression>,
    pub experiment: Experiment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleExpression {
    pub operator: LogicalOperator,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub source: ConditionSource,
    pub key: String,
    pub comparison: Comparison,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSource {
    Param,
    Trait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    StartsWith,
    EndsWith,
    IsSet,
    IsNotSet,
    InList,
    NotInList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub group_id: String,
    pub variants: Vec<Variant>,
}

impl Experiment {
    /// Content hash of the experiment definition. Sticky assignments are only
    /// honoured while this value is unchanged.
    pub fn version_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update([0]);
        hasher.update(self.group_id.as_bytes());
        for variant in &self.variants {
            hasher.update([0]);
            hasher.update(variant.id.as_bytes());
            hasher.update(variant.weight.to_bits().to_le_bytes());
            match &variant.kind {
                VariantKind::Paywall { paywall_id } => {
                    hasher.update(b"paywall:");
                    hasher.update(paywall_id.as_bytes());
                }
                VariantKind::Holdout => hasher.update(b"holdout"),
            }
        }
        hex::encode(hasher.finalize())
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub weight: f64,
    pub kind: VariantKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VariantKind {
    Paywall { paywall_id: String },
    Holdout,
}

/// Persisted sticky assignment for one (user, experiment) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAssignment {
    pub variant_id: String,
    pub version_hash: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationStyle {
    #[default]
    Modal,
    Fullscreen,
    Push,
    Drawer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaywallDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub presentation_style: PresentationStyle,
}

impl PaywallDefinition {
    /// Hash over everything that affects the prepared content.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update([0]);
        hasher.update(self.url.as_bytes());
        for product in &self.products {
            hasher.update([0]);
            hasher.update(product.as_bytes());
        }
        hasher.update(format!("{:?}", self.presentation_style).as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Cache key: the same paywall under two locales is two entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaywallIdentity {
    pub identifier: String,
    pub locale: String,
}

impl PaywallIdentity {
    pub fn new(identifier: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            locale: locale.into(),
        }
    }
}

impl fmt::Display for PaywallIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identifier, self.locale)
    }
}

/// Surface produced by the rendering backend for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedUnit {
    pub id: Uuid,
    pub identity: PaywallIdentity,
    pub content_hash: String,
    pub built_at: DateTime<Utc>,
}

// ------------------------------------------------------------------
// Outcomes
// ------------------------------------------------------------------

/// The experiment (and the variant it resolved to) behind an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRef {
    pub id: String,
    pub group_id: String,
    pub variant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    TriggerNotFound,
    NoMatch,
    Holdout { experiment: ExperimentRef },
    Paywall {
        experiment: ExperimentRef,
        paywall_id: String,
    },
    Error { reason: String },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::TriggerNotFound => "trigger_not_found",
            Outcome::NoMatch => "no_rule_match",
            Outcome::Holdout { .. } => "holdout",
            Outcome::Paywall { .. } => "paywall",
            Outcome::Error { .. } => "error",
        }
    }
}

/// Why a request terminated without a paywall being shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Holdout { experiment: ExperimentRef },
    NoRuleMatch,
    TriggerNotFound,
    UserIsSubscribed,
    /// Another presentation occupies the slot.
    Busy,
    /// Dismissed before anything was shown.
    Cancelled,
    Error { message: String },
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::Holdout { .. } => "holdout",
            SkipReason::NoRuleMatch => "no_rule_match",
            SkipReason::TriggerNotFound => "trigger_not_found",
            SkipReason::UserIsSubscribed => "user_is_subscribed",
            SkipReason::Busy => "busy",
            SkipReason::Cancelled => "cancelled",
            SkipReason::Error { .. } => "error",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Holdout { experiment } => write!(f, "holdout({})", experiment.id),
            SkipReason::Error { message } => write!(f, "error({message})"),
            other => f.write_str(other.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DismissalResult {
    Closed,
    Purchased { product_id: String },
    Restored,
}

/// Describes a shown paywall to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaywallInfo {
    pub request_id: Uuid,
    pub paywall_id: String,
    pub locale: String,
    pub event_name: String,
    pub experiment: ExperimentRef,
    pub presentation_style: PresentationStyle,
    pub products: Vec<String>,
    pub presented_at: DateTime<Utc>,
}

/// Events delivered on a `ResultChannel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PresentationEvent {
    Presented { info: PaywallInfo },
    Dismissed {
        info: PaywallInfo,
        result: DismissalResult,
    },
    Skipped { reason: SkipReason },
}

impl PresentationEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PresentationEvent::Presented { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn experiment() -> Experiment {
        Experiment {
            id: "exp_1".into(),
            group_id: "grp_1".into(),
            variants: vec![
                Variant {
                    id: "a".into(),
                    weight: 0.5,
                    kind: VariantKind::Paywall {
                        paywall_id: "pw_123".into(),
                    },
                },
                Variant {
                    id: "b".into(),
                    weight: 0.5,
                    kind: VariantKind::Holdout,
                },
            ],
        }
    }

    #[test]
    fn test_sanitize_drops_reserved_and_nested() {
        let mut params = Parameters::new();
        params.insert("$source".into(), json!("sdk"));
        params.insert("plan".into(), json!("pro"));
        params.insert("count".into(), json!(3));
        params.insert("tags".into(), json!(["a", "b"]));
        params.insert("meta".into(), json!({"k": "v"}));

        let event = Event::new("MyEvent", params).sanitized("$");
        let keys: Vec<&str> = event.parameters.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["count", "plan"]);
    }

    #[test]
    fn test_version_hash_tracks_definition() {
        let original = experiment();
        assert_eq!(original.version_hash(), experiment().version_hash());

        let mut reweighted = experiment();
        reweighted.variants[0].weight = 0.9;
        assert_ne!(original.version_hash(), reweighted.version_hash());
    }

    #[test]
    fn test_identity_distinguishes_locale() {
        let en = PaywallIdentity::new("pw_123", "en_US");
        let fr = PaywallIdentity::new("pw_123", "fr_FR");
        assert_ne!(en, fr);
        assert_eq!(en.to_string(), "pw_123@en_US");
    }

    #[test]
    fn test_campaign_config_deserializes() {
        let config: CampaignConfig = serde_json::from_value(json!({
            "triggers": {
                "MyEvent": {
                    "event_name": "MyEvent",
                    "rules": [{
                        "id": "rule_1",
                        "experiment": {
                            "id": "exp_1",
                            "group_id": "grp_1",
                            "variants": [
                                {"id": "a", "weight": 1.0, "kind": {"type": "paywall", "paywall_id": "pw_123"}}
                            ]
                        }
                    }]
                }
            },
            "paywalls": {
                "pw_123": {"id": "pw_123", "url": "https://paywalls.example/pw_123"}
            }
        }))
        .expect("valid campaign config");

        let trigger = config.trigger("MyEvent").expect("trigger present");
        assert!(trigger.rules[0].expression.is_none());
        let paywall = config.paywall("pw_123").expect("paywall present");
        assert_eq!(paywall.presentation_style, PresentationStyle::Modal);
    }

    #[test]
    fn test_skip_reason_display() {
        let reason = SkipReason::Holdout {
            experiment: ExperimentRef {
                id: "exp_1".into(),
                group_id: "grp_1".into(),
                variant_id: "b".into(),
            },
        };
        assert_eq!(reason.to_string(), "holdout(exp_1)");
        assert_eq!(SkipReason::TriggerNotFound.to_string(), "trigger_not_found");
    }
}
