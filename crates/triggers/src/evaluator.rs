use std::sync::Arc;

use paywall_core::types::{
    CampaignConfig, Event, ExperimentRef, Outcome, Rule, UserContext, VariantKind,
};
use tracing::{debug, info, warn};

use crate::assigner::ExperimentAssigner;
use crate::predicates::evaluate_expression;

/// Maps a tracked event to an experiment outcome.
///
/// For an unchanged config and unchanged sticky assignments the result only
/// depends on the event and the user's traits.
#[derive(Clone)]
pub struct TriggerEvaluator {
    assigner: Arc<ExperimentAssigner>,
}

impl TriggerEvaluator {
    pub fn new(assigner: Arc<ExperimentAssigner>) -> Self {
        Self { assigner }
    }

    /// `event` is expected to be sanitized already.
    pub fn evaluate(&self, event: &Event, config: &CampaignConfig, user: &UserContext) -> Outcome {
        let Some(trigger) = config.trigger(&event.name) else {
            debug!(event = %event.name, "No trigger for event");
            return Outcome::TriggerNotFound;
        };

        for rule in &trigger.rules {
            let matched = match &rule.expression {
                None => Ok(true),
                Some(expression) => evaluate_expression(expression, event, user),
            };

            match matched {
                Ok(true) => return self.resolve(rule, config, user),
                Ok(false) => continue,
                Err(e) => {
                    warn!(event = %event.name, rule_id = %rule.id, error = %e, "Malformed rule");
                    return Outcome::Error {
                        reason: e.to_string(),
                    };
                }
            }
        }

        debug!(event = %event.name, rules = trigger.rules.len(), "No rule matched");
        Outcome::NoMatch
    }

    fn resolve(&self, rule: &Rule, config: &CampaignConfig, user: &UserContext) -> Outcome {
        let experiment = &rule.experiment;
        let variant = match self.assigner.assign(&user.user_id, experiment) {
            Ok(variant) => variant,
            Err(e) => {
                warn!(rule_id = %rule.id, experiment_id = %experiment.id, error = %e, "Assignment failed");
                return Outcome::Error {
                    reason: e.to_string(),
                };
            }
        };

        let reference = ExperimentRef {
            id: experiment.id.clone(),
            group_id: experiment.group_id.clone(),
            variant_id: variant.id.clone(),
        };

        match variant.kind {
            VariantKind::Holdout => {
                info!(experiment_id = %experiment.id, variant_id = %variant.id, "User is in holdout");
                Outcome::Holdout {
                    experiment: reference,
                }
            }
            VariantKind::Paywall { paywall_id } => {
                if config.paywall(&paywall_id).is_none() {
                    warn!(experiment_id = %experiment.id, paywall_id = %paywall_id, "Variant references unknown paywall");
                    return Outcome::Error {
                        reason: format!("paywall {paywall_id} is not in the campaign config"),
                    };
                }
                info!(experiment_id = %experiment.id, paywall_id = %paywall_id, "Rule resolved to paywall");
                Outcome::Paywall {
                    experiment: reference,
                    paywall_id,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryAssignmentStore;
    use paywall_core::types::{
        Comparison, Condition, ConditionSource, Experiment, LogicalOperator, Parameters,
        PaywallDefinition, PresentationStyle, RuleExpression, Trigger, Variant,
    };
    use serde_json::json;

    fn paywall_experiment(id: &str, paywall_id: &str) -> Experiment {
        Experiment {
            id: id.into(),
            group_id: format!("grp_{id}"),
            variants: vec![Variant {
                id: "treatment".into(),
                weight: 1.0,
                kind: VariantKind::Paywall {
                    paywall_id: paywall_id.into(),
                },
            }],
        }
    }

    fn holdout_experiment(id: &str) -> Experiment {
        Experiment {
            id: id.into(),
            group_id: format!("grp_{id}"),
            variants: vec![Variant {
                id: "holdout".into(),
                weight: 1.0,
                kind: VariantKind::Holdout,
            }],
        }
    }

    fn plan_is(plan: &str) -> RuleExpression {
        RuleExpression {
            operator: LogicalOperator::And,
            conditions: vec![Condition {
                source: ConditionSource::Param,
                key: "plan".into(),
                comparison: Comparison::Equals,
                value: json!(plan),
            }],
        }
    }

    fn config(rules: Vec<Rule>) -> CampaignConfig {
        let mut config = CampaignConfig::default();
        config.triggers.insert(
            "MyEvent".into(),
            Trigger {
                event_name: "MyEvent".into(),
                rules,
            },
        );
        for id in ["pw_123", "pw_456"] {
            config.paywalls.insert(
                id.into(),
                PaywallDefinition {
                    id: id.into(),
                    name: String::new(),
                    url: format!("https://paywalls.example/{id}"),
                    products: vec!["monthly".into()],
                    presentation_style: PresentationStyle::Modal,
                },
            );
        }
        config
    }

    fn evaluator() -> TriggerEvaluator {
        let store = Arc::new(InMemoryAssignmentStore::new());
        TriggerEvaluator::new(Arc::new(ExperimentAssigner::new(store)))
    }

    fn event(plan: &str) -> Event {
        let mut params = Parameters::new();
        params.insert("plan".into(), json!(plan));
        Event::new("MyEvent", params)
    }

    #[test]
    fn test_trigger_not_found() {
        let outcome = evaluator().evaluate(
            &Event::new("Unknown", Parameters::new()),
            &config(vec![]),
            &UserContext::new("user-1"),
        );
        assert_eq!(outcome, Outcome::TriggerNotFound);
    }

    #[test]
    fn test_no_match() {
        let config = config(vec![Rule {
            id: "rule_1".into(),
            expression: Some(plan_is("pro")),
            experiment: paywall_experiment("exp_1", "pw_123"),
        }]);
        let outcome = evaluator().evaluate(&event("free"), &config, &UserContext::new("user-1"));
        assert_eq!(outcome, Outcome::NoMatch);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let config = config(vec![
            Rule {
                id: "rule_pro".into(),
                expression: Some(plan_is("pro")),
                experiment: paywall_experiment("exp_pro", "pw_456"),
            },
            Rule {
                id: "rule_any".into(),
                expression: None,
                experiment: paywall_experiment("exp_any", "pw_123"),
            },
            Rule {
                id: "rule_shadowed".into(),
                expression: None,
                experiment: holdout_experiment("exp_shadowed"),
            },
        ]);
        let evaluator = evaluator();
        let user = UserContext::new("user-1");

        match evaluator.evaluate(&event("free"), &config, &user) {
            Outcome::Paywall {
                experiment,
                paywall_id,
            } => {
                assert_eq!(experiment.id, "exp_any");
                assert_eq!(paywall_id, "pw_123");
            }
            other => panic!("Expected paywall outcome, got {:?}", other),
        }

        match evaluator.evaluate(&event("pro"), &config, &user) {
            Outcome::Paywall { paywall_id, .. } => assert_eq!(paywall_id, "pw_456"),
            other => panic!("Expected paywall outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_holdout() {
        let config = config(vec![Rule {
            id: "rule_1".into(),
            expression: None,
            experiment: holdout_experiment("exp_1"),
        }]);
        let outcome = evaluator().evaluate(&event("free"), &config, &UserContext::new("user-1"));
        match outcome {
            Outcome::Holdout { experiment } => assert_eq!(experiment.id, "exp_1"),
            other => panic!("Expected holdout, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_rule_and_unknown_paywall_are_errors() {
        let malformed = config(vec![Rule {
            id: "rule_1".into(),
            expression: Some(RuleExpression {
                operator: LogicalOperator::And,
                conditions: vec![Condition {
                    source: ConditionSource::Param,
                    key: "plan".into(),
                    comparison: Comparison::InList,
                    value: json!("pro"),
                }],
            }),
            experiment: paywall_experiment("exp_1", "pw_123"),
        }]);
        let user = UserContext::new("user-1");
        let evaluator = evaluator();
        assert!(matches!(
            evaluator.evaluate(&event("pro"), &malformed, &user),
            Outcome::Error { .. }
        ));

        let dangling = config(vec![Rule {
            id: "rule_1".into(),
            expression: None,
            experiment: paywall_experiment("exp_1", "pw_missing"),
        }]);
        assert!(matches!(
            evaluator.evaluate(&event("pro"), &dangling, &user),
            Outcome::Error { .. }
        ));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let mut exp = paywall_experiment("exp_1", "pw_123");
        exp.variants.push(Variant {
            id: "other".into(),
            weight: 1.0,
            kind: VariantKind::Paywall {
                paywall_id: "pw_456".into(),
            },
        });
        exp.variants.push(Variant {
            id: "holdout".into(),
            weight: 1.0,
            kind: VariantKind::Holdout,
        });
        let config = config(vec![Rule {
            id: "rule_1".into(),
            expression: None,
            experiment: exp,
        }]);
        let evaluator = evaluator();
        let user = UserContext::new("user-1");

        let first = evaluator.evaluate(&event("free"), &config, &user);
        for _ in 0..20 {
            assert_eq!(evaluator.evaluate(&event("free"), &config, &user), first);
        }
    }
}
