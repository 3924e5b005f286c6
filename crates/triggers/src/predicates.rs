//! Rule expression evaluation over event parameters and user traits.

use paywall_core::types::{
    Comparison, Condition, ConditionSource, Event, LogicalOperator, RuleExpression, UserContext,
};
use paywall_core::{PaywallError, PaywallResult};
use serde_json::Value;

/// Evaluates `expression` for the given event and user. A malformed
/// condition fails the whole expression, whatever the data.
pub fn evaluate_expression(
    expression: &RuleExpression,
    event: &Event,
    user: &UserContext,
) -> PaywallResult<bool> {
    for condition in &expression.conditions {
        validate_condition(condition)?;
    }

    let mut results = expression
        .conditions
        .iter()
        .map(|condition| evaluate_condition(condition, event, user));

    Ok(match expression.operator {
        LogicalOperator::And => results.all(|matched| matched),
        LogicalOperator::Or => results.any(|matched| matched),
    })
}

pub fn evaluate_condition(condition: &Condition, event: &Event, user: &UserContext) -> bool {
    let actual = match condition.source {
        ConditionSource::Param => event.parameters.get(&condition.key),
        ConditionSource::Trait => user.traits.get(&condition.key),
    }
    .filter(|value| !value.is_null());

    compare_values(actual, condition.comparison, &condition.value)
}

pub fn validate_condition(condition: &Condition) -> PaywallResult<()> {
    if condition.key.trim().is_empty() {
        return Err(PaywallError::Evaluation(
            "condition has an empty key".to_string(),
        ));
    }

    let expected = &condition.value;
    let well_formed = match condition.comparison {
        Comparison::GreaterThan
        | Comparison::GreaterThanOrEqual
        | Comparison::LessThan
        | Comparison::LessThanOrEqual => expected.is_number(),
        Comparison::Contains | Comparison::StartsWith | Comparison::EndsWith => {
            expected.is_string()
        }
        Comparison::InList | Comparison::NotInList => expected.is_array(),
        Comparison::Equals | Comparison::NotEquals => !expected.is_array() && !expected.is_object(),
        Comparison::IsSet | Comparison::IsNotSet => true,
    };

    if well_formed {
        Ok(())
    } else {
        Err(PaywallError::Evaluation(format!(
            "condition on '{}' compares {:?} against {}",
            condition.key, condition.comparison, expected
        )))
    }
}

#[allow(clippy::unnecessary_map_or)]
pub fn compare_values(actual: Option<&Value>, comparison: Comparison, expected: &Value) -> bool {
    match comparison {
        Comparison::IsSet => actual.is_some(),
        Comparison::IsNotSet => actual.is_none(),
        Comparison::Equals => actual.map_or(false, |a| scalar_eq(a, expected)),
        Comparison::NotEquals => actual.map_or(true, |a| !scalar_eq(a, expected)),
        Comparison::GreaterThan => {
            numeric_cmp(actual, expected).map_or(false, |o| o == std::cmp::Ordering::Greater)
        }
        Comparison::GreaterThanOrEqual => {
            numeric_cmp(actual, expected).map_or(false, |o| o != std::cmp::Ordering::Less)
        }
        Comparison::LessThan => {
            numeric_cmp(actual, expected).map_or(false, |o| o == std::cmp::Ordering::Less)
        }
        Comparison::LessThanOrEqual => {
            numeric_cmp(actual, expected).map_or(false, |o| o != std::cmp::Ordering::Greater)
        }
        Comparison::Contains => string_pair(actual, expected).map_or(false, |(a, e)| a.contains(e)),
        Comparison::StartsWith => {
            string_pair(actual, expected).map_or(false, |(a, e)| a.starts_with(e))
        }
        Comparison::EndsWith => {
            string_pair(actual, expected).map_or(false, |(a, e)| a.ends_with(e))
        }
        Comparison::InList => actual
            .zip(expected.as_array())
            .map_or(false, |(a, list)| list.iter().any(|item| scalar_eq(a, item))),
        Comparison::NotInList => actual
            .zip(expected.as_array())
            .map_or(true, |(a, list)| !list.iter().any(|item| scalar_eq(a, item))),
    }
}

/// Numbers compare by value so `1` equals `1.0`.
fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn numeric_cmp(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let a = actual?.as_f64()?;
    let e = expected.as_f64()?;
    a.partial_cmp(&e)
}

fn string_pair<'a>(actual: Option<&'a Value>, expected: &'a Value) -> Option<(&'a str, &'a str)> {
    actual?.as_str().zip(expected.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use paywall_core::types::Parameters;
    use serde_json::json;

    fn condition(source: ConditionSource, key: &str, comparison: Comparison, value: Value) -> Condition {
        Condition {
            source,
            key: key.to_string(),
            comparison,
            value,
        }
    }

    fn event_with(params: Value) -> Event {
        let parameters: Parameters = serde_json::from_value(params).expect("object params");
        Event::new("MyEvent", parameters)
    }

    #[test]
    fn test_and_or_semantics() {
        let event = event_with(json!({"plan": "pro", "count": 3}));
        let user = UserContext::new("user-1");

        let conditions = vec![
            condition(ConditionSource::Param, "plan", Comparison::Equals, json!("pro")),
            condition(ConditionSource::Param, "count", Comparison::GreaterThan, json!(5)),
        ];

        let and = RuleExpression {
            operator: LogicalOperator::And,
            conditions: conditions.clone(),
        };
        let or = RuleExpression {
            operator: LogicalOperator::Or,
            conditions,
        };

        assert!(!evaluate_expression(&and, &event, &user).unwrap());
        assert!(evaluate_expression(&or, &event, &user).unwrap());
    }

    #[test]
    fn test_trait_source_and_missing_values() {
        let event = event_with(json!({}));
        let mut user = UserContext::new("user-1");
        user.traits.insert("country".into(), json!("US"));

        let us = condition(
            ConditionSource::Trait,
            "country",
            Comparison::InList,
            json!(["US", "CA"]),
        );
        assert!(evaluate_condition(&us, &event, &user));

        let missing = condition(ConditionSource::Param, "plan", Comparison::IsNotSet, Value::Null);
        assert!(evaluate_condition(&missing, &event, &user));

        let not_equal = condition(ConditionSource::Param, "plan", Comparison::NotEquals, json!("pro"));
        assert!(evaluate_condition(&not_equal, &event, &user));
    }

    #[test]
    fn test_numbers_compare_by_value() {
        assert!(compare_values(Some(&json!(1)), Comparison::Equals, &json!(1.0)));
        assert!(compare_values(
            Some(&json!(2.5)),
            Comparison::LessThanOrEqual,
            &json!(3)
        ));
        assert!(!compare_values(Some(&json!("3")), Comparison::GreaterThan, &json!(1)));
    }

    #[test]
    fn test_malformed_condition_is_an_error() {
        let event = event_with(json!({"count": 3}));
        let user = UserContext::new("user-1");
        let expression = RuleExpression {
            operator: LogicalOperator::Or,
            conditions: vec![
                condition(ConditionSource::Param, "count", Comparison::Equals, json!(3)),
                condition(ConditionSource::Param, "count", Comparison::GreaterThan, json!("ten")),
            ],
        };

        let err = evaluate_expression(&expression, &event, &user).unwrap_err();
        assert!(matches!(err, PaywallError::Evaluation(_)));

        let empty_key = condition(ConditionSource::Param, " ", Comparison::IsSet, Value::Null);
        assert!(validate_condition(&empty_key).is_err());
    }
}
