use serde_json::Value;

use crate::domain::rules::{RuleCondition, RuleSeverity, ValidationRule};

#[derive(Clone, Debug, PartialEq)]
pub struct RuleVerdict {
    pub passed: bool,
    pub severity: RuleSeverity,
    pub message: Option<String>,
}

impl RuleVerdict {
    pub fn pass(severity: RuleSeverity) -> Self {
        Self { passed: true, severity, message: None }
    }

    pub fn fail(severity: RuleSeverity, message: impl Into<String>) -> Self {
        Self { passed: false, severity, message: Some(message.into()) }
    }

    pub fn blocks(&self) -> bool {
        !self.passed && self.severity.blocks()
    }
}

/// Decides whether a validation rule holds for a lead context.
///
/// The engine only needs the verdict; how conditions are interpreted is up to the implementation.
pub trait RuleEvaluator: Send + Sync {
    fn evaluate(&self, rule: &ValidationRule, context: &Value) -> RuleVerdict;
}

/// Evaluates the built-in condition variants; a rule passes when every condition holds.
#[derive(Clone, Debug, Default)]
pub struct ConditionRuleEvaluator;

impl RuleEvaluator for ConditionRuleEvaluator {
    fn evaluate(&self, rule: &ValidationRule, context: &Value) -> RuleVerdict {
        if rule.conditions.iter().all(|condition| condition_holds(condition, context)) {
            RuleVerdict::pass(rule.severity)
        } else {
            RuleVerdict::fail(rule.severity, rule.failure_message())
        }
    }
}

fn condition_holds(condition: &RuleCondition, context: &Value) -> bool {
    match condition {
        RuleCondition::FieldPresent { field } => {
            lookup(context, field).is_some_and(|value| match value {
                Value::Null => false,
                Value::String(text) => !text.trim().is_empty(),
                _ => true,
            })
        }
        RuleCondition::FieldEquals { field, value } => lookup(context, field) == Some(value),
        RuleCondition::FieldIn { field, values } => {
            lookup(context, field).is_some_and(|value| values.contains(value))
        }
        RuleCondition::NumberAtLeast { field, min } => {
            number_at(context, field).is_some_and(|number| number >= *min)
        }
        RuleCondition::NumberAtMost { field, max } => {
            number_at(context, field).is_some_and(|number| number <= *max)
        }
    }
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(context, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
            _ => None,
        })
}

fn number_at(context: &Value, path: &str) -> Option<f64> {
    match lookup(context, path)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ConditionRuleEvaluator, RuleEvaluator};
    use crate::domain::rules::{RuleAction, RuleCondition, RuleId, RuleSeverity, ValidationRule};
    use crate::domain::TenantId;

    fn rule(conditions: Vec<RuleCondition>, severity: RuleSeverity) -> ValidationRule {
        ValidationRule {
            id: RuleId("r-income".to_string()),
            tenant_id: TenantId("t-1".to_string()),
            name: "Minimum income".to_string(),
            description: None,
            conditions,
            actions: vec![RuleAction::Block { message: "income below threshold".to_string() }],
            severity,
            enabled: true,
            pipeline_stage_id: None,
            order: 1,
        }
    }

    #[test]
    fn all_conditions_must_hold() {
        let evaluator = ConditionRuleEvaluator;
        let income_rule = rule(
            vec![
                RuleCondition::FieldPresent { field: "applicant.name".to_string() },
                RuleCondition::NumberAtLeast { field: "applicant.income".to_string(), min: 1500.0 },
            ],
            RuleSeverity::Error,
        );

        let passing = evaluator
            .evaluate(&income_rule, &json!({"applicant": {"name": "Ada", "income": 2400}}));
        assert!(passing.passed);

        let failing = evaluator
            .evaluate(&income_rule, &json!({"applicant": {"name": "Ada", "income": "900"}}));
        assert!(failing.blocks());
        assert_eq!(failing.message.as_deref(), Some("income below threshold"));
    }

    #[test]
    fn warnings_fail_without_blocking() {
        let evaluator = ConditionRuleEvaluator;
        let product_rule = rule(
            vec![RuleCondition::FieldIn {
                field: "loan.product".to_string(),
                values: vec![json!("personal"), json!("sme")],
            }],
            RuleSeverity::Warning,
        );

        let verdict = evaluator.evaluate(&product_rule, &json!({"loan": {"product": "mortgage"}}));
        assert!(!verdict.passed);
        assert!(!verdict.blocks());
    }

    #[test]
    fn paths_reach_into_arrays_and_reject_blank_strings() {
        let evaluator = ConditionRuleEvaluator;
        let documents_rule = rule(
            vec![
                RuleCondition::FieldEquals {
                    field: "documents.0.kind".to_string(),
                    value: json!("national_id"),
                },
                RuleCondition::FieldPresent { field: "documents.0.number".to_string() },
            ],
            RuleSeverity::Error,
        );

        let blank = json!({"documents": [{"kind": "national_id", "number": "  "}]});
        let filled = json!({"documents": [{"kind": "national_id", "number": "A123"}]});

        assert!(!evaluator.evaluate(&documents_rule, &blank).passed);
        assert!(evaluator.evaluate(&documents_rule, &filled).passed);
    }
}
