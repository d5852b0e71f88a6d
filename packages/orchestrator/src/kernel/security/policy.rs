//! Security policy model: rules, conditions, and the container snapshot
//! they evaluate against.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "rule_severity", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuleSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    Permissive,
    Detection,
    Enforcement,
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Vulnerability,
    Secrets,
    Compliance,
    Malware,
    License,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Block,
    Quarantine,
    Alert,
    Log,
    Scan(ScanType),
    Isolate,
    Terminate,
    Patch,
}

/// Which extracted container attribute a condition reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeTarget {
    ImageName,
    ImageTag,
    Registry,
    Label(String),
    Env(String),
    Port,
    Volume,
    Capability,
    User,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Matches,
    GreaterThan,
    LessThan,
    In,
    NotIn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub target: AttributeTarget,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub category: String,
    pub severity: RuleSeverity,
    /// All conditions must hold (conjunctive).
    pub conditions: Vec<Condition>,
    /// Executed in order; `Block` stops the rest of this rule's actions.
    pub actions: Vec<RuleAction>,
    pub mode: EnforcementMode,
    pub enabled: bool,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub rules: Vec<Rule>,
}

impl Policy {
    /// Enabled rules in priority order (lower number first).
    pub fn active_rules(&self) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.rules.iter().filter(|rule| rule.enabled).collect();
        rules.sort_by_key(|rule| rule.priority);
        rules
    }
}

/// Point-in-time attributes extracted from a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub container_id: uuid::Uuid,
    pub image_name: String,
    pub image_tag: String,
    pub registry: String,
    pub labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub ports: Vec<u16>,
    pub volumes: Vec<String>,
    pub capabilities: Vec<String>,
    pub user: String,
    pub command: String,
    pub privileged: bool,
    pub run_as_non_root: bool,
    pub read_only_root_filesystem: bool,
}

impl ContainerSnapshot {
    fn values_for(&self, target: &AttributeTarget) -> Vec<String> {
        match target {
            AttributeTarget::ImageName => vec![self.image_name.clone()],
            AttributeTarget::ImageTag => vec![self.image_tag.clone()],
            AttributeTarget::Registry => vec![self.registry.clone()],
            AttributeTarget::Label(name) => {
                self.labels.get(name).cloned().into_iter().collect()
            }
            AttributeTarget::Env(name) => self.env.get(name).cloned().into_iter().collect(),
            AttributeTarget::Port => self.ports.iter().map(|port| port.to_string()).collect(),
            AttributeTarget::Volume => self.volumes.clone(),
            AttributeTarget::Capability => self.capabilities.clone(),
            AttributeTarget::User => vec![self.user.clone()],
            AttributeTarget::Command => vec![self.command.clone()],
        }
    }
}

fn expected_strings(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        serde_json::Value::String(s) => vec![s.clone()],
        other => vec![other.to_string()],
    }
}

impl Condition {
    /// True when any extracted value satisfies the operator. An attribute
    /// with no value fails every positive operator and passes the negated
    /// ones.
    pub fn matches(&self, snapshot: &ContainerSnapshot) -> bool {
        let actual = snapshot.values_for(&self.target);
        let expected = expected_strings(&self.value);
        let first = expected.first().map(String::as_str).unwrap_or("");

        match self.operator {
            ConditionOperator::Equals => actual.iter().any(|value| value == first),
            ConditionOperator::NotEquals => actual.iter().all(|value| value != first),
            ConditionOperator::Contains => actual.iter().any(|value| value.contains(first)),
            ConditionOperator::NotContains => {
                actual.iter().all(|value| !value.contains(first))
            }
            ConditionOperator::StartsWith => {
                actual.iter().any(|value| value.starts_with(first))
            }
            ConditionOperator::EndsWith => actual.iter().any(|value| value.ends_with(first)),
            ConditionOperator::Matches => match Regex::new(first) {
                Ok(pattern) => actual.iter().any(|value| pattern.is_match(value)),
                Err(_) => false,
            },
            ConditionOperator::GreaterThan => {
                let threshold = first.parse::<f64>().unwrap_or(f64::MAX);
                actual
                    .iter()
                    .filter_map(|value| value.parse::<f64>().ok())
                    .any(|value| value > threshold)
            }
            ConditionOperator::LessThan => {
                let threshold = first.parse::<f64>().unwrap_or(f64::MIN);
                actual
                    .iter()
                    .filter_map(|value| value.parse::<f64>().ok())
                    .any(|value| value < threshold)
            }
            ConditionOperator::In => actual
                .iter()
                .any(|value| expected.iter().any(|candidate| candidate == value)),
            ConditionOperator::NotIn => actual
                .iter()
                .all(|value| !expected.iter().any(|candidate| candidate == value)),
        }
    }
}

impl Rule {
    pub fn matches(&self, snapshot: &ContainerSnapshot) -> bool {
        self.enabled
            && self
                .conditions
                .iter()
                .all(|condition| condition.matches(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> ContainerSnapshot {
        ContainerSnapshot {
            image_name: "runnerhub/sandbox".into(),
            image_tag: "latest".into(),
            registry: "docker.io".into(),
            labels: HashMap::from([("orchestrator.managed".into(), "true".into())]),
            env: HashMap::from([("CI".into(), "true".into())]),
            ports: vec![8080, 22],
            volumes: vec!["/var/run/docker.sock".into()],
            capabilities: vec!["NET_ADMIN".into()],
            user: "root".into(),
            command: "/entrypoint.sh run".into(),
            privileged: false,
            run_as_non_root: false,
            read_only_root_filesystem: false,
            ..Default::default()
        }
    }

    fn condition(
        target: AttributeTarget,
        operator: ConditionOperator,
        value: serde_json::Value,
    ) -> Condition {
        Condition {
            target,
            operator,
            value,
        }
    }

    #[test]
    fn equals_and_not_equals() {
        let snap = snapshot();
        assert!(condition(AttributeTarget::User, ConditionOperator::Equals, json!("root"))
            .matches(&snap));
        assert!(!condition(
            AttributeTarget::User,
            ConditionOperator::NotEquals,
            json!("root")
        )
        .matches(&snap));
    }

    #[test]
    fn contains_on_multivalued_attribute() {
        let snap = snapshot();
        assert!(condition(
            AttributeTarget::Volume,
            ConditionOperator::Contains,
            json!("docker.sock")
        )
        .matches(&snap));
        assert!(condition(
            AttributeTarget::Volume,
            ConditionOperator::NotContains,
            json!("/etc/passwd")
        )
        .matches(&snap));
    }

    #[test]
    fn regex_match_on_image() {
        let snap = snapshot();
        assert!(condition(
            AttributeTarget::ImageName,
            ConditionOperator::Matches,
            json!("^runnerhub/.+")
        )
        .matches(&snap));
        assert!(!condition(
            AttributeTarget::ImageName,
            ConditionOperator::Matches,
            json!("^docker/")
        )
        .matches(&snap));
    }

    #[test]
    fn invalid_regex_never_matches() {
        let snap = snapshot();
        assert!(!condition(
            AttributeTarget::ImageName,
            ConditionOperator::Matches,
            json!("([")
        )
        .matches(&snap));
    }

    #[test]
    fn numeric_comparison_on_ports() {
        let snap = snapshot();
        assert!(condition(AttributeTarget::Port, ConditionOperator::LessThan, json!("80"))
            .matches(&snap)); // port 22
        assert!(condition(
            AttributeTarget::Port,
            ConditionOperator::GreaterThan,
            json!("8000")
        )
        .matches(&snap)); // port 8080
    }

    #[test]
    fn in_and_not_in_sets() {
        let snap = snapshot();
        assert!(condition(
            AttributeTarget::Capability,
            ConditionOperator::In,
            json!(["NET_ADMIN", "SYS_ADMIN"])
        )
        .matches(&snap));
        assert!(condition(
            AttributeTarget::ImageTag,
            ConditionOperator::NotIn,
            json!(["v1", "v2"])
        )
        .matches(&snap));
    }

    #[test]
    fn missing_attribute_fails_positive_operators() {
        let snap = snapshot();
        assert!(!condition(
            AttributeTarget::Env("MISSING".into()),
            ConditionOperator::Equals,
            json!("x")
        )
        .matches(&snap));
        assert!(condition(
            AttributeTarget::Env("MISSING".into()),
            ConditionOperator::NotEquals,
            json!("x")
        )
        .matches(&snap));
    }

    #[test]
    fn rule_conditions_are_conjunctive() {
        let snap = snapshot();
        let rule = Rule {
            id: "no-root-with-docker-sock".into(),
            category: "runtime".into(),
            severity: RuleSeverity::Critical,
            conditions: vec![
                condition(AttributeTarget::User, ConditionOperator::Equals, json!("root")),
                condition(
                    AttributeTarget::Volume,
                    ConditionOperator::Contains,
                    json!("docker.sock"),
                ),
            ],
            actions: vec![RuleAction::Block],
            mode: EnforcementMode::Enforcement,
            enabled: true,
            priority: 1,
        };
        assert!(rule.matches(&snap));

        let mut other = snap;
        other.user = "1000".into();
        assert!(!rule.matches(&other));
    }

    #[test]
    fn disabled_rules_never_match() {
        let snap = snapshot();
        let rule = Rule {
            id: "disabled".into(),
            category: "runtime".into(),
            severity: RuleSeverity::Low,
            conditions: vec![],
            actions: vec![RuleAction::Log],
            mode: EnforcementMode::Permissive,
            enabled: false,
            priority: 10,
        };
        assert!(!rule.matches(&snap));
    }

    #[test]
    fn active_rules_sort_by_priority() {
        let policy = Policy {
            id: "p-1".into(),
            name: "baseline".into(),
            rules: vec![
                Rule {
                    id: "later".into(),
                    category: "runtime".into(),
                    severity: RuleSeverity::Low,
                    conditions: vec![],
                    actions: vec![RuleAction::Log],
                    mode: EnforcementMode::Permissive,
                    enabled: true,
                    priority: 5,
                },
                Rule {
                    id: "first".into(),
                    category: "runtime".into(),
                    severity: RuleSeverity::High,
                    conditions: vec![],
                    actions: vec![RuleAction::Alert],
                    mode: EnforcementMode::Enforcement,
                    enabled: true,
                    priority: 1,
                },
            ],
        };
        let active = policy.active_rules();
        assert_eq!(active[0].id, "first");
    }
}
