//! Policy evaluation against container snapshots.
//!
//! Evaluation is pure: given the same snapshot, policy set, and set of
//! already-open violations it always plans the same actions and never
//! duplicates violation records. Enforcement (stopping containers,
//! enqueueing alerts) happens in the security processor using the plan.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::kernel::security::policy::{
    ContainerSnapshot, EnforcementMode, Policy, Rule, RuleAction, RuleSeverity,
};
use crate::kernel::security::risk::{risk_score, security_status, RiskInput, SecurityStatus};

/// A newly detected violation (not yet persisted).
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub rule_id: String,
    pub container_id: Uuid,
    pub severity: RuleSeverity,
    pub category: String,
    pub detected_at: DateTime<Utc>,
}

/// One action the enforcement layer must carry out, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedAction {
    pub rule_id: String,
    pub severity: RuleSeverity,
    pub action: RuleAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub container_id: Uuid,
    pub matched_rules: Vec<String>,
    pub new_violations: Vec<Violation>,
    pub actions: Vec<PlannedAction>,
    pub risk_score: u8,
    pub status: SecurityStatus,
    pub evaluated_at: DateTime<Utc>,
}

impl Evaluation {
    pub fn blocked(&self) -> bool {
        self.actions
            .iter()
            .any(|planned| planned.action == RuleAction::Block)
    }
}

/// Findings carried over from previous scans, fed into the risk score.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanFindings {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
}

pub struct Evaluator {
    policies: Vec<Policy>,
}

impl Evaluator {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Evaluate every active rule. `open_rule_ids` are the rules that
    /// already have an unresolved violation for this container; matching
    /// them again plans actions but records no new violation.
    pub fn evaluate(
        &self,
        snapshot: &ContainerSnapshot,
        open_rule_ids: &HashSet<String>,
        findings: ScanFindings,
    ) -> Evaluation {
        let now = Utc::now();
        let mut matched_rules = Vec::new();
        let mut new_violations = Vec::new();
        let mut actions = Vec::new();
        let mut unresolved_critical = 0u32;
        let mut unresolved_high = 0u32;

        for policy in &self.policies {
            for rule in policy.active_rules() {
                if !rule.matches(snapshot) {
                    continue;
                }
                matched_rules.push(rule.id.clone());

                match rule.severity {
                    RuleSeverity::Critical => unresolved_critical += 1,
                    RuleSeverity::High => unresolved_high += 1,
                    _ => {}
                }

                // Dedup key: (rule, container, open). An open violation is
                // never recorded twice.
                if !open_rule_ids.contains(&rule.id) {
                    new_violations.push(Violation {
                        rule_id: rule.id.clone(),
                        container_id: snapshot.container_id,
                        severity: rule.severity,
                        category: rule.category.clone(),
                        detected_at: now,
                    });
                }

                actions.extend(planned_actions(rule));
            }
        }

        let unresolved_violations =
            (open_rule_ids.len() + new_violations.len()) as u32;
        let input = RiskInput {
            unresolved_violations,
            unresolved_critical,
            unresolved_high,
            critical_findings: findings.critical,
            high_findings: findings.high,
            medium_findings: findings.medium,
            privileged: snapshot.privileged,
            run_as_non_root: snapshot.run_as_non_root,
            read_only_root_filesystem: snapshot.read_only_root_filesystem,
        };
        let score = risk_score(&input);

        Evaluation {
            container_id: snapshot.container_id,
            matched_rules,
            new_violations,
            actions,
            risk_score: score,
            status: security_status(score, &input),
            evaluated_at: now,
        }
    }
}

/// Actions a matched rule contributes, honoring its enforcement mode and
/// the block short-circuit.
fn planned_actions(rule: &Rule) -> Vec<PlannedAction> {
    let mut planned = Vec::new();
    for action in &rule.actions {
        let allowed = match rule.mode {
            // Permissive rules observe only.
            EnforcementMode::Permissive => matches!(action, RuleAction::Log),
            // Detection records and alerts, never disrupts the container.
            EnforcementMode::Detection => matches!(
                action,
                RuleAction::Log | RuleAction::Alert | RuleAction::Scan(_)
            ),
            EnforcementMode::Enforcement | EnforcementMode::Blocking => true,
        };
        if !allowed {
            continue;
        }
        let is_block = *action == RuleAction::Block;
        planned.push(PlannedAction {
            rule_id: rule.id.clone(),
            severity: rule.severity,
            action: action.clone(),
        });
        if is_block {
            break;
        }
    }
    planned
}
