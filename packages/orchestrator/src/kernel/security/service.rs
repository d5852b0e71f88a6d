//! Security assessment and enforcement on the container admission path.
//!
//! Wraps the pure evaluator with the open-violation ledger (dedup across
//! re-evaluations) and executes planned actions against the pool and the
//! engine. Persistence of violations and scans is a best-effort mirror.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::Result;
use crate::kernel::containers::engine::ContainerEngine;
use crate::kernel::containers::lifecycle::Sandbox;
use crate::kernel::containers::pool::PoolHandle;
use crate::kernel::jobs::engine::QueueEngine;
use crate::kernel::jobs::payload::{AlertSeverity, JobPayload};
use crate::kernel::security::evaluator::{Evaluation, Evaluator, ScanFindings};
use crate::kernel::security::policy::{ContainerSnapshot, RuleAction, RuleSeverity};
use crate::kernel::stream_hub::StreamHub;

fn alert_severity(severity: RuleSeverity) -> AlertSeverity {
    match severity {
        RuleSeverity::Critical => AlertSeverity::Critical,
        RuleSeverity::High => AlertSeverity::High,
        RuleSeverity::Medium => AlertSeverity::Medium,
        RuleSeverity::Low => AlertSeverity::Low,
    }
}

pub struct SecurityService {
    evaluator: Evaluator,
    hub: StreamHub,
    /// Open violations per container: the dedup ledger.
    ledger: RwLock<HashMap<Uuid, HashSet<String>>>,
    db: Option<PgPool>,
}

impl SecurityService {
    pub fn new(evaluator: Evaluator, hub: StreamHub, db: Option<PgPool>) -> Self {
        Self {
            evaluator,
            hub,
            ledger: RwLock::new(HashMap::new()),
            db,
        }
    }

    /// Evaluate a snapshot, record new violations in the ledger, and mirror
    /// them to the store.
    pub async fn assess(
        &self,
        snapshot: &ContainerSnapshot,
        findings: ScanFindings,
    ) -> Evaluation {
        let open = {
            let ledger = self.ledger.read().await;
            ledger
                .get(&snapshot.container_id)
                .cloned()
                .unwrap_or_default()
        };

        let evaluation = self.evaluator.evaluate(snapshot, &open, findings);

        if !evaluation.new_violations.is_empty() {
            let mut ledger = self.ledger.write().await;
            let open = ledger.entry(snapshot.container_id).or_default();
            for violation in &evaluation.new_violations {
                open.insert(violation.rule_id.clone());
            }
        }
        self.persist_violations(&evaluation).await;

        self.hub
            .publish(
                "security",
                serde_json::json!({
                    "event": "container_assessed",
                    "container_id": snapshot.container_id,
                    "risk_score": evaluation.risk_score,
                    "status": evaluation.status,
                    "new_violations": evaluation.new_violations.len(),
                }),
            )
            .await;
        evaluation
    }

    /// Carry out the planned actions in order. `Block` has already ended
    /// its own rule's action list; across rules every action runs.
    pub async fn enforce(
        &self,
        evaluation: &Evaluation,
        sandbox: &Sandbox,
        pool: &PoolHandle,
        engine: &Arc<dyn ContainerEngine>,
        queue: &Arc<QueueEngine>,
    ) -> Result<()> {
        for planned in &evaluation.actions {
            match &planned.action {
                RuleAction::Block | RuleAction::Terminate => {
                    warn!(
                        container_id = %sandbox.id,
                        rule = %planned.rule_id,
                        "blocking container"
                    );
                    pool.evict(sandbox.id, true).await.ok();
                }
                RuleAction::Quarantine | RuleAction::Isolate => {
                    if planned.action == RuleAction::Isolate {
                        engine
                            .disconnect_network(&sandbox.engine_id, &sandbox.network)
                            .await
                            .ok();
                    } else {
                        pool.quarantine(sandbox.id).await.ok();
                    }
                }
                RuleAction::Alert => {
                    let alert = JobPayload::SendAlert {
                        severity: alert_severity(planned.severity),
                        message: format!(
                            "security rule {} matched container {}",
                            planned.rule_id, sandbox.id
                        ),
                        source: "security_evaluator".to_string(),
                    };
                    if let Err(err) = queue.enqueue(alert).await {
                        warn!(error = %err, "failed to enqueue security alert");
                    }
                }
                RuleAction::Log => {
                    info!(
                        container_id = %sandbox.id,
                        rule = %planned.rule_id,
                        severity = ?planned.severity,
                        "security rule matched"
                    );
                }
                RuleAction::Scan(scan_type) => {
                    self.record_scan(sandbox.id, &format!("{scan_type:?}")).await;
                }
                RuleAction::Patch => {
                    // No engine-side patching; recorded for the operator.
                    warn!(
                        container_id = %sandbox.id,
                        rule = %planned.rule_id,
                        "patch action requested, not supported by the engine"
                    );
                }
            }
        }
        Ok(())
    }

    /// Resolve every open violation for a container (it was removed).
    pub async fn forget(&self, container_id: Uuid) {
        self.ledger.write().await.remove(&container_id);
    }

    pub async fn open_violation_count(&self, container_id: Uuid) -> usize {
        self.ledger
            .read()
            .await
            .get(&container_id)
            .map_or(0, HashSet::len)
    }

    async fn persist_violations(&self, evaluation: &Evaluation) {
        let Some(db) = &self.db else { return };

        let profile = sqlx::query(
            r#"
            INSERT INTO security_profiles (container_id, risk_score, status, evaluated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (container_id) DO UPDATE SET
                risk_score = EXCLUDED.risk_score,
                status = EXCLUDED.status,
                evaluated_at = EXCLUDED.evaluated_at
            "#,
        )
        .bind(evaluation.container_id)
        .bind(evaluation.risk_score as i16)
        .bind(serde_json::json!(evaluation.status).as_str().unwrap_or("SECURE").to_string())
        .bind(evaluation.evaluated_at)
        .execute(db)
        .await;
        if let Err(err) = profile {
            warn!(error = %err, "security profile mirror write failed");
        }

        for violation in &evaluation.new_violations {
            let result = sqlx::query(
                r#"
                INSERT INTO security_violations (container_id, rule_id, severity, category, detected_at, resolved)
                VALUES ($1, $2, $3, $4, $5, false)
                "#,
            )
            .bind(violation.container_id)
            .bind(&violation.rule_id)
            .bind(violation.severity)
            .bind(&violation.category)
            .bind(violation.detected_at)
            .execute(db)
            .await;
            if let Err(err) = result {
                warn!(error = %err, "violation mirror write failed");
            }
        }
    }

    async fn record_scan(&self, container_id: Uuid, scan_type: &str) {
        let Some(db) = &self.db else { return };
        let result = sqlx::query(
            r#"
            INSERT INTO security_scans (container_id, scan_type, requested_at)
            VALUES ($1, $2, NOW())
            "#,
        )
        .bind(container_id)
        .bind(scan_type.to_lowercase())
        .execute(db)
        .await;
        if let Err(err) = result {
            warn!(error = %err, "scan mirror write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::security::policy::{
        AttributeTarget, Condition, ConditionOperator, EnforcementMode, Policy, Rule,
    };
    use serde_json::json;

    fn service() -> SecurityService {
        let rule = Rule {
            id: "no-root".into(),
            category: "runtime".into(),
            severity: RuleSeverity::High,
            conditions: vec![Condition {
                target: AttributeTarget::User,
                operator: ConditionOperator::Equals,
                value: json!("root"),
            }],
            actions: vec![RuleAction::Alert],
            mode: EnforcementMode::Enforcement,
            enabled: true,
            priority: 1,
        };
        SecurityService::new(
            Evaluator::new(vec![Policy {
                id: "p-1".into(),
                name: "baseline".into(),
                rules: vec![rule],
            }]),
            StreamHub::new(),
            None,
        )
    }

    fn root_snapshot(container_id: Uuid) -> ContainerSnapshot {
        ContainerSnapshot {
            container_id,
            user: "root".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn repeated_assessment_records_no_duplicate_violations() {
        let service = service();
        let container_id = Uuid::new_v4();
        let snapshot = root_snapshot(container_id);

        let first = service.assess(&snapshot, ScanFindings::default()).await;
        assert_eq!(first.new_violations.len(), 1);
        assert_eq!(service.open_violation_count(container_id).await, 1);

        let second = service.assess(&snapshot, ScanFindings::default()).await;
        assert!(second.new_violations.is_empty());
        assert_eq!(service.open_violation_count(container_id).await, 1);
    }

    #[tokio::test]
    async fn forget_clears_the_ledger() {
        let service = service();
        let container_id = Uuid::new_v4();
        service
            .assess(&root_snapshot(container_id), ScanFindings::default())
            .await;
        service.forget(container_id).await;
        assert_eq!(service.open_violation_count(container_id).await, 0);

        // A fresh container with the same posture records anew.
        let again = service
            .assess(&root_snapshot(container_id), ScanFindings::default())
            .await;
        assert_eq!(again.new_violations.len(), 1);
    }
}
