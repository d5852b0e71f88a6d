//! Append-only audit log with a chained hash over entry order.
//!
//! Each entry hashes its own fields together with the previous entry's hash,
//! so any reordering or deletion is detectable by walking the chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool};

use crate::common::Result;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: i64,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub outcome: String,
    pub created_at: DateTime<Utc>,
    pub chain_hash: String,
}

/// First break found while verifying the chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainBreak {
    pub seq: i64,
    pub expected: String,
    pub recorded: String,
}

fn entry_hash(
    prev_hash: &str,
    actor: &str,
    action: &str,
    resource: &str,
    outcome: &str,
    created_at: &DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(actor.as_bytes());
    hasher.update(action.as_bytes());
    hasher.update(resource.as_bytes());
    hasher.update(outcome.as_bytes());
    hasher.update(created_at.timestamp_micros().to_be_bytes());
    hex::encode(hasher.finalize())
}

pub struct AuditLog {
    db: PgPool,
}

impl AuditLog {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Append one entry. Serialized via an advisory lock so the chain never
    /// forks under concurrent writers.
    pub async fn record(
        &self,
        actor: &str,
        action: &str,
        resource: &str,
        outcome: &str,
    ) -> Result<AuditEntry> {
        let mut tx = self.db.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('audit_entries'))")
            .execute(&mut *tx)
            .await?;

        let prev_hash: Option<String> = sqlx::query_scalar(
            "SELECT chain_hash FROM audit_entries ORDER BY seq DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let created_at = Utc::now();
        let chain_hash = entry_hash(
            prev_hash.as_deref().unwrap_or(""),
            actor,
            action,
            resource,
            outcome,
            &created_at,
        );

        let entry = sqlx::query_as::<_, AuditEntry>(
            r#"
            INSERT INTO audit_entries (actor, action, resource, outcome, created_at, chain_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING seq, actor, action, resource, outcome, created_at, chain_hash
            "#,
        )
        .bind(actor)
        .bind(action)
        .bind(resource)
        .bind(outcome)
        .bind(created_at)
        .bind(&chain_hash)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(entry)
    }

    /// Walk the full chain; `None` means intact.
    pub async fn verify(&self) -> Result<Option<ChainBreak>> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT seq, actor, action, resource, outcome, created_at, chain_hash
            FROM audit_entries
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        Ok(verify_entries(&entries))
    }
}

fn verify_entries(entries: &[AuditEntry]) -> Option<ChainBreak> {
    let mut prev_hash = String::new();
    for entry in entries {
        let expected = entry_hash(
            &prev_hash,
            &entry.actor,
            &entry.action,
            &entry.resource,
            &entry.outcome,
            &entry.created_at,
        );
        if expected != entry.chain_hash {
            return Some(ChainBreak {
                seq: entry.seq,
                expected,
                recorded: entry.chain_hash.clone(),
            });
        }
        prev_hash = entry.chain_hash.clone();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: i64, prev: &str, action: &str) -> AuditEntry {
        let created_at = Utc::now();
        let chain_hash = entry_hash(prev, "system", action, "job:1", "ok", &created_at);
        AuditEntry {
            seq,
            actor: "system".into(),
            action: action.into(),
            resource: "job:1".into(),
            outcome: "ok".into(),
            created_at,
            chain_hash,
        }
    }

    #[test]
    fn intact_chain_verifies() {
        let first = entry(1, "", "enqueue");
        let second = entry(2, &first.chain_hash, "complete");
        assert!(verify_entries(&[first, second]).is_none());
    }

    #[test]
    fn tampered_entry_is_detected() {
        let first = entry(1, "", "enqueue");
        let mut second = entry(2, &first.chain_hash, "complete");
        second.outcome = "rewritten".into();
        let broken = verify_entries(&[first, second]).unwrap();
        assert_eq!(broken.seq, 2);
    }

    #[test]
    fn removed_entry_breaks_the_chain() {
        let first = entry(1, "", "enqueue");
        let second = entry(2, &first.chain_hash, "start");
        let third = entry(3, &second.chain_hash, "complete");
        // Drop the middle entry: the third no longer chains from the first.
        assert!(verify_entries(&[first, third]).is_some());
    }
}
