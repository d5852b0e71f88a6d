//! Container risk scoring.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityStatus {
    Secure,
    Warning,
    Critical,
}

/// Inputs to the score.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskInput {
    pub unresolved_violations: u32,
    pub unresolved_critical: u32,
    pub unresolved_high: u32,
    pub critical_findings: u32,
    pub high_findings: u32,
    pub medium_findings: u32,
    pub privileged: bool,
    pub run_as_non_root: bool,
    pub read_only_root_filesystem: bool,
}

/// 10 per unresolved violation; 20/10/5 per critical/high/medium finding;
/// +50 privileged, +20 root, +10 writable rootfs. Capped at 100.
pub fn risk_score(input: &RiskInput) -> u8 {
    let mut score: u32 = 0;
    score += 10 * input.unresolved_violations;
    score += 20 * input.critical_findings;
    score += 10 * input.high_findings;
    score += 5 * input.medium_findings;
    if input.privileged {
        score += 50;
    }
    if !input.run_as_non_root {
        score += 20;
    }
    if !input.read_only_root_filesystem {
        score += 10;
    }
    score.min(100) as u8
}

/// ≥80 or any unresolved critical → CRITICAL; ≥50 or any unresolved high →
/// WARNING; else SECURE.
pub fn security_status(score: u8, input: &RiskInput) -> SecurityStatus {
    if score >= 80 || input.unresolved_critical > 0 {
        SecurityStatus::Critical
    } else if score >= 50 || input.unresolved_high > 0 {
        SecurityStatus::Warning
    } else {
        SecurityStatus::Secure
    }
}
