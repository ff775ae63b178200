//! Forward-only report lifecycle.
//!
//! ```text
//! draft ──validate──▶ validated ──approve──▶ approved ──issue──▶ issued
//!                      │     ▲
//!   request_revision   ▼     │ validate
//!                  needs_revision (revise_section)
//! ```
//!
//! Every function here either applies a complete transition to the report or
//! returns an error and leaves it untouched.

use auditgraph_compliance::ComplianceOutcome;
use auditgraph_core::{
    ApprovalRecord, AuditGraphError, CitationReport, CriticalOverride, LifecycleSettings, Report,
    ReportStatus, Result, RevisionNote, Section, Severity,
};
use chrono::Utc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    pub approval_threshold: f64,
    pub allow_critical_override: bool,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self::from(&LifecycleSettings::default())
    }
}

impl From<&LifecycleSettings> for ApprovalPolicy {
    fn from(settings: &LifecycleSettings) -> Self {
        Self {
            approval_threshold: settings.approval_threshold,
            allow_critical_override: settings.allow_critical_override,
        }
    }
}

/// Fails with a `StateTransition` error unless the report is in one of `allowed`.
pub fn ensure_state(
    report: &Report,
    transition: &'static str,
    allowed: &[ReportStatus],
) -> Result<()> {
    if allowed.contains(&report.status) {
        Ok(())
    } else {
        Err(AuditGraphError::StateTransition {
            transition,
            current: report.status,
            required: allowed.to_vec(),
        })
    }
}

pub const VALIDATABLE: [ReportStatus; 3] = [
    ReportStatus::Draft,
    ReportStatus::Validated,
    ReportStatus::NeedsRevision,
];

/// Records compliance and citation results and moves the report to `validated`,
/// whether or not it is compliant.
pub fn record_validation(
    report: &mut Report,
    sections: Vec<Section>,
    outcome: ComplianceOutcome,
    citations: CitationReport,
) -> Result<()> {
    ensure_state(report, "validate", &VALIDATABLE)?;
    let from = report.status;
    let now = Utc::now();

    report.sections = sections;
    report.compliance_score = Some(outcome.score.clamp(0.0, 1.0));
    report.compliant = Some(outcome.compliant);
    report.violations = outcome.violations;
    report.system_issues = outcome.system_issues;
    report.citation_report = Some(citations);
    report.status = ReportStatus::Validated;
    report.validated_at = Some(now);
    report.updated_at = now;

    log_transition(report, from);
    Ok(())
}

pub fn request_revision(report: &mut Report, reason: &str) -> Result<()> {
    ensure_state(report, "request revision for", &[ReportStatus::Validated])?;
    let from = report.status;
    let now = Utc::now();
    report.revision_notes.push(RevisionNote {
        requested_at: now,
        reason: reason.to_string(),
    });
    report.status = ReportStatus::NeedsRevision;
    report.updated_at = now;
    log_transition(report, from);
    Ok(())
}

/// Replaces a section's content. The status stays `needs_revision` until the
/// report is validated again.
pub fn revise_section(report: &mut Report, section_name: &str, content: &str) -> Result<()> {
    ensure_state(report, "revise", &[ReportStatus::NeedsRevision])?;
    let section = report
        .section_mut(section_name)
        .ok_or_else(|| AuditGraphError::NotFound(format!("section '{}'", section_name)))?;
    section.replace_content(content);
    section.agent_id = "manual_revision".to_string();
    report.updated_at = Utc::now();
    info!(report_id = %report.id, section = section_name, "section revised");
    Ok(())
}

/// Approves a validated report.
///
/// The score must reach the approval threshold. Any CRITICAL violation blocks
/// approval unless `override_justification` is given and the policy allows
/// overrides; the override is recorded on the approval.
pub fn approve(
    report: &mut Report,
    approver_id: &str,
    override_justification: Option<&str>,
    policy: &ApprovalPolicy,
) -> Result<()> {
    ensure_state(report, "approve", &[ReportStatus::Validated])?;
    if approver_id.trim().is_empty() {
        return Err(AuditGraphError::ApprovalBlocked("approver id is required".to_string()));
    }

    let score = report.compliance_score.ok_or_else(|| {
        AuditGraphError::ApprovalBlocked("report has no compliance score".to_string())
    })?;
    if score < policy.approval_threshold {
        return Err(AuditGraphError::ApprovalBlocked(format!(
            "compliance score {:.3} is below the approval threshold {:.3}",
            score, policy.approval_threshold
        )));
    }

    let critical: Vec<String> = report
        .violations
        .iter()
        .filter(|v| v.severity == Severity::Critical)
        .map(|v| v.rule_id.clone())
        .collect();
    let critical_override = if critical.is_empty() {
        None
    } else {
        let justification = override_justification
            .map(str::trim)
            .filter(|j| !j.is_empty())
            .ok_or_else(|| {
                AuditGraphError::ApprovalBlocked(format!(
                    "CRITICAL violations of {} require a recorded override",
                    critical.join(", ")
                ))
            })?;
        if !policy.allow_critical_override {
            return Err(AuditGraphError::ApprovalBlocked(format!(
                "CRITICAL violations of {} cannot be overridden under the current policy",
                critical.join(", ")
            )));
        }
        Some(CriticalOverride {
            approver_id: approver_id.to_string(),
            justification: justification.to_string(),
            overridden_rules: critical,
        })
    };

    let from = report.status;
    let now = Utc::now();
    if let Some(o) = &critical_override {
        info!(
            report_id = %report.id,
            approver = approver_id,
            rules = ?o.overridden_rules,
            "CRITICAL violations overridden at approval"
        );
    }
    report.approval = Some(ApprovalRecord {
        approver_id: approver_id.to_string(),
        approved_at: now,
        score_at_approval: score,
        critical_override,
    });
    report.status = ReportStatus::Approved;
    report.updated_at = now;
    log_transition(report, from);
    Ok(())
}

/// Issues an approved report under `report_number`. Terminal.
pub fn issue(report: &mut Report, report_number: String) -> Result<()> {
    ensure_state(report, "issue", &[ReportStatus::Approved])?;
    let from = report.status;
    let now = Utc::now();
    report.report_number = Some(report_number);
    report.issued_at = Some(now);
    report.status = ReportStatus::Issued;
    report.updated_at = now;
    log_transition(report, from);
    Ok(())
}

fn log_transition(report: &Report, from: ReportStatus) {
    info!(
        report_id = %report.id,
        from = %from,
        to = %report.status,
        "report transition"
    );
}
