use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::citation::extract_citations;
use crate::error::AuditGraphError;

pub type StandardId = String;
pub type RuleId = String;
pub type ReportId = Uuid;

// ---------------------------------------------------------------------------
// Standards
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Supersedes,
    CorrespondsTo,
    References,
    Implements,
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelationshipKind::Supersedes => "supersedes",
            RelationshipKind::CorrespondsTo => "corresponds_to",
            RelationshipKind::References => "references",
            RelationshipKind::Implements => "implements",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: RelationshipKind,
    pub target: StandardId,
}

/// A codified regulatory or auditing requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standard {
    pub id: StandardId,
    pub issuing_body: String,
    /// Citation text as it appears in documents, e.g. `AS 2110`.
    pub number: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub supersedes: Vec<StandardId>,
    #[serde(default)]
    pub superseded_by: Option<StandardId>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl Standard {
    pub fn new(
        id: impl Into<StandardId>,
        issuing_body: impl Into<String>,
        number: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            issuing_body: issuing_body.into(),
            number: number.into(),
            title: String::new(),
            supersedes: Vec::new(),
            superseded_by: None,
            relationships: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn superseding(mut self, id: impl Into<StandardId>) -> Self {
        self.supersedes.push(id.into());
        self
    }

    pub fn is_current(&self) -> bool {
        self.superseded_by.is_none()
    }
}

// ---------------------------------------------------------------------------
// Report metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    AuditOpinion,
    ReviewEngagement,
    AgreedUponProcedures,
    Compilation,
    InternalControl,
}

impl ReportType {
    /// Prefix used in issued report numbers.
    pub fn number_prefix(&self) -> &'static str {
        match self {
            ReportType::AuditOpinion => "AUD",
            ReportType::ReviewEngagement => "REV",
            ReportType::AgreedUponProcedures => "AUP",
            ReportType::Compilation => "CMP",
            ReportType::InternalControl => "ICR",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::AuditOpinion => "audit_opinion",
            ReportType::ReviewEngagement => "review_engagement",
            ReportType::AgreedUponProcedures => "agreed_upon_procedures",
            ReportType::Compilation => "compilation",
            ReportType::InternalControl => "internal_control",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportType {
    type Err = AuditGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "audit_opinion" | "audit" => Ok(ReportType::AuditOpinion),
            "review_engagement" | "review" => Ok(ReportType::ReviewEngagement),
            "agreed_upon_procedures" | "aup" => Ok(ReportType::AgreedUponProcedures),
            "compilation" => Ok(ReportType::Compilation),
            "internal_control" | "icfr" => Ok(ReportType::InternalControl),
            other => Err(AuditGraphError::NotFound(format!("report type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMethod {
    #[default]
    Pipeline,
    SelfConsistency,
}

/// Engagement facts the generation agents and the rule engine condition on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportContext {
    pub entity_name: String,
    #[serde(default)]
    pub period_end: Option<NaiveDate>,
    /// Boolean conditions such as `going_concern_doubt`.
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
}

impl ReportContext {
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            ..Default::default()
        }
    }

    pub fn with_flag(mut self, flag: impl Into<String>, value: bool) -> Self {
        self.flags.insert(flag.into(), value);
        self
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.facts.insert(key.into(), value.into());
        self
    }

    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Sections, violations, citations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub citations: Vec<String>,
    pub agent_id: String,
    #[serde(default)]
    pub degraded: bool,
}

impl Section {
    pub fn new(
        name: impl Into<String>,
        content: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            name: name.into(),
            citations: extract_citations(&content),
            content,
            agent_id: agent_id.into(),
            degraded: false,
        }
    }

    pub fn degraded(name: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: String::new(),
            citations: Vec::new(),
            agent_id: agent_id.into(),
            degraded: true,
        }
    }

    pub fn replace_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.citations = extract_citations(&self.content);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: RuleId,
    pub severity: Severity,
    pub section: String,
    pub message: String,
    #[serde(default)]
    pub suggested_fix: Option<String>,
    #[serde(default)]
    pub regulatory_source: Option<StandardId>,
}

/// A rule that could not be evaluated. Reported separately from violations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemIssue {
    pub rule_id: RuleId,
    #[serde(default)]
    pub section: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationRecord {
    pub raw: String,
    pub section: String,
    pub standard_id: Option<StandardId>,
    pub valid: bool,
    pub current: bool,
    #[serde(default)]
    pub superseded_by: Option<StandardId>,
    #[serde(default)]
    pub superseded_by_number: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CitationReport {
    pub records: Vec<CitationRecord>,
    /// Knowledge graph version the records were resolved against.
    pub graph_version: u64,
}

impl CitationReport {
    pub fn total(&self) -> usize {
        self.records.len()
    }

    pub fn invalid(&self) -> Vec<&CitationRecord> {
        self.records.iter().filter(|r| !r.valid).collect()
    }

    pub fn superseded(&self) -> Vec<&CitationRecord> {
        self.records.iter().filter(|r| r.valid && !r.current).collect()
    }

    pub fn all_current(&self) -> bool {
        self.records.iter().all(|r| r.valid && r.current)
    }
}

// ---------------------------------------------------------------------------
// Self-consistency audit trail
// ---------------------------------------------------------------------------

/// One full pipeline run, as seen by the voter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSample {
    pub index: usize,
    /// Mean agent temperature used for this run.
    pub randomness: f32,
    pub sections: Vec<Section>,
    pub decisions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub key: String,
    pub value: String,
    pub votes: usize,
    /// votes / successful samples
    pub agreement: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SampleOutcome {
    Completed,
    Failed { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub index: usize,
    pub randomness: f32,
    #[serde(default)]
    pub decisions: BTreeMap<String, String>,
    pub outcome: SampleOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusAudit {
    pub requested_samples: usize,
    pub quorum: usize,
    pub selected_sample: usize,
    pub decisions: Vec<ConsensusDecision>,
    pub samples: Vec<SampleRecord>,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Draft,
    Validated,
    NeedsRevision,
    Approved,
    Issued,
}

impl ReportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Issued)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReportStatus::Draft => "draft",
            ReportStatus::Validated => "validated",
            ReportStatus::NeedsRevision => "needs_revision",
            ReportStatus::Approved => "approved",
            ReportStatus::Issued => "issued",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalOverride {
    pub approver_id: String,
    pub justification: String,
    #[serde(default)]
    pub overridden_rules: Vec<RuleId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approver_id: String,
    pub approved_at: DateTime<Utc>,
    pub score_at_approval: f64,
    #[serde(default)]
    pub critical_override: Option<CriticalOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionNote {
    pub requested_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub report_type: ReportType,
    pub entity_type: String,
    pub framework: String,
    pub context: ReportContext,
    pub generation_method: GenerationMethod,
    pub sections: Vec<Section>,
    pub status: ReportStatus,
    /// Always within [0, 1] once set.
    pub compliance_score: Option<f64>,
    pub compliant: Option<bool>,
    pub violations: Vec<Violation>,
    pub system_issues: Vec<SystemIssue>,
    pub citation_report: Option<CitationReport>,
    pub report_number: Option<String>,
    pub approval: Option<ApprovalRecord>,
    pub revision_notes: Vec<RevisionNote>,
    pub consensus: Option<ConsensusAudit>,
    /// Bumped on every committed transition; used for optimistic concurrency.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
    pub issued_at: Option<DateTime<Utc>>,
}

impl Report {
    pub fn new_draft(
        report_type: ReportType,
        entity_type: impl Into<String>,
        framework: impl Into<String>,
        context: ReportContext,
        generation_method: GenerationMethod,
        sections: Vec<Section>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            report_type,
            entity_type: entity_type.into(),
            framework: framework.into(),
            context,
            generation_method,
            sections,
            status: ReportStatus::Draft,
            compliance_score: None,
            compliant: None,
            violations: Vec::new(),
            system_issues: Vec::new(),
            citation_report: None,
            report_number: None,
            approval: None,
            revision_notes: Vec::new(),
            consensus: None,
            version: 0,
            created_at: now,
            updated_at: now,
            validated_at: None,
            issued_at: None,
        }
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_mut(&mut self, name: &str) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.name == name)
    }

    pub fn has_critical_violation(&self) -> bool {
        self.violations
            .iter()
            .any(|v| v.severity == Severity::Critical)
    }

    /// Full text of the report in section order.
    pub fn body(&self) -> String {
        self.sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_extracts_citations_on_creation_and_replacement() {
        let mut section = Section::new(
            "basis_for_opinion",
            "We conducted our audit in accordance with [AS 1101] and [AS 2110].",
            "basis_writer",
        );
        assert_eq!(section.citations, vec!["AS 1101", "AS 2110"]);

        section.replace_content("See [ISA 570 (Revised)].");
        assert_eq!(section.citations, vec!["ISA 570 (Revised)"]);
    }

    #[test]
    fn report_type_parses_aliases() {
        assert_eq!("audit".parse::<ReportType>().unwrap(), ReportType::AuditOpinion);
        assert_eq!(
            "Agreed-Upon-Procedures".parse::<ReportType>().unwrap(),
            ReportType::AgreedUponProcedures
        );
        assert!("memo".parse::<ReportType>().is_err());
    }

    #[test]
    fn severity_orders_by_impact() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"CRITICAL\""
        );
    }

    #[test]
    fn new_draft_has_empty_compliance_fields() {
        let report = Report::new_draft(
            ReportType::AuditOpinion,
            "public_company",
            "PCAOB",
            ReportContext::new("Acme Corp"),
            GenerationMethod::Pipeline,
            vec![],
        );
        assert_eq!(report.status, ReportStatus::Draft);
        assert!(report.compliance_score.is_none());
        assert!(report.citation_report.is_none());
        assert!(report.report_number.is_none());
        assert_eq!(report.version, 0);
    }
}
