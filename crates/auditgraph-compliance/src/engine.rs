//! Rule evaluation, scoring and the single-pass fix loop.

use async_trait::async_trait;
use auditgraph_ai::{AgentPipeline, ReportBrief};
use auditgraph_core::{
    AuditGraphError, ComplianceSettings, Report, ReportContext, ReportType, Result, RuleId,
    Section, Severity, SystemIssue, Violation,
};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::rules::{compile_patterns, ComplianceRule, ValidationKind};
use crate::semantic::SemanticJudge;
use crate::structural::{run_check, ParsedSection, StructuralPredicate};

/// A negation at most two words before the end of the text.
static NEGATED_TAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:not|no|never|cannot|nor|without)\b(?:\W+\w+){0,2}\W*$")
        .expect("negation pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationType {
    /// Every rule kind, including collaborator-backed semantic rules.
    #[default]
    Full,
    /// Local rules only; no collaborator calls.
    Quick,
}

impl fmt::Display for ValidationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationType::Full => write!(f, "full"),
            ValidationType::Quick => write!(f, "quick"),
        }
    }
}

impl FromStr for ValidationType {
    type Err = AuditGraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(ValidationType::Full),
            "quick" => Ok(ValidationType::Quick),
            other => Err(AuditGraphError::Configuration(format!(
                "unknown validation type '{}', expected 'full' or 'quick'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub threshold: f64,
    pub semantic_min_confidence: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&ComplianceSettings::default())
    }
}

impl From<&ComplianceSettings> for EngineConfig {
    fn from(settings: &ComplianceSettings) -> Self {
        Self {
            threshold: settings.threshold,
            semantic_min_confidence: settings.semantic_min_confidence,
        }
    }
}

/// What the engine validates: the report metadata rules are scoped by and
/// the sections they are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct ValidationSubject<'a> {
    pub report_type: ReportType,
    pub entity_type: &'a str,
    pub context: &'a ReportContext,
    pub sections: &'a [Section],
}

impl<'a> From<&'a Report> for ValidationSubject<'a> {
    fn from(report: &'a Report) -> Self {
        Self {
            report_type: report.report_type,
            entity_type: &report.entity_type,
            context: &report.context,
            sections: &report.sections,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceOutcome {
    pub score: f64,
    pub compliant: bool,
    pub violations: Vec<Violation>,
    pub system_issues: Vec<SystemIssue>,
    /// Rules that were in scope and evaluated.
    pub applicable_rules: Vec<RuleId>,
    pub failed_rules: Vec<RuleId>,
}

impl ComplianceOutcome {
    pub fn has_critical(&self) -> bool {
        self.violations.iter().any(|v| v.severity == Severity::Critical)
    }
}

/// Produces one corrective regeneration of a section for fix mode.
#[async_trait]
pub trait SectionRepairer: Send + Sync {
    async fn repair(
        &self,
        sections: &[Section],
        section_name: &str,
        instructions: &str,
    ) -> Result<Section>;
}

/// Repairs sections by re-running the agent that produced them.
pub struct PipelineRepairer {
    pipeline: Arc<AgentPipeline>,
    brief: ReportBrief,
    deadline: Instant,
}

impl PipelineRepairer {
    pub fn new(pipeline: Arc<AgentPipeline>, brief: ReportBrief, deadline: Instant) -> Self {
        Self {
            pipeline,
            brief,
            deadline,
        }
    }
}

#[async_trait]
impl SectionRepairer for PipelineRepairer {
    async fn repair(
        &self,
        sections: &[Section],
        section_name: &str,
        instructions: &str,
    ) -> Result<Section> {
        self.pipeline
            .regenerate_section(&self.brief, sections, section_name, instructions, self.deadline)
            .await
    }
}

/// Result of a validation run in fix mode.
#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub initial: ComplianceOutcome,
    /// Outcome after the corrective pass; equal to `initial` when nothing was repaired.
    pub outcome: ComplianceOutcome,
    pub sections: Vec<Section>,
    pub repaired_sections: Vec<String>,
    /// One issue per section whose corrective regeneration failed. These are
    /// also part of `outcome.system_issues`.
    pub failed_repairs: Vec<SystemIssue>,
}

pub struct ComplianceEngine {
    config: EngineConfig,
    callables: HashMap<String, StructuralPredicate>,
    judge: Option<SemanticJudge>,
}

impl fmt::Debug for ComplianceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComplianceEngine")
            .field("config", &self.config)
            .field("callables", &self.callables.keys().collect::<Vec<_>>())
            .field("judge", &self.judge)
            .finish()
    }
}

impl ComplianceEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            callables: HashMap::new(),
            judge: None,
        }
    }

    pub fn with_judge(mut self, judge: SemanticJudge) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers a named structural predicate for `StructuralCheck::Custom`.
    pub fn register_check<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&ParsedSection) -> bool + Send + Sync + 'static,
    {
        self.callables.insert(name.into(), Arc::new(predicate));
    }

    /// Semantic rules whose judgement is still pending at `deadline` become
    /// system issues.
    pub async fn evaluate(
        &self,
        rules: &[ComplianceRule],
        subject: &ValidationSubject<'_>,
        validation_type: ValidationType,
        deadline: Instant,
    ) -> ComplianceOutcome {
        let mut violations = Vec::new();
        let mut system_issues = Vec::new();
        let mut applicable_rules = Vec::new();
        let mut failed_rules = Vec::new();
        let mut total_weight: f64 = 0.0;
        let mut failed_weight: f64 = 0.0;

        for rule in rules {
            if !rule.enabled
                || !rule
                    .scope
                    .applies_to(subject.report_type, subject.entity_type, subject.context)
            {
                continue;
            }
            if validation_type == ValidationType::Quick && rule.kind.is_semantic() {
                debug!(rule = %rule.id, "semantic rule skipped in quick validation");
                continue;
            }

            let targets = targets_for(rule, subject.sections);
            match self.evaluate_rule(rule, &targets, deadline).await {
                Ok(found) => {
                    total_weight += rule.weight;
                    applicable_rules.push(rule.id.clone());
                    if !found.is_empty() {
                        debug!(rule = %rule.id, violations = found.len(), "rule failed");
                        failed_weight += rule.weight;
                        failed_rules.push(rule.id.clone());
                        violations.extend(found);
                    }
                }
                Err(issue) => {
                    warn!(rule = %rule.id, "rule skipped: {}", issue.message);
                    system_issues.push(issue);
                }
            }
        }

        let score = if total_weight > 0.0 {
            (1.0 - failed_weight / total_weight).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let critical = violations.iter().any(|v| v.severity == Severity::Critical);
        let compliant = score >= self.config.threshold && !critical;

        info!(
            score,
            compliant,
            violations = violations.len(),
            system_issues = system_issues.len(),
            %validation_type,
            "compliance evaluation completed"
        );

        ComplianceOutcome {
            score,
            compliant,
            violations,
            system_issues,
            applicable_rules,
            failed_rules,
        }
    }

    /// Evaluates, and when repairable violations exist, regenerates each affected
    /// section exactly once and evaluates a second and final time. A section
    /// whose regeneration fails keeps its content and is reported as a system
    /// issue.
    pub async fn validate_and_fix(
        &self,
        rules: &[ComplianceRule],
        subject: &ValidationSubject<'_>,
        validation_type: ValidationType,
        repairer: &dyn SectionRepairer,
        deadline: Instant,
    ) -> FixOutcome {
        let initial = self.evaluate(rules, subject, validation_type, deadline).await;

        let repairable: HashMap<&str, &ComplianceRule> = rules
            .iter()
            .filter(|r| r.kind.supports_repair())
            .map(|r| (r.id.as_str(), r))
            .collect();
        let mut by_section: BTreeMap<&str, Vec<&Violation>> = BTreeMap::new();
        for violation in &initial.violations {
            if repairable.contains_key(violation.rule_id.as_str()) {
                by_section.entry(violation.section.as_str()).or_default().push(violation);
            }
        }

        let mut sections = subject.sections.to_vec();
        if by_section.is_empty() {
            return FixOutcome {
                outcome: initial.clone(),
                initial,
                sections,
                repaired_sections: Vec::new(),
                failed_repairs: Vec::new(),
            };
        }

        let mut repaired_sections = Vec::new();
        let mut failed_repairs = Vec::new();
        for (name, findings) in &by_section {
            let instructions = findings
                .iter()
                .map(|v| match &v.suggested_fix {
                    Some(fix) => format!("- [{}] {} Fix: {}", v.severity, v.message, fix),
                    None => format!("- [{}] {}", v.severity, v.message),
                })
                .collect::<Vec<_>>()
                .join("\n");

            match repairer.repair(&sections, name, &instructions).await {
                Ok(revised) => {
                    match sections.iter_mut().find(|s| s.name == *name) {
                        Some(existing) => *existing = revised,
                        None => sections.push(revised),
                    }
                    repaired_sections.push(name.to_string());
                }
                Err(e) => {
                    warn!(section = name, "corrective regeneration failed: {}", e);
                    failed_repairs.push(SystemIssue {
                        rule_id: findings[0].rule_id.clone(),
                        section: Some(name.to_string()),
                        message: format!("corrective regeneration failed: {}", e),
                    });
                }
            }
        }

        let mut outcome = if repaired_sections.is_empty() {
            initial.clone()
        } else {
            let revised = ValidationSubject {
                sections: &sections,
                ..*subject
            };
            self.evaluate(rules, &revised, validation_type, deadline).await
        };
        outcome.system_issues.extend(failed_repairs.iter().cloned());
        info!(
            repaired = repaired_sections.len(),
            failed = failed_repairs.len(),
            initial_score = initial.score,
            final_score = outcome.score,
            "fix pass completed"
        );

        FixOutcome {
            initial,
            outcome,
            sections,
            repaired_sections,
            failed_repairs,
        }
    }

    /// Violations of one rule across its target sections, or the system issue
    /// that made the rule impossible to evaluate.
    async fn evaluate_rule(
        &self,
        rule: &ComplianceRule,
        targets: &[(String, &str)],
        deadline: Instant,
    ) -> std::result::Result<Vec<Violation>, SystemIssue> {
        let issue = |section: Option<&str>, message: String| SystemIssue {
            rule_id: rule.id.clone(),
            section: section.map(str::to_string),
            message,
        };
        let mut found = Vec::new();

        match &rule.kind {
            ValidationKind::Pattern { required, forbidden } => {
                let required =
                    compile_patterns(&rule.id, required).map_err(|e| issue(None, e.to_string()))?;
                let forbidden =
                    compile_patterns(&rule.id, forbidden).map_err(|e| issue(None, e.to_string()))?;
                for (section, text) in targets {
                    for re in &required {
                        if !re.is_match(text) {
                            found.push(violation(
                                rule,
                                section,
                                format!("required pattern '{}' not found", re.as_str()),
                            ));
                        }
                    }
                    for re in &forbidden {
                        if let Some(m) = re.find(text) {
                            found.push(violation(
                                rule,
                                section,
                                format!("forbidden text '{}' present", m.as_str()),
                            ));
                        }
                    }
                }
            }
            ValidationKind::ProhibitedPhrase { phrases } => {
                let compiled = phrases
                    .iter()
                    .map(|p| phrase_regex(p).map(|re| (p, re)))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| issue(None, format!("invalid phrase: {}", e)))?;
                for (section, text) in targets {
                    for (phrase, re) in &compiled {
                        if affirms_phrase(re, text) {
                            found.push(violation(
                                rule,
                                section,
                                format!("prohibited phrase '{}' used", phrase),
                            ));
                        }
                    }
                }
            }
            ValidationKind::Structural { check } => {
                for (section, text) in targets {
                    let parsed = ParsedSection::parse(text);
                    match run_check(check, &parsed, &self.callables) {
                        Ok(Some(detail)) => found.push(violation(rule, section, detail)),
                        Ok(None) => {}
                        Err(name) => {
                            return Err(issue(
                                None,
                                format!("unknown structural callable '{}'", name),
                            ))
                        }
                    }
                }
            }
            ValidationKind::Semantic {
                principle,
                min_confidence,
            } => {
                let judge = self
                    .judge
                    .as_ref()
                    .ok_or_else(|| issue(None, "no semantic judge configured".to_string()))?;
                let floor = min_confidence.unwrap_or(self.config.semantic_min_confidence);
                for (section, text) in targets {
                    let verdict = judge
                        .judge(&rule.id, principle, text, deadline)
                        .await
                        .map_err(|e| issue(Some(section.as_str()), e.to_string()))?;
                    if !verdict.satisfied || verdict.confidence < floor {
                        found.push(violation(
                            rule,
                            section,
                            format!(
                                "principle '{}' not satisfied (satisfied={}, confidence {:.2} < required {:.2}){}",
                                principle,
                                verdict.satisfied,
                                verdict.confidence,
                                floor,
                                if verdict.rationale.is_empty() {
                                    String::new()
                                } else {
                                    format!(": {}", verdict.rationale)
                                }
                            ),
                        ));
                    }
                }
            }
        }
        Ok(found)
    }
}

/// Sections a rule is evaluated against. A section named in the scope but
/// absent from the report is evaluated as empty text.
fn targets_for<'s>(rule: &ComplianceRule, sections: &'s [Section]) -> Vec<(String, &'s str)> {
    if rule.scope.sections.is_empty() {
        return sections
            .iter()
            .map(|s| (s.name.clone(), s.content.as_str()))
            .collect();
    }
    rule.scope
        .sections
        .iter()
        .map(|name| {
            let content = sections
                .iter()
                .find(|s| &s.name == name)
                .map(|s| s.content.as_str())
                .unwrap_or("");
            (name.clone(), content)
        })
        .collect()
}

fn phrase_regex(phrase: &str) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(&format!(r"\b{}\b", regex::escape(phrase.trim())))
        .case_insensitive(true)
        .build()
}

/// True when some occurrence of the phrase is not negated, so "not absolute
/// assurance" passes while "we provide absolute assurance" does not.
fn affirms_phrase(re: &Regex, text: &str) -> bool {
    re.find_iter(text)
        .any(|m| !NEGATED_TAIL.is_match(&text[..m.start()]))
}

fn violation(rule: &ComplianceRule, section: &str, detail: String) -> Violation {
    Violation {
        rule_id: rule.id.clone(),
        severity: rule.severity,
        section: section.to_string(),
        message: if rule.message.is_empty() {
            detail
        } else {
            format!("{} ({})", rule.message, detail)
        },
        suggested_fix: rule.suggested_fix.clone(),
        regulatory_source: rule.regulatory_source.clone(),
    }
}
