//! Declarative compliance rule definitions.

use auditgraph_core::{
    AuditGraphError, ReportContext, ReportType, Result, RuleId, Severity, StandardId,
};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Built-in structural predicates. `Custom` names a callable registered on the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum StructuralCheck {
    MinWords { min: usize },
    MaxWords { max: usize },
    MinParagraphs { min: usize },
    RequiresHeading { heading: String },
    Custom { name: String },
}

/// How a rule decides whether a section passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationKind {
    /// Every `required` regex must match and no `forbidden` regex may match.
    Pattern {
        #[serde(default)]
        required: Vec<String>,
        #[serde(default)]
        forbidden: Vec<String>,
    },
    Structural { check: StructuralCheck },
    ProhibitedPhrase { phrases: Vec<String> },
    /// Delegated to the generation collaborator.
    Semantic {
        principle: String,
        #[serde(default)]
        min_confidence: Option<f32>,
    },
}

impl ValidationKind {
    /// Whether a corrective regeneration can plausibly fix a failure of this kind.
    pub fn supports_repair(&self) -> bool {
        matches!(
            self,
            ValidationKind::Pattern { .. }
                | ValidationKind::ProhibitedPhrase { .. }
                | ValidationKind::Semantic { .. }
        )
    }

    pub fn is_semantic(&self) -> bool {
        matches!(self, ValidationKind::Semantic { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ValidationKind::Pattern { .. } => "pattern",
            ValidationKind::Structural { .. } => "structural",
            ValidationKind::ProhibitedPhrase { .. } => "prohibited_phrase",
            ValidationKind::Semantic { .. } => "semantic",
        }
    }
}

/// Where a rule applies. Empty lists mean "any".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleScope {
    #[serde(default)]
    pub sections: Vec<String>,
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub report_types: Vec<ReportType>,
    /// Context flag that must be set for the rule to apply.
    #[serde(default)]
    pub applies_when: Option<String>,
}

impl RuleScope {
    pub fn applies_to(
        &self,
        report_type: ReportType,
        entity_type: &str,
        context: &ReportContext,
    ) -> bool {
        (self.report_types.is_empty() || self.report_types.contains(&report_type))
            && (self.entity_types.is_empty()
                || self
                    .entity_types
                    .iter()
                    .any(|e| e.eq_ignore_ascii_case(entity_type)))
            && self
                .applies_when
                .as_deref()
                .map_or(true, |flag| context.flag(flag))
    }

    pub fn covers_section(&self, name: &str) -> bool {
        self.sections.is_empty() || self.sections.iter().any(|s| s == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRule {
    pub id: RuleId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    #[serde(default = "ComplianceRule::default_weight")]
    pub weight: f64,
    #[serde(flatten)]
    pub kind: ValidationKind,
    #[serde(default)]
    pub scope: RuleScope,
    #[serde(default)]
    pub regulatory_source: Option<StandardId>,
    /// Violation message; a generated description is used when empty.
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub suggested_fix: Option<String>,
    #[serde(default = "ComplianceRule::default_enabled")]
    pub enabled: bool,
}

impl ComplianceRule {
    fn default_weight() -> f64 {
        1.0
    }

    fn default_enabled() -> bool {
        true
    }

    pub fn new(
        id: impl Into<RuleId>,
        name: impl Into<String>,
        severity: Severity,
        kind: ValidationKind,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            severity,
            weight: Self::default_weight(),
            kind,
            scope: RuleScope::default(),
            regulatory_source: None,
            message: String::new(),
            suggested_fix: None,
            enabled: true,
        }
    }

    pub fn requiring(
        id: impl Into<RuleId>,
        name: impl Into<String>,
        severity: Severity,
        pattern: &str,
    ) -> Self {
        Self::new(
            id,
            name,
            severity,
            ValidationKind::Pattern {
                required: vec![pattern.to_string()],
                forbidden: Vec::new(),
            },
        )
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn in_sections<I, S>(mut self, sections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope.sections = sections.into_iter().map(Into::into).collect();
        self
    }

    pub fn for_report_types(mut self, report_types: impl IntoIterator<Item = ReportType>) -> Self {
        self.scope.report_types = report_types.into_iter().collect();
        self
    }

    pub fn for_entity_types<I, S>(mut self, entity_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope.entity_types = entity_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn when_flag(mut self, flag: impl Into<String>) -> Self {
        self.scope.applies_when = Some(flag.into());
        self
    }

    pub fn citing(mut self, standard: impl Into<StandardId>) -> Self {
        self.regulatory_source = Some(standard.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }

    /// Checks the definition itself. Regexes are compiled so a malformed rule
    /// is rejected when it is created rather than when it is first evaluated.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| AuditGraphError::ValidationFailure {
            rule_id: self.id.clone(),
            message,
        };
        if self.id.trim().is_empty() {
            return Err(invalid("rule id must not be empty".to_string()));
        }
        if !(self.weight > 0.0 && self.weight.is_finite()) {
            return Err(invalid(format!("weight must be positive, got {}", self.weight)));
        }
        match &self.kind {
            ValidationKind::Pattern { required, forbidden } => {
                if required.is_empty() && forbidden.is_empty() {
                    return Err(invalid("pattern rule has no patterns".to_string()));
                }
                compile_patterns(&self.id, required)?;
                compile_patterns(&self.id, forbidden)?;
            }
            ValidationKind::ProhibitedPhrase { phrases } if phrases.is_empty() => {
                return Err(invalid("prohibited-phrase rule has no phrases".to_string()));
            }
            ValidationKind::Semantic { principle, min_confidence } => {
                if principle.trim().is_empty() {
                    return Err(invalid("semantic rule has no principle".to_string()));
                }
                if let Some(c) = min_confidence {
                    if !(0.0..=1.0).contains(c) {
                        return Err(invalid(format!("min_confidence {} outside [0, 1]", c)));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for ComplianceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}, weight {})",
            self.severity,
            self.id,
            self.kind.label(),
            self.weight
        )
    }
}

/// Compiles rule patterns case-insensitively.
pub(crate) fn compile_patterns(rule_id: &str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| AuditGraphError::ValidationFailure {
                    rule_id: rule_id.to_string(),
                    message: format!("invalid pattern '{}': {}", p, e),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_matching() {
        let rule =
            ComplianceRule::requiring("GC", "Going concern", Severity::Medium, "going concern")
                .in_sections(["going_concern"])
                .for_report_types([ReportType::AuditOpinion])
                .when_flag("going_concern_doubt");

        let doubt = ReportContext::new("Acme").with_flag("going_concern_doubt", true);
        let no_doubt = ReportContext::new("Acme");
        assert!(rule.scope.applies_to(ReportType::AuditOpinion, "public_company", &doubt));
        assert!(!rule.scope.applies_to(ReportType::AuditOpinion, "public_company", &no_doubt));
        assert!(!rule.scope.applies_to(ReportType::Compilation, "public_company", &doubt));
        assert!(rule.scope.covers_section("going_concern"));
        assert!(!rule.scope.covers_section("opinion"));
    }

    #[test]
    fn validate_rejects_malformed_definitions() {
        let bad_regex = ComplianceRule::requiring("R1", "bad", Severity::Low, "(unclosed");
        assert!(matches!(
            bad_regex.validate(),
            Err(AuditGraphError::ValidationFailure { .. })
        ));

        let zero_weight =
            ComplianceRule::requiring("R2", "zero", Severity::Low, "x").with_weight(0.0);
        assert!(zero_weight.validate().is_err());

        let ok = ComplianceRule::requiring("R3", "ok", Severity::Low, r"\bopinion\b");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn deserializes_flattened_kind() {
        let json = r#"{
            "id": "NO-GUARANTEE",
            "name": "No guarantees",
            "severity": "HIGH",
            "kind": "prohibited_phrase",
            "phrases": ["guarantee"],
            "scope": {"report_types": ["audit_opinion"]}
        }"#;
        let rule: ComplianceRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.weight, 1.0);
        assert!(rule.enabled);
        assert!(rule.kind.supports_repair());
        assert_eq!(rule.scope.report_types, vec![ReportType::AuditOpinion]);
    }
}
