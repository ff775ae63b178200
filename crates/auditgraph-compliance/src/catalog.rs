//! Rule and rule-template administration.

use auditgraph_core::{AuditGraphError, ReportType, Result, RuleId, Severity, StandardId};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::info;

use crate::rules::{ComplianceRule, RuleScope, StructuralCheck, ValidationKind};

static PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("parameter pattern is valid"));

/// A parameterized rule definition. `{{name}}` placeholders in patterns,
/// phrases, principles, headings, section names, message and fix are
/// substituted on instantiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    #[serde(default = "RuleTemplate::default_weight")]
    pub weight: f64,
    #[serde(flatten)]
    pub kind: ValidationKind,
    #[serde(default)]
    pub scope: RuleScope,
    #[serde(default)]
    pub regulatory_source: Option<StandardId>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub suggested_fix: Option<String>,
}

impl RuleTemplate {
    fn default_weight() -> f64 {
        1.0
    }

    /// Placeholder names in order of first appearance.
    pub fn parameters(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for text in self.texts() {
            for caps in PARAM.captures_iter(text) {
                if seen.insert(caps[1].to_string()) {
                    out.push(caps[1].to_string());
                }
            }
        }
        out
    }

    fn texts(&self) -> Vec<&str> {
        let mut texts: Vec<&str> = vec![self.message.as_str()];
        if let Some(fix) = &self.suggested_fix {
            texts.push(fix);
        }
        texts.extend(self.scope.sections.iter().map(String::as_str));
        match &self.kind {
            ValidationKind::Pattern { required, forbidden } => {
                texts.extend(required.iter().chain(forbidden).map(String::as_str))
            }
            ValidationKind::ProhibitedPhrase { phrases } => {
                texts.extend(phrases.iter().map(String::as_str))
            }
            ValidationKind::Semantic { principle, .. } => texts.push(principle),
            ValidationKind::Structural { check } => match check {
                StructuralCheck::RequiresHeading { heading } => texts.push(heading),
                StructuralCheck::Custom { name } => texts.push(name),
                _ => {}
            },
        }
        texts
    }

    pub fn instantiate(
        &self,
        rule_id: impl Into<RuleId>,
        params: &HashMap<String, String>,
    ) -> Result<ComplianceRule> {
        let rule_id = rule_id.into();
        let missing: Vec<String> = self
            .parameters()
            .into_iter()
            .filter(|p| !params.contains_key(p))
            .collect();
        if !missing.is_empty() {
            return Err(AuditGraphError::ValidationFailure {
                rule_id,
                message: format!(
                    "template '{}' is missing parameters: {}",
                    self.id,
                    missing.join(", ")
                ),
            });
        }

        let fill = |text: &str| -> String {
            PARAM
                .replace_all(text, |caps: &Captures| {
                    params.get(&caps[1]).cloned().unwrap_or_default()
                })
                .into_owned()
        };
        let fill_all = |texts: &[String]| texts.iter().map(|t| fill(t)).collect::<Vec<_>>();

        let kind = match &self.kind {
            ValidationKind::Pattern { required, forbidden } => ValidationKind::Pattern {
                required: fill_all(required),
                forbidden: fill_all(forbidden),
            },
            ValidationKind::ProhibitedPhrase { phrases } => ValidationKind::ProhibitedPhrase {
                phrases: fill_all(phrases),
            },
            ValidationKind::Semantic {
                principle,
                min_confidence,
            } => ValidationKind::Semantic {
                principle: fill(principle),
                min_confidence: *min_confidence,
            },
            ValidationKind::Structural { check } => ValidationKind::Structural {
                check: match check {
                    StructuralCheck::RequiresHeading { heading } => {
                        StructuralCheck::RequiresHeading {
                            heading: fill(heading),
                        }
                    }
                    StructuralCheck::Custom { name } => {
                        StructuralCheck::Custom { name: fill(name) }
                    }
                    other => other.clone(),
                },
            },
        };

        let rule = ComplianceRule {
            id: rule_id,
            name: fill(&self.name),
            description: fill(&self.description),
            severity: self.severity,
            weight: self.weight,
            kind,
            scope: RuleScope {
                sections: fill_all(&self.scope.sections),
                ..self.scope.clone()
            },
            regulatory_source: self.regulatory_source.clone(),
            message: fill(&self.message),
            suggested_fix: self.suggested_fix.as_deref().map(|s| fill(s)),
            enabled: true,
        };
        rule.validate()?;
        Ok(rule)
    }
}

/// Rules and templates, administered out of band and read during validation.
#[derive(Debug, Default)]
pub struct RuleCatalog {
    rules: RwLock<BTreeMap<RuleId, ComplianceRule>>,
    templates: RwLock<BTreeMap<String, RuleTemplate>>,
}

impl RuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the built-in rules and templates.
    pub fn with_builtins() -> Result<Self> {
        let catalog = Self::new();
        for template in builtin_templates() {
            catalog.create_template(template)?;
        }
        for rule in builtin_rules() {
            catalog.add_rule(rule)?;
        }
        Ok(catalog)
    }

    pub fn add_rule(&self, rule: ComplianceRule) -> Result<()> {
        rule.validate()?;
        let mut rules = self.rules.write();
        if rules.contains_key(&rule.id) {
            return Err(AuditGraphError::ValidationFailure {
                rule_id: rule.id.clone(),
                message: "a rule with this id already exists".to_string(),
            });
        }
        info!(rule = %rule.id, kind = rule.kind.label(), "compliance rule added");
        rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn rule(&self, id: &str) -> Option<ComplianceRule> {
        self.rules.read().get(id).cloned()
    }

    /// All rules ordered by id, optionally restricted to those that can apply
    /// to `report_type`.
    pub fn list_rules(&self, report_type: Option<ReportType>) -> Vec<ComplianceRule> {
        self.rules
            .read()
            .values()
            .filter(|r| match report_type {
                Some(t) => r.scope.report_types.is_empty() || r.scope.report_types.contains(&t),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn create_template(&self, template: RuleTemplate) -> Result<()> {
        if template.id.trim().is_empty() {
            return Err(AuditGraphError::Configuration("template id must not be empty".to_string()));
        }
        let mut templates = self.templates.write();
        if templates.contains_key(&template.id) {
            return Err(AuditGraphError::Configuration(format!(
                "rule template '{}' already exists",
                template.id
            )));
        }
        info!(template = %template.id, "rule template created");
        templates.insert(template.id.clone(), template);
        Ok(())
    }

    pub fn list_templates(&self) -> Vec<RuleTemplate> {
        self.templates.read().values().cloned().collect()
    }

    /// Instantiates a template and adds the resulting rule to the catalog.
    pub fn create_rule_from_template(
        &self,
        template_id: &str,
        rule_id: impl Into<RuleId>,
        params: &HashMap<String, String>,
    ) -> Result<ComplianceRule> {
        let template = self
            .templates
            .read()
            .get(template_id)
            .cloned()
            .ok_or_else(|| AuditGraphError::NotFound(format!("rule template '{}'", template_id)))?;
        let rule = template.instantiate(rule_id, params)?;
        self.add_rule(rule.clone())?;
        Ok(rule)
    }
}

/// Rules every audit opinion is checked against.
pub fn builtin_rules() -> Vec<ComplianceRule> {
    let audit = [ReportType::AuditOpinion];
    vec![
        ComplianceRule::requiring(
            "AUD-OPN-001",
            "Explicit opinion statement",
            Severity::Critical,
            r"\bin\s+our\s+opinion\b|\bwe\s+do\s+not\s+express\s+an\s+opinion\b",
        )
        .with_weight(3.0)
        .in_sections(["opinion"])
        .for_report_types(audit)
        .citing("AS-3101")
        .with_message("The opinion section must state the auditor's opinion")
        .with_fix("Begin the opinion paragraph with \"In our opinion,\"."),
        ComplianceRule::requiring(
            "AUD-GC-001",
            "Going concern disclosure",
            Severity::Medium,
            r"\bgoing\s+concern\b",
        )
        .in_sections(["going_concern"])
        .for_report_types(audit)
        .when_flag("going_concern_doubt")
        .citing("AS-2415")
        .with_message("Substantial doubt exists but the going concern section does not say so")
        .with_fix(
            "Describe the conditions that raise substantial doubt about the entity's ability \
             to continue as a going concern.",
        ),
        ComplianceRule::requiring(
            "AUD-BAS-001",
            "Independence statement",
            Severity::High,
            r"\bindependent\b",
        )
        .with_weight(2.0)
        .in_sections(["basis_for_opinion"])
        .for_report_types(audit)
        .citing("AS-3101")
        .with_message("The basis for opinion must state that the auditor is independent")
        .with_fix("State that the firm is required to be independent with respect to the entity."),
        ComplianceRule::new(
            "GEN-PHR-001",
            "No absolute assurance language",
            Severity::High,
            ValidationKind::ProhibitedPhrase {
                phrases: vec![
                    "absolute assurance".to_string(),
                    "we guarantee".to_string(),
                    "guaranteed to be accurate".to_string(),
                    "100% accurate".to_string(),
                    "free from all errors".to_string(),
                ],
            },
        )
        .with_weight(2.0)
        .with_message("Reports must not promise absolute assurance")
        .with_fix("Refer to reasonable assurance instead."),
        ComplianceRule::new(
            "AUD-RSP-001",
            "Separate responsibility paragraphs",
            Severity::Low,
            ValidationKind::Structural {
                check: StructuralCheck::MinParagraphs { min: 2 },
            },
        )
        .with_weight(0.5)
        .in_sections(["responsibilities"])
        .for_report_types(audit)
        .with_message("Management and auditor responsibilities should be described separately"),
        ComplianceRule::new(
            "AUD-SUM-001",
            "Concise executive summary",
            Severity::Low,
            ValidationKind::Structural {
                check: StructuralCheck::MaxWords { max: 400 },
            },
        )
        .with_weight(0.5)
        .in_sections(["executive_summary"])
        .for_report_types(audit),
        ComplianceRule::new(
            "AUD-SEM-001",
            "Professional skepticism",
            Severity::Medium,
            ValidationKind::Semantic {
                principle: "The text reflects professional skepticism: conclusions are supported by \
                            audit evidence and no assurance beyond reasonable assurance is implied."
                    .to_string(),
                min_confidence: None,
            },
        )
        .in_sections(["basis_for_opinion"])
        .for_report_types(audit),
    ]
}

/// Templates for the most common rule shapes.
pub fn builtin_templates() -> Vec<RuleTemplate> {
    vec![
        RuleTemplate {
            id: "required-phrase".to_string(),
            name: "Required phrase in {{section}}".to_string(),
            description: "Fails when the section does not contain the phrase.".to_string(),
            severity: Severity::Medium,
            weight: 1.0,
            kind: ValidationKind::Pattern {
                required: vec![r"\b{{phrase}}\b".to_string()],
                forbidden: Vec::new(),
            },
            scope: RuleScope {
                sections: vec!["{{section}}".to_string()],
                ..RuleScope::default()
            },
            regulatory_source: None,
            message: "Section {{section}} must mention \"{{phrase}}\"".to_string(),
            suggested_fix: Some("Add language addressing {{phrase}}.".to_string()),
        },
        RuleTemplate {
            id: "prohibited-term".to_string(),
            name: "Prohibited term: {{term}}".to_string(),
            description: "Fails when any section uses the term.".to_string(),
            severity: Severity::High,
            weight: 1.0,
            kind: ValidationKind::ProhibitedPhrase {
                phrases: vec!["{{term}}".to_string()],
            },
            scope: RuleScope::default(),
            regulatory_source: None,
            message: "\"{{term}}\" must not appear in the report".to_string(),
            suggested_fix: Some("Remove or rephrase \"{{term}}\".".to_string()),
        },
        RuleTemplate {
            id: "required-heading".to_string(),
            name: "Heading {{heading}} in {{section}}".to_string(),
            description: String::new(),
            severity: Severity::Low,
            weight: 0.5,
            kind: ValidationKind::Structural {
                check: StructuralCheck::RequiresHeading {
                    heading: "{{heading}}".to_string(),
                },
            },
            scope: RuleScope {
                sections: vec!["{{section}}".to_string()],
                ..RuleScope::default()
            },
            regulatory_source: None,
            message: "Section {{section}} must contain a '{{heading}}' heading".to_string(),
            suggested_fix: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn builtins_are_valid() {
        let catalog = RuleCatalog::with_builtins().unwrap();
        assert_eq!(catalog.list_rules(None).len(), builtin_rules().len());
        assert_eq!(catalog.list_templates().len(), 3);
        assert!(catalog
            .list_rules(Some(ReportType::Compilation))
            .iter()
            .all(|r| r.scope.report_types.is_empty()));
    }

    #[test]
    fn instantiates_template_with_parameters() {
        let catalog = RuleCatalog::with_builtins().unwrap();
        let rule = catalog
            .create_rule_from_template(
                "required-phrase",
                "CUSTOM-001",
                &params(&[("section", "going_concern"), ("phrase", "substantial doubt")]),
            )
            .unwrap();

        assert_eq!(rule.scope.sections, vec!["going_concern"]);
        assert_eq!(rule.message, "Section going_concern must mention \"substantial doubt\"");
        match &rule.kind {
            ValidationKind::Pattern { required, .. } => {
                assert_eq!(required[0], r"\bsubstantial doubt\b")
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert!(catalog.rule("CUSTOM-001").is_some());
    }

    #[test]
    fn template_errors() {
        let catalog = RuleCatalog::with_builtins().unwrap();
        let missing = catalog
            .create_rule_from_template("prohibited-term", "X", &HashMap::new())
            .unwrap_err();
        assert!(missing.to_string().contains("term"));

        let unknown = catalog
            .create_rule_from_template("nope", "X", &HashMap::new())
            .unwrap_err();
        assert!(matches!(unknown, AuditGraphError::NotFound(_)));

        let duplicate = catalog
            .create_rule_from_template(
                "prohibited-term",
                "GEN-PHR-001",
                &params(&[("term", "certainly")]),
            )
            .unwrap_err();
        assert!(matches!(duplicate, AuditGraphError::ValidationFailure { .. }));
    }

    #[test]
    fn template_parameters_are_listed_once() {
        let templates = builtin_templates();
        let required = templates.iter().find(|t| t.id == "required-phrase").unwrap();
        assert_eq!(required.parameters(), vec!["section", "phrase"]);
    }
}
