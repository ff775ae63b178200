use auditgraph_core::{AuditGraphError, Result, Section};
use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;

/// How a decision is read out of generated text.
#[derive(Debug, Clone)]
pub enum DecisionProbe {
    /// First matching pattern wins; `default` when nothing matches.
    Classify {
        patterns: Vec<(String, Regex)>,
        default: String,
    },
    /// "present" or "absent".
    Presence(Regex),
}

/// A key decision compared across independently generated samples.
#[derive(Debug, Clone)]
pub struct DecisionRule {
    pub key: String,
    /// Section to inspect; `None` means the whole report body.
    pub section: Option<String>,
    pub probe: DecisionProbe,
    /// Value order used to break ties that randomness alone can't settle.
    pub precedence: Vec<String>,
}

impl DecisionRule {
    pub fn classify(
        key: impl Into<String>,
        section: Option<&str>,
        patterns: &[(&str, &str)],
        default: impl Into<String>,
    ) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        let mut precedence = Vec::with_capacity(patterns.len() + 1);
        for (value, pattern) in patterns {
            compiled.push((value.to_string(), case_insensitive(pattern)?));
            precedence.push(value.to_string());
        }
        let default = default.into();
        precedence.push(default.clone());
        Ok(Self {
            key: key.into(),
            section: section.map(str::to_string),
            probe: DecisionProbe::Classify {
                patterns: compiled,
                default,
            },
            precedence,
        })
    }

    pub fn presence(key: impl Into<String>, section: Option<&str>, pattern: &str) -> Result<Self> {
        Ok(Self {
            key: key.into(),
            section: section.map(str::to_string),
            probe: DecisionProbe::Presence(case_insensitive(pattern)?),
            precedence: vec!["present".to_string(), "absent".to_string()],
        })
    }

    pub fn extract(&self, sections: &[Section]) -> String {
        let text = match &self.section {
            Some(name) => sections
                .iter()
                .find(|s| &s.name == name)
                .map(|s| s.content.clone())
                .unwrap_or_default(),
            None => sections
                .iter()
                .map(|s| s.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        };

        match &self.probe {
            DecisionProbe::Classify { patterns, default } => patterns
                .iter()
                .find(|(_, re)| re.is_match(&text))
                .map(|(value, _)| value.clone())
                .unwrap_or_else(|| default.clone()),
            DecisionProbe::Presence(re) => {
                if re.is_match(&text) {
                    "present".to_string()
                } else {
                    "absent".to_string()
                }
            }
        }
    }

    /// Position in the precedence list; unknown values sort last.
    pub fn rank(&self, value: &str) -> usize {
        self.precedence
            .iter()
            .position(|v| v == value)
            .unwrap_or(self.precedence.len())
    }
}

fn case_insensitive(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| AuditGraphError::Configuration(format!("invalid decision pattern: {}", e)))
}

/// The set of key decisions compared by the self-consistency voter.
#[derive(Debug, Clone)]
pub struct DecisionExtractor {
    rules: Vec<DecisionRule>,
}

impl DecisionExtractor {
    pub fn new(rules: Vec<DecisionRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[DecisionRule] {
        &self.rules
    }

    pub fn rule(&self, key: &str) -> Option<&DecisionRule> {
        self.rules.iter().find(|r| r.key == key)
    }

    pub fn extract(&self, sections: &[Section]) -> BTreeMap<String, String> {
        self.rules
            .iter()
            .map(|rule| (rule.key.clone(), rule.extract(sections)))
            .collect()
    }

    /// Opinion type, going concern, key audit matters and emphasis of matter.
    ///
    /// Adverse and disclaimer are checked before qualified so that a sentence
    /// such as "we do not express an opinion" is never read as unmodified.
    pub fn audit_opinion() -> Result<Self> {
        Ok(Self::new(vec![
            DecisionRule::classify(
                "opinion_type",
                Some("opinion"),
                &[
                    ("adverse", r"\badverse\s+opinion\b|do\s+not\s+present\s+fairly"),
                    (
                        "disclaimer",
                        r"\bdisclaim|do\s+not\s+express\s+an\s+opinion|unable\s+to\s+obtain\s+sufficient",
                    ),
                    ("qualified", r"\bqualified\s+opinion\b|\bexcept\s+for\b"),
                    (
                        "unmodified",
                        r"\bunmodified\b|\bunqualified\b|present\s+fairly,?\s+in\s+all\s+material\s+respects",
                    ),
                ],
                "undetermined",
            )?,
            DecisionRule::presence("going_concern_clause", None, r"\bgoing\s+concern\b")?,
            DecisionRule::classify(
                "key_audit_matters",
                Some("key_audit_matters"),
                &[
                    ("none", r"\bno\s+(?:critical|key)\s+audit\s+matters\b"),
                    ("reported", r"\b(?:critical|key)\s+audit\s+matters?\b"),
                ],
                "absent",
            )?,
            DecisionRule::presence(
                "emphasis_of_matter",
                None,
                r"\bemphasis\s+of\s+(?:a\s+)?matter\b",
            )?,
        ]))
    }

    /// Decision set for report types without audit-specific conclusions.
    pub fn for_report_type(report_type: auditgraph_core::ReportType) -> Result<Self> {
        use auditgraph_core::ReportType;
        match report_type {
            ReportType::AuditOpinion | ReportType::InternalControl => Self::audit_opinion(),
            ReportType::ReviewEngagement
            | ReportType::AgreedUponProcedures
            | ReportType::Compilation => {
                Ok(Self::new(vec![
                    DecisionRule::presence("going_concern_clause", None, r"\bgoing\s+concern\b")?,
                    DecisionRule::presence(
                        "emphasis_of_matter",
                        None,
                        r"\bemphasis\s+of\s+(?:a\s+)?matter\b",
                    )?,
                ]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sections(opinion: &str, matters: &str) -> Vec<Section> {
        vec![
            Section::new("opinion", opinion, "opinion_writer"),
            Section::new("key_audit_matters", matters, "matters_writer"),
        ]
    }

    #[test]
    fn classifies_opinion_types() {
        let extractor = DecisionExtractor::audit_opinion().unwrap();
        let cases = [
            (
                "In our opinion, the statements present fairly, in all material respects, ...",
                "unmodified",
            ),
            ("In our opinion, except for the effects of the matter described ...", "qualified"),
            (
                "Because of the significance of the matter, the statements do not present fairly ...",
                "adverse",
            ),
            ("We do not express an opinion on the financial statements.", "disclaimer"),
            ("The report is pending.", "undetermined"),
        ];
        for (text, expected) in cases {
            let decisions = extractor.extract(&sections(text, ""));
            assert_eq!(decisions["opinion_type"], expected, "text: {text}");
        }
    }

    #[test]
    fn presence_and_matters_decisions() {
        let extractor = DecisionExtractor::audit_opinion().unwrap();
        let decisions = extractor.extract(&sections(
            "Unmodified. Substantial doubt about its ability to continue as a Going Concern exists.",
            "There are no critical audit matters to report.",
        ));
        assert_eq!(decisions["going_concern_clause"], "present");
        assert_eq!(decisions["key_audit_matters"], "none");
        assert_eq!(decisions["emphasis_of_matter"], "absent");

        let decisions = extractor.extract(&sections("Unmodified.", ""));
        assert_eq!(decisions["going_concern_clause"], "absent");
        assert_eq!(decisions["key_audit_matters"], "absent");
    }

    #[test]
    fn precedence_ranks_unknown_values_last() {
        let extractor = DecisionExtractor::audit_opinion().unwrap();
        let rule = extractor.rule("opinion_type").unwrap();
        assert!(rule.rank("adverse") < rule.rank("unmodified"));
        assert_eq!(rule.rank("something-else"), rule.precedence.len());
    }
}
