use auditgraph_core::{ReportContext, ReportType};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
});

/// Everything the agents are told about the engagement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportBrief {
    pub report_type: ReportType,
    pub entity_type: String,
    pub framework: String,
    pub context: ReportContext,
}

impl ReportBrief {
    pub fn new(
        report_type: ReportType,
        entity_type: impl Into<String>,
        framework: impl Into<String>,
        context: ReportContext,
    ) -> Self {
        Self {
            report_type,
            entity_type: entity_type.into(),
            framework: framework.into(),
            context,
        }
    }
}

/// Declarative description of one generation role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub responsibility: String,
    /// Name of the report section this agent writes.
    pub section: String,
    /// Sampling temperature; lower is more deterministic.
    pub temperature: f32,
    #[serde(default = "AgentSpec::default_max_tokens")]
    pub max_tokens: usize,
    pub prompt_template: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl AgentSpec {
    fn default_max_tokens() -> usize {
        1024
    }

    pub fn new(
        name: impl Into<String>,
        section: impl Into<String>,
        temperature: f32,
        prompt_template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            responsibility: String::new(),
            section: section.into(),
            temperature,
            max_tokens: Self::default_max_tokens(),
            prompt_template: prompt_template.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn responsible_for(mut self, responsibility: impl Into<String>) -> Self {
        self.responsibility = responsibility.into();
        self
    }

    pub fn depending_on<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(agents.into_iter().map(Into::into));
        self
    }

    /// Fills `{{key}}` placeholders from the brief and `{{section.<name>}}`
    /// from outputs of agents that already ran. Unknown keys render empty.
    pub fn render_prompt(
        &self,
        brief: &ReportBrief,
        prior_sections: &HashMap<String, String>,
    ) -> String {
        let ctx = &brief.context;
        PLACEHOLDER
            .replace_all(&self.prompt_template, |caps: &Captures| {
                let key = &caps[1];
                let value = match key {
                    "entity_name" => Some(ctx.entity_name.clone()),
                    "entity_type" => Some(brief.entity_type.clone()),
                    "framework" => Some(brief.framework.clone()),
                    "report_type" => Some(brief.report_type.to_string()),
                    "responsibility" => Some(self.responsibility.clone()),
                    "period_end" => Some(
                        ctx.period_end
                            .map(|d| d.format("%B %-d, %Y").to_string())
                            .unwrap_or_else(|| "the period end".to_string()),
                    ),
                    "facts" => Some(
                        ctx.facts
                            .iter()
                            .map(|(k, v)| format!("- {}: {}", k, v))
                            .collect::<Vec<_>>()
                            .join("\n"),
                    ),
                    "flags" => Some(
                        ctx.flags
                            .iter()
                            .filter(|(_, v)| **v)
                            .map(|(k, _)| format!("- {}", k))
                            .collect::<Vec<_>>()
                            .join("\n"),
                    ),
                    _ => {
                        if let Some(section) = key.strip_prefix("section.") {
                            prior_sections.get(section).cloned()
                        } else if let Some(fact) = key.strip_prefix("fact.") {
                            ctx.facts.get(fact).cloned()
                        } else if let Some(flag) = key.strip_prefix("flag.") {
                            Some(ctx.flag(flag).to_string())
                        } else {
                            None
                        }
                    }
                };
                value.unwrap_or_else(|| {
                    debug!(agent = %self.name, placeholder = key, "unresolved prompt placeholder");
                    String::new()
                })
            })
            .into_owned()
    }
}

/// Agent table for audit opinions. The editor depends on every content writer.
pub fn audit_opinion_agents() -> Vec<AgentSpec> {
    let writers = vec![
        AgentSpec::new(
            "opinion_writer",
            "opinion",
            0.2,
            "You are drafting the Opinion section of an independent auditor's report on \
             the financial statements of {{entity_name}} ({{entity_type}}) for the period ended \
             {{period_end}}, prepared under {{framework}}.\n\
             Responsibility: {{responsibility}}\n\
             Engagement facts:\n{{facts}}\nConditions:\n{{flags}}\n\
             State the opinion type explicitly and cite applicable standards in brackets, e.g. [AS 3101].",
        )
        .responsible_for("State the auditor's opinion and its basis in one paragraph."),
        AgentSpec::new(
            "basis_writer",
            "basis_for_opinion",
            0.3,
            "Write the Basis for Opinion section for {{entity_name}} under {{framework}}. \
             Describe independence and the standards the audit followed, citing them in brackets.\n\
             Engagement facts:\n{{facts}}",
        )
        .responsible_for("Explain the basis for the opinion and auditor independence."),
        AgentSpec::new(
            "going_concern_writer",
            "going_concern",
            0.2,
            "Write the Going Concern section for {{entity_name}}. Substantial doubt indicator: \
             {{flag.going_concern_doubt}}.\nEngagement facts:\n{{facts}}\n\
             If doubt exists, describe the conditions and management's plans and use the phrase \
             \"going concern\". Cite [AS 2415] where relevant.",
        )
        .responsible_for("Evaluate and disclose substantial doubt about going concern."),
        AgentSpec::new(
            "matters_writer",
            "key_audit_matters",
            0.4,
            "Write the Critical Audit Matters section for {{entity_name}} ({{framework}}). \
             Engagement facts:\n{{facts}}\nIf there are none, say that there are no critical audit matters.",
        )
        .responsible_for("Communicate critical or key audit matters."),
        AgentSpec::new(
            "responsibilities_writer",
            "responsibilities",
            0.3,
            "Write the Responsibilities of Management and the Auditor section for an audit of \
             {{entity_name}} under {{framework}}. Keep it to two paragraphs, one per party.",
        )
        .responsible_for("Describe management's and the auditor's responsibilities."),
    ];

    let writer_names: Vec<String> = writers.iter().map(|a| a.name.clone()).collect();
    let mut agents = writers;
    agents.push(
        AgentSpec::new(
            "editor",
            "executive_summary",
            0.1,
            "You are the engagement editor. Summarize the report for {{entity_name}} in one \
             paragraph, keeping the opinion type and any going concern language consistent.\n\n\
             Opinion:\n{{section.opinion}}\n\nBasis:\n{{section.basis_for_opinion}}\n\n\
             Going concern:\n{{section.going_concern}}\n\nMatters:\n{{section.key_audit_matters}}\n\n\
             Responsibilities:\n{{section.responsibilities}}",
        )
        .responsible_for("Harmonize terminology and summarize the full report.")
        .depending_on(writer_names),
    );
    agents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brief() -> ReportBrief {
        ReportBrief::new(
            ReportType::AuditOpinion,
            "public_company",
            "US GAAP",
            ReportContext::new("Acme Corp")
                .with_flag("going_concern_doubt", true)
                .with_fact("revenue", "$12M"),
        )
    }

    #[test]
    fn renders_context_and_dependency_placeholders() {
        let agent = AgentSpec::new(
            "editor",
            "summary",
            0.1,
            "{{entity_name}} / {{framework}} / {{fact.revenue}} / {{flag.going_concern_doubt}} / {{section.opinion}} / {{unknown}}.",
        );
        let mut prior = HashMap::new();
        prior.insert("opinion".to_string(), "Unmodified".to_string());

        let prompt = agent.render_prompt(&brief(), &prior);
        assert_eq!(prompt, "Acme Corp / US GAAP / $12M / true / Unmodified / .");
    }

    #[test]
    fn editor_depends_on_every_writer() {
        let agents = audit_opinion_agents();
        let editor = agents.iter().find(|a| a.name == "editor").unwrap();
        assert_eq!(editor.depends_on.len(), agents.len() - 1);
        assert!(agents
            .iter()
            .filter(|a| a.name != "editor")
            .all(|a| a.depends_on.is_empty()));
    }
}
