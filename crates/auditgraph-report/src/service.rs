use auditgraph_ai::{
    audit_opinion_agents, AgentPipeline, AgentSpec, DecisionExtractor, PipelineConfig, ReportBrief,
    SelfConsistencyVoter, TextGenerator, VoterConfig,
};
use auditgraph_compliance::{
    CitationValidator, ComplianceEngine, ComplianceRule, EngineConfig, PipelineRepairer,
    RuleCatalog, RuleTemplate, SemanticJudge, ValidationSubject, ValidationType,
};
use auditgraph_core::{
    AuditGraphError, CitationRecord, GenerationMethod, Report, ReportContext, ReportId,
    ReportStatus, ReportType, Result, Settings, SystemIssue, Violation,
};
use auditgraph_graph::KnowledgeGraph;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::lifecycle::{self, ApprovalPolicy, VALIDATABLE};
use crate::numbering::report_number;
use crate::store::ReportStore;

const NUMBER_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationFlags {
    /// Run the self-consistency voter instead of a single pipeline pass.
    #[serde(default)]
    pub self_consistency: bool,
    /// Overrides the configured sample count.
    #[serde(default)]
    pub samples: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateReportRequest {
    pub report_type: ReportType,
    pub entity_type: String,
    pub framework: String,
    pub context: ReportContext,
    #[serde(default)]
    pub flags: GenerationFlags,
    /// Overrides the configured generation deadline.
    #[serde(default)]
    pub deadline: Option<Duration>,
}

impl GenerateReportRequest {
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
            flags: GenerationFlags::default(),
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSummary {
    pub report_id: ReportId,
    pub compliant: bool,
    pub score: f64,
    pub violations: Vec<Violation>,
    pub system_issues: Vec<SystemIssue>,
    /// Sections regenerated by fix mode.
    pub repaired_sections: Vec<String>,
    /// Sections whose fix-mode regeneration failed; each also has an entry in
    /// `system_issues`.
    pub failed_repairs: Vec<String>,
    pub status: ReportStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationSummary {
    pub report_id: ReportId,
    pub total: usize,
    pub invalid: Vec<CitationRecord>,
    pub superseded: Vec<CitationRecord>,
    pub graph_version: u64,
}

/// Entry point for generating, validating, approving and issuing reports.
pub struct ReportService {
    settings: Settings,
    store: Arc<dyn ReportStore>,
    graph: Arc<KnowledgeGraph>,
    catalog: Arc<RuleCatalog>,
    engine: ComplianceEngine,
    generator: Arc<dyn TextGenerator>,
    pipelines: HashMap<ReportType, Arc<AgentPipeline>>,
    validator: CitationValidator,
    policy: ApprovalPolicy,
}

impl ReportService {
    /// Service with the built-in audit opinion agent table.
    pub fn new(
        settings: Settings,
        generator: Arc<dyn TextGenerator>,
        graph: Arc<KnowledgeGraph>,
        catalog: Arc<RuleCatalog>,
        store: Arc<dyn ReportStore>,
    ) -> Result<Self> {
        let engine = ComplianceEngine::new(EngineConfig::from(&settings.compliance))
            .with_judge(SemanticJudge::new(generator.clone(), &settings.pipeline));
        let policy = ApprovalPolicy::from(&settings.lifecycle);
        let mut service = Self {
            settings,
            store,
            graph,
            catalog,
            engine,
            generator,
            pipelines: HashMap::new(),
            validator: CitationValidator::new(),
            policy,
        };
        service.register_agents(ReportType::AuditOpinion, audit_opinion_agents())?;
        Ok(service)
    }

    /// Registers (or replaces) the agent table used for `report_type`.
    pub fn register_agents(
        &mut self,
        report_type: ReportType,
        agents: Vec<AgentSpec>,
    ) -> Result<()> {
        let pipeline = AgentPipeline::new(
            self.generator.clone(),
            agents,
            PipelineConfig::from(&self.settings.pipeline),
        )?;
        self.pipelines.insert(report_type, Arc::new(pipeline));
        Ok(())
    }

    pub fn engine_mut(&mut self) -> &mut ComplianceEngine {
        &mut self.engine
    }

    pub fn graph(&self) -> &Arc<KnowledgeGraph> {
        &self.graph
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn pipeline_for(&self, report_type: ReportType) -> Result<Arc<AgentPipeline>> {
        self.pipelines.get(&report_type).cloned().ok_or_else(|| {
            AuditGraphError::NotFound(format!("agent table for report type '{}'", report_type))
        })
    }

    fn default_deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs(self.settings.pipeline.default_deadline_secs)
    }

    /// Generates sections and stores them as a draft. Nothing is stored when
    /// generation fails or the voter misses its quorum.
    pub async fn generate_report(&self, request: GenerateReportRequest) -> Result<Report> {
        let pipeline = self.pipeline_for(request.report_type)?;
        let deadline = request
            .deadline
            .map(|d| Instant::now() + d)
            .unwrap_or_else(|| self.default_deadline());
        let brief = ReportBrief::new(
            request.report_type,
            request.entity_type.clone(),
            request.framework.clone(),
            request.context.clone(),
        );

        let (method, sections, consensus) = if request.flags.self_consistency {
            let mut config = VoterConfig::from(&self.settings.voter);
            if let Some(samples) = request.flags.samples {
                config.samples = samples;
            }
            let voter = SelfConsistencyVoter::new(
                pipeline,
                DecisionExtractor::for_report_type(request.report_type)?,
                config,
            )?;
            let outcome = voter.vote(&brief, deadline).await?;
            (
                GenerationMethod::SelfConsistency,
                outcome.selected.sections,
                Some(outcome.audit),
            )
        } else {
            let run = pipeline.run(&brief, deadline).await?;
            (GenerationMethod::Pipeline, run.sections, None)
        };

        let mut report = Report::new_draft(
            request.report_type,
            request.entity_type,
            request.framework,
            request.context,
            method,
            sections,
        );
        report.consensus = consensus;
        let stored = self.store.insert(report).await?;
        info!(
            report_id = %stored.id,
            report_type = %stored.report_type,
            sections = stored.sections.len(),
            "draft report generated"
        );
        Ok(stored)
    }

    /// Runs the rule engine and citation validator and moves the report to
    /// `validated`. With `fix_violations`, repairable failures get one
    /// corrective regeneration before the recorded result is computed.
    /// Semantic judgements and regenerations share the configured deadline.
    pub async fn validate_compliance(
        &self,
        report_id: ReportId,
        validation_type: ValidationType,
        fix_violations: bool,
    ) -> Result<ComplianceSummary> {
        let mut report = self.store.get(report_id).await?;
        lifecycle::ensure_state(&report, "validate", &VALIDATABLE)?;

        let rules = self.catalog.list_rules(Some(report.report_type));
        let subject = ValidationSubject::from(&report);
        let deadline = self.default_deadline();
        let (outcome, sections, repaired_sections, failed_repairs) = if fix_violations {
            let pipeline = self.pipeline_for(report.report_type)?;
            let brief = ReportBrief::new(
                report.report_type,
                report.entity_type.clone(),
                report.framework.clone(),
                report.context.clone(),
            );
            let repairer = PipelineRepairer::new(pipeline, brief, deadline);
            let fixed = self
                .engine
                .validate_and_fix(&rules, &subject, validation_type, &repairer, deadline)
                .await;
            let failed: Vec<String> = fixed
                .failed_repairs
                .iter()
                .filter_map(|issue| issue.section.clone())
                .collect();
            (fixed.outcome, fixed.sections, fixed.repaired_sections, failed)
        } else {
            let outcome = self
                .engine
                .evaluate(&rules, &subject, validation_type, deadline)
                .await;
            (outcome, report.sections.clone(), Vec::new(), Vec::new())
        };

        let snapshot = self.graph.snapshot();
        let citations = self.validator.validate_sections(&snapshot, &sections);
        lifecycle::record_validation(&mut report, sections, outcome, citations)?;
        let report = self.store.commit(report).await?;

        Ok(ComplianceSummary {
            report_id,
            compliant: report.compliant.unwrap_or(false),
            score: report.compliance_score.unwrap_or(0.0),
            violations: report.violations,
            system_issues: report.system_issues,
            repaired_sections,
            failed_repairs,
            status: report.status,
        })
    }

    /// Checks the report's citations against the current graph snapshot.
    /// Read-only: the lifecycle state is not changed.
    pub async fn validate_citations(&self, report_id: ReportId) -> Result<CitationSummary> {
        let report = self.store.get(report_id).await?;
        let snapshot = self.graph.snapshot();
        let citations = self.validator.validate_sections(&snapshot, &report.sections);
        Ok(CitationSummary {
            report_id,
            total: citations.total(),
            invalid: citations.invalid().into_iter().cloned().collect(),
            superseded: citations.superseded().into_iter().cloned().collect(),
            graph_version: citations.graph_version,
        })
    }

    pub async fn approve_report(
        &self,
        report_id: ReportId,
        approver_id: &str,
        override_justification: Option<&str>,
    ) -> Result<Report> {
        let mut report = self.store.get(report_id).await?;
        lifecycle::approve(&mut report, approver_id, override_justification, &self.policy)?;
        self.store.commit(report).await
    }

    /// Issues an approved report and returns its number.
    pub async fn issue_report(&self, report_id: ReportId) -> Result<String> {
        let mut report = self.store.get(report_id).await?;
        lifecycle::ensure_state(&report, "issue", &[ReportStatus::Approved])?;

        let today = Utc::now().date_naive();
        let mut number = None;
        for _ in 0..NUMBER_ATTEMPTS {
            let candidate = report_number(report.report_type, today);
            if self.store.reserve_number(&candidate, report_id).await? {
                number = Some(candidate);
                break;
            }
            warn!(report_id = %report_id, "report number collision, regenerating");
        }
        let number = number.ok_or_else(|| {
            AuditGraphError::Configuration(format!(
                "could not allocate a unique report number after {} attempts",
                NUMBER_ATTEMPTS
            ))
        })?;

        let committed = match lifecycle::issue(&mut report, number.clone()) {
            Ok(()) => self.store.commit(report).await,
            Err(e) => Err(e),
        };
        if let Err(e) = committed {
            self.store.release_number(&number, report_id).await?;
            return Err(e);
        }
        info!(report_id = %report_id, report_number = %number, "report issued");
        Ok(number)
    }

    pub async fn request_revision(&self, report_id: ReportId, reason: &str) -> Result<Report> {
        let mut report = self.store.get(report_id).await?;
        lifecycle::request_revision(&mut report, reason)?;
        self.store.commit(report).await
    }

    pub async fn revise_section(
        &self,
        report_id: ReportId,
        section: &str,
        content: &str,
    ) -> Result<Report> {
        let mut report = self.store.get(report_id).await?;
        lifecycle::revise_section(&mut report, section, content)?;
        self.store.commit(report).await
    }

    pub async fn get_report(&self, report_id: ReportId) -> Result<Report> {
        self.store.get(report_id).await
    }

    pub async fn list_reports(&self, status: Option<ReportStatus>) -> Result<Vec<Report>> {
        self.store.list(status).await
    }

    pub fn create_rule_template(&self, template: RuleTemplate) -> Result<()> {
        self.catalog.create_template(template)
    }

    pub fn list_rule_templates(&self) -> Vec<RuleTemplate> {
        self.catalog.list_templates()
    }

    pub fn create_rule_from_template(
        &self,
        template_id: &str,
        rule_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<ComplianceRule> {
        self.catalog.create_rule_from_template(template_id, rule_id, params)
    }

    pub fn list_compliance_rules(&self, report_type: Option<ReportType>) -> Vec<ComplianceRule> {
        self.catalog.list_rules(report_type)
    }
}
