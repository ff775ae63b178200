use async_trait::async_trait;
use auditgraph_ai::{GenerationRequest, GenerationResponse, GenerationResult, TextGenerator};
use auditgraph_compliance::{RuleCatalog, ValidationType};
use auditgraph_core::{
    AuditGraphError, GenerationMethod, Report, ReportContext, ReportId, ReportStatus, ReportType,
    Result, SampleOutcome, Settings, Standard,
};
use auditgraph_graph::KnowledgeGraph;
use auditgraph_report::{
    GenerateReportRequest, InMemoryReportStore, ReportService, ReportStore,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const GOOD_OPINION: &str = "In our opinion, the financial statements present fairly, in all material \
respects, the financial position of the Company in conformity with US GAAP [AS 3101].";
const WEAK_OPINION: &str = "The financial statements of the Company were examined for the year.";

/// Answers each agent by recognising its prompt; semantic checks always pass.
struct ScriptedGenerator {
    first_opinion: &'static str,
    revisions_fail: bool,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn new(first_opinion: &'static str) -> Self {
        Self {
            first_opinion,
            revisions_fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Drafts normally but cannot revise.
    fn without_revisions(first_opinion: &'static str) -> Self {
        Self {
            revisions_fail: true,
            ..Self::new(first_opinion)
        }
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult<GenerationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request.prompt.as_str();
        let is_judge = request
            .system
            .as_deref()
            .is_some_and(|s| s.contains("compliance reviewer"));

        let text = if is_judge {
            r#"{"satisfied": true, "confidence": 0.92, "rationale": "supported by evidence"}"#
        } else if prompt.contains("Revise the current draft") {
            if self.revisions_fail {
                anyhow::bail!("revision service unavailable");
            }
            GOOD_OPINION
        } else if prompt.contains("engagement editor") {
            "The auditor issued an unmodified opinion on the financial statements of Acme Corp."
        } else if prompt.contains("drafting the Opinion section") {
            self.first_opinion
        } else if prompt.contains("Basis for Opinion") {
            "We conducted our audit in accordance with [AS 2110]. We are required to be independent \
             of the Company and obtained reasonable assurance."
        } else if prompt.contains("Going Concern") {
            "We identified no conditions that raise substantial doubt about the Company's ability to \
             continue as a going concern [AS 2415]."
        } else if prompt.contains("Critical Audit Matters") {
            "There are no critical audit matters."
        } else if prompt.contains("Responsibilities of Management") {
            "Management is responsible for the preparation of the financial statements.\n\n\
             Our responsibility is to express an opinion on these statements based on our audit."
        } else {
            anyhow::bail!("unexpected prompt: {}", prompt.lines().next().unwrap_or_default());
        };
        Ok(GenerationResponse::text(text, "scripted"))
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

fn standards_graph() -> Arc<KnowledgeGraph> {
    Arc::new(
        KnowledgeGraph::from_standards(vec![
            Standard::new("AS-3101", "PCAOB", "AS 3101"),
            Standard::new("AS-2415", "PCAOB", "AS 2415"),
            Standard::new("AS-2110", "PCAOB", "AS 2110"),
            Standard::new("AS-2110-R2023", "PCAOB", "AS 2110 (Revised 2023)")
                .superseding("AS-2110"),
        ])
        .unwrap(),
    )
}

fn service_over(
    settings: Settings,
    generator: Arc<ScriptedGenerator>,
    store: Arc<dyn ReportStore>,
) -> ReportService {
    ReportService::new(
        settings,
        generator,
        standards_graph(),
        Arc::new(RuleCatalog::with_builtins().unwrap()),
        store,
    )
    .unwrap()
}

fn service_with(
    first_opinion: &'static str,
) -> (ReportService, Arc<InMemoryReportStore>, Arc<ScriptedGenerator>) {
    let generator = Arc::new(ScriptedGenerator::new(first_opinion));
    let store = Arc::new(InMemoryReportStore::new());
    let service = service_over(Settings::default(), generator.clone(), store.clone());
    (service, store, generator)
}

fn audit_request() -> GenerateReportRequest {
    GenerateReportRequest::new(
        ReportType::AuditOpinion,
        "public_company",
        "US GAAP",
        ReportContext::new("Acme Corp").with_fact("revenue", "$12.4M"),
    )
}

#[tokio::test]
async fn generate_validate_approve_issue() {
    let (service, _store, _) = service_with(GOOD_OPINION);

    let draft = service.generate_report(audit_request()).await.unwrap();
    assert_eq!(draft.status, ReportStatus::Draft);
    assert_eq!(draft.generation_method, GenerationMethod::Pipeline);
    assert_eq!(draft.sections.len(), 6);
    assert!(draft.section("executive_summary").is_some());

    let summary = service
        .validate_compliance(draft.id, ValidationType::Full, false)
        .await
        .unwrap();
    assert!(summary.compliant, "violations: {:?}", summary.violations);
    approx::assert_relative_eq!(summary.score, 1.0);
    assert_eq!(summary.status, ReportStatus::Validated);

    let validated = service.get_report(draft.id).await.unwrap();
    let citations = validated.citation_report.as_ref().unwrap();
    assert_eq!(citations.superseded().len(), 1);
    assert_eq!(
        citations.superseded()[0].superseded_by_number.as_deref(),
        Some("AS 2110 (Revised 2023)")
    );

    let approved = service.approve_report(draft.id, "partner-7", None).await.unwrap();
    assert_eq!(approved.status, ReportStatus::Approved);

    let number = service.issue_report(draft.id).await.unwrap();
    assert!(number.starts_with("AUD-"));
    let issued = service.get_report(draft.id).await.unwrap();
    assert_eq!(issued.status, ReportStatus::Issued);
    assert_eq!(issued.report_number.as_deref(), Some(number.as_str()));
    assert!(issued.issued_at.is_some());
}

#[tokio::test]
async fn issue_before_approval_is_rejected_without_side_effects() {
    let (service, _store, _) = service_with(GOOD_OPINION);
    let draft = service.generate_report(audit_request()).await.unwrap();

    let err = service.issue_report(draft.id).await.unwrap_err();
    assert!(matches!(err, AuditGraphError::StateTransition { .. }));
    assert!(err.to_string().contains("approved"));

    let unchanged = service.get_report(draft.id).await.unwrap();
    assert_eq!(unchanged, draft);
}

#[tokio::test]
async fn critical_violation_then_revision() {
    let (service, _store, _) = service_with(WEAK_OPINION);
    let draft = service.generate_report(audit_request()).await.unwrap();

    let summary = service
        .validate_compliance(draft.id, ValidationType::Full, false)
        .await
        .unwrap();
    assert!(!summary.compliant);
    assert_eq!(summary.status, ReportStatus::Validated);
    assert!(summary.violations.iter().any(|v| v.rule_id == "AUD-OPN-001"));

    let blocked = service.approve_report(draft.id, "partner-7", None).await.unwrap_err();
    assert!(matches!(blocked, AuditGraphError::ApprovalBlocked(_)));
    assert_eq!(
        service.get_report(draft.id).await.unwrap().status,
        ReportStatus::Validated
    );

    service
        .request_revision(draft.id, "opinion paragraph is missing")
        .await
        .unwrap();
    let revised = service
        .revise_section(draft.id, "opinion", GOOD_OPINION)
        .await
        .unwrap();
    assert_eq!(revised.status, ReportStatus::NeedsRevision);
    assert_eq!(revised.section("opinion").unwrap().agent_id, "manual_revision");

    let summary = service
        .validate_compliance(draft.id, ValidationType::Quick, false)
        .await
        .unwrap();
    assert!(summary.compliant);
    service.approve_report(draft.id, "partner-7", None).await.unwrap();
}

#[tokio::test]
async fn fix_mode_repairs_the_opinion_once() {
    let (service, _store, _) = service_with(WEAK_OPINION);
    let draft = service.generate_report(audit_request()).await.unwrap();

    let summary = service
        .validate_compliance(draft.id, ValidationType::Full, true)
        .await
        .unwrap();
    assert_eq!(summary.repaired_sections, vec!["opinion"]);
    assert!(summary.compliant);

    let report = service.get_report(draft.id).await.unwrap();
    assert_eq!(report.section("opinion").unwrap().content, GOOD_OPINION);
}

#[tokio::test]
async fn failed_fix_is_reported_and_keeps_the_draft() {
    let mut settings = Settings::default();
    settings.pipeline.max_retries = 0;
    let generator = Arc::new(ScriptedGenerator::without_revisions(WEAK_OPINION));
    let service = service_over(settings, generator, Arc::new(InMemoryReportStore::new()));
    let draft = service.generate_report(audit_request()).await.unwrap();

    let summary = service
        .validate_compliance(draft.id, ValidationType::Full, true)
        .await
        .unwrap();
    assert!(summary.repaired_sections.is_empty());
    assert_eq!(summary.failed_repairs, vec!["opinion"]);
    assert!(!summary.compliant);
    let issue = summary
        .system_issues
        .iter()
        .find(|i| i.section.as_deref() == Some("opinion"))
        .unwrap();
    assert!(issue.message.contains("revision service unavailable"));

    let report = service.get_report(draft.id).await.unwrap();
    assert_eq!(report.section("opinion").unwrap().content, WEAK_OPINION);
    assert_eq!(report.system_issues, summary.system_issues);
}

/// Refuses to commit issued reports and remembers the numbers it handed out.
struct IssueRejectingStore {
    inner: InMemoryReportStore,
    reserved: Mutex<Vec<String>>,
}

#[async_trait]
impl ReportStore for IssueRejectingStore {
    async fn insert(&self, report: Report) -> Result<Report> {
        self.inner.insert(report).await
    }

    async fn get(&self, id: ReportId) -> Result<Report> {
        self.inner.get(id).await
    }

    async fn list(&self, status: Option<ReportStatus>) -> Result<Vec<Report>> {
        self.inner.list(status).await
    }

    async fn commit(&self, report: Report) -> Result<Report> {
        if report.status == ReportStatus::Issued {
            return Err(AuditGraphError::ConcurrentModification {
                report_id: report.id,
                expected: report.version,
                found: report.version + 1,
            });
        }
        self.inner.commit(report).await
    }

    async fn reserve_number(&self, number: &str, id: ReportId) -> Result<bool> {
        let reserved = self.inner.reserve_number(number, id).await?;
        if reserved {
            self.reserved.lock().unwrap().push(number.to_string());
        }
        Ok(reserved)
    }

    async fn release_number(&self, number: &str, id: ReportId) -> Result<()> {
        self.inner.release_number(number, id).await
    }
}

#[tokio::test]
async fn failed_issuance_releases_the_number() {
    let store = Arc::new(IssueRejectingStore {
        inner: InMemoryReportStore::new(),
        reserved: Mutex::new(Vec::new()),
    });
    let generator = Arc::new(ScriptedGenerator::new(GOOD_OPINION));
    let service = service_over(Settings::default(), generator, store.clone());
    let draft = service.generate_report(audit_request()).await.unwrap();
    service
        .validate_compliance(draft.id, ValidationType::Full, false)
        .await
        .unwrap();
    service.approve_report(draft.id, "partner-7", None).await.unwrap();

    let err = service.issue_report(draft.id).await.unwrap_err();
    assert!(matches!(err, AuditGraphError::ConcurrentModification { .. }));

    let number = store.reserved.lock().unwrap().pop().unwrap();
    let other = ReportId::new_v4();
    assert!(store.inner.reserve_number(&number, other).await.unwrap());
    let report = service.get_report(draft.id).await.unwrap();
    assert_eq!(report.status, ReportStatus::Approved);
    assert!(report.report_number.is_none());
}

#[tokio::test]
async fn issued_reports_are_frozen() {
    let (service, _store, _) = service_with(GOOD_OPINION);
    let draft = service.generate_report(audit_request()).await.unwrap();
    service
        .validate_compliance(draft.id, ValidationType::Full, false)
        .await
        .unwrap();
    service.approve_report(draft.id, "partner-7", None).await.unwrap();
    service.issue_report(draft.id).await.unwrap();
    let issued = service.get_report(draft.id).await.unwrap();

    assert!(matches!(
        service.validate_compliance(draft.id, ValidationType::Full, false).await,
        Err(AuditGraphError::StateTransition { .. })
    ));
    assert!(matches!(
        service.approve_report(draft.id, "partner-7", None).await,
        Err(AuditGraphError::StateTransition { .. })
    ));
    assert!(service.issue_report(draft.id).await.is_err());
    assert!(service.request_revision(draft.id, "late edit").await.is_err());
    assert_eq!(service.get_report(draft.id).await.unwrap(), issued);
}

#[tokio::test]
async fn stale_writes_are_rejected() {
    let (service, store, _) = service_with(GOOD_OPINION);
    let draft = service.generate_report(audit_request()).await.unwrap();
    service
        .validate_compliance(draft.id, ValidationType::Full, false)
        .await
        .unwrap();

    let stale = service.get_report(draft.id).await.unwrap();
    service.approve_report(draft.id, "partner-7", None).await.unwrap();

    let err = store.commit(stale).await.unwrap_err();
    assert!(matches!(err, AuditGraphError::ConcurrentModification { .. }));
    assert_eq!(
        service.get_report(draft.id).await.unwrap().status,
        ReportStatus::Approved
    );

    let (first, second) = tokio::join!(
        service.issue_report(draft.id),
        service.issue_report(draft.id)
    );
    assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
}

#[tokio::test]
async fn self_consistency_records_the_vote() {
    let (service, _store, generator) = service_with(GOOD_OPINION);
    let mut request = audit_request();
    request.flags.self_consistency = true;
    request.flags.samples = Some(3);

    let draft = service.generate_report(request).await.unwrap();
    assert_eq!(draft.generation_method, GenerationMethod::SelfConsistency);
    // three full pipeline runs of six agents
    assert_eq!(generator.calls.load(Ordering::SeqCst), 18);

    let audit = draft.consensus.as_ref().unwrap();
    assert_eq!(audit.requested_samples, 3);
    assert_eq!(audit.samples.len(), 3);
    assert!(audit
        .samples
        .iter()
        .all(|s| s.outcome == SampleOutcome::Completed));
    let opinion = audit.decisions.iter().find(|d| d.key == "opinion_type").unwrap();
    assert_eq!(opinion.value, "unmodified");
    approx::assert_relative_eq!(opinion.agreement, 1.0);
}

#[tokio::test]
async fn unregistered_report_type_stores_nothing() {
    let (service, store, _) = service_with(GOOD_OPINION);
    let request = GenerateReportRequest::new(
        ReportType::Compilation,
        "private_company",
        "US GAAP",
        ReportContext::new("Acme Corp"),
    );
    assert!(matches!(
        service.generate_report(request).await,
        Err(AuditGraphError::NotFound(_))
    ));
    assert!(store.is_empty());
}

#[tokio::test]
async fn rules_from_templates_join_validation() {
    let (service, _store, _) = service_with(GOOD_OPINION);
    let params = HashMap::from([
        ("section".to_string(), "key_audit_matters".to_string()),
        ("phrase".to_string(), "inventory valuation".to_string()),
    ]);
    let rule = service
        .create_rule_from_template("required-phrase", "CUS-KAM-001", &params)
        .unwrap();
    assert_eq!(rule.scope.sections, vec!["key_audit_matters"]);
    assert!(service
        .list_compliance_rules(Some(ReportType::AuditOpinion))
        .iter()
        .any(|r| r.id == "CUS-KAM-001"));

    let draft = service.generate_report(audit_request()).await.unwrap();
    let summary = service
        .validate_compliance(draft.id, ValidationType::Quick, false)
        .await
        .unwrap();
    assert!(summary.violations.iter().any(|v| v.rule_id == "CUS-KAM-001"));
}
