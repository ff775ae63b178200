//! Report lifecycle and the service facade.
//!
//! [`ReportService`] is the entry point: it generates drafts through the agent
//! pipeline (or the self-consistency voter), validates them against the rule
//! catalog and the standards graph, and walks them through approval and
//! issuance. Every state change goes through [`ReportStore::commit`], which
//! rejects stale writes.

pub mod lifecycle;
pub mod numbering;
pub mod service;
pub mod store;

pub use lifecycle::{ApprovalPolicy, VALIDATABLE};
pub use numbering::report_number;
pub use service::{
    CitationSummary, ComplianceSummary, GenerateReportRequest, GenerationFlags, ReportService,
};
pub use store::{InMemoryReportStore, ReportStore};
