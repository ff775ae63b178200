//! Compliance rule engine and citation validation.

pub mod catalog;
pub mod citations;
pub mod engine;
pub mod rules;
pub mod semantic;
pub mod structural;

pub use catalog::{builtin_rules, builtin_templates, RuleCatalog, RuleTemplate};
pub use citations::CitationValidator;
pub use engine::{
    ComplianceEngine, ComplianceOutcome, EngineConfig, FixOutcome, PipelineRepairer,
    SectionRepairer, ValidationSubject, ValidationType,
};
pub use rules::{ComplianceRule, RuleScope, StructuralCheck, ValidationKind};
pub use semantic::{parse_verdict, SemanticJudge, SemanticVerdict};
pub use structural::{ParsedSection, StructuralPredicate};
