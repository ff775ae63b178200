//! Shared vocabulary for the AuditGraph report engine: domain types, the error
//! taxonomy, citation token recognition and layered configuration.

pub mod citation;
pub mod config;
pub mod error;
pub mod types;

pub use citation::{extract_citations, normalize_citation, strip_paragraph, CITATION_PATTERN};
pub use config::{
    ComplianceSettings, ConfigManager, GenerationSettings, LifecycleSettings, LoggingSettings,
    PipelineSettings, Settings, VoterSettings,
};
pub use error::*;
pub use types::*;
