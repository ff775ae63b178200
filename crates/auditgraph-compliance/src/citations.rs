use auditgraph_core::{extract_citations, AuditGraphError, CitationRecord, CitationReport, Section};
use auditgraph_graph::GraphSnapshot;
use tracing::debug;

/// Checks bracketed citations against one knowledge-graph snapshot.
///
/// Output depends only on the text and the snapshot: records follow section
/// order, then first appearance within the section.
#[derive(Debug, Clone, Copy, Default)]
pub struct CitationValidator;

impl CitationValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_sections(
        &self,
        snapshot: &GraphSnapshot,
        sections: &[Section],
    ) -> CitationReport {
        let records = sections
            .iter()
            .flat_map(|section| self.validate_text(snapshot, &section.name, &section.content))
            .collect();
        CitationReport {
            records,
            graph_version: snapshot.version(),
        }
    }

    pub fn validate_text(
        &self,
        snapshot: &GraphSnapshot,
        section: &str,
        text: &str,
    ) -> Vec<CitationRecord> {
        extract_citations(text)
            .into_iter()
            .map(|raw| self.check(snapshot, section, raw))
            .collect()
    }

    fn check(&self, snapshot: &GraphSnapshot, section: &str, raw: String) -> CitationRecord {
        let Some(standard) = snapshot.resolve(&raw) else {
            let error = AuditGraphError::CitationResolution {
                citation: raw.clone(),
                message: "no matching standard in the knowledge graph".to_string(),
            };
            debug!(section, "{}", error);
            return CitationRecord {
                raw,
                section: section.to_string(),
                standard_id: None,
                valid: false,
                current: false,
                superseded_by: None,
                superseded_by_number: None,
                message: Some(error.to_string()),
            };
        };

        if standard.is_current() {
            return CitationRecord {
                raw,
                section: section.to_string(),
                standard_id: Some(standard.id.clone()),
                valid: true,
                current: true,
                superseded_by: None,
                superseded_by_number: None,
                message: None,
            };
        }

        let latest = snapshot
            .current_version(&standard.id)
            .filter(|s| s.id != standard.id);
        let message = match latest {
            Some(latest) => format!(
                "[{}] cites {}, which has been superseded by {}",
                raw, standard.number, latest.number
            ),
            None => format!("[{}] cites {}, which has been superseded", raw, standard.number),
        };
        CitationRecord {
            section: section.to_string(),
            standard_id: Some(standard.id.clone()),
            valid: true,
            current: false,
            superseded_by: latest.map(|s| s.id.clone()),
            superseded_by_number: latest.map(|s| s.number.clone()),
            message: Some(message),
            raw,
        }
    }
}
