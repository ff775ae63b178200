use auditgraph_core::{AuditGraphError, Result, Standard};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// On-disk catalogue of standards (`.json` or `.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StandardsFile {
    #[serde(default)]
    pub standards: Vec<Standard>,
}

pub fn load_standards(path: &Path) -> Result<Vec<Standard>> {
    let raw = fs::read_to_string(path)?;
    let parsed: StandardsFile = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&raw).map_err(|e| {
            AuditGraphError::Configuration(format!("parsing {}: {}", path.display(), e))
        })?,
        _ => serde_json::from_str(&raw)?,
    };
    Ok(parsed.standards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KnowledgeGraph;

    #[test]
    fn loads_toml_catalogue_with_forward_references() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("standards.toml");
        fs::write(
            &path,
            r#"
[[standards]]
id = "pcaob-as-2110-r2023"
issuing_body = "PCAOB"
number = "AS 2110 (Revised 2023)"
supersedes = ["pcaob-as-2110"]

[[standards]]
id = "pcaob-as-2110"
issuing_body = "PCAOB"
number = "AS 2110"
"#,
        )
        .unwrap();

        let graph = KnowledgeGraph::from_standards(load_standards(&path).unwrap()).unwrap();
        assert_eq!(
            graph.current_version("pcaob-as-2110").unwrap().id,
            "pcaob-as-2110-r2023"
        );
    }
}
