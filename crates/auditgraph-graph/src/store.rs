use arc_swap::ArcSwap;
use auditgraph_core::{RelationshipKind, Result, Standard};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::snapshot::{Edge, GraphConflict, GraphSnapshot};

/// Knowledge graph of standards with lock-free reads and serialized,
/// versioned copy-on-write updates.
///
/// - Readers call [`KnowledgeGraph::snapshot`] and keep the `Arc` for as long as
///   they need a consistent view.
/// - Writers take the write mutex, mutate a clone, and swap it in only if every
///   integrity check passed; a rejected write leaves the published snapshot untouched.
#[derive(Debug, Default)]
pub struct KnowledgeGraph {
    current: ArcSwap<GraphSnapshot>,
    writer: Mutex<()>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_standards(standards: Vec<Standard>) -> Result<Self> {
        let graph = Self::new();
        graph.add_standards(standards)?;
        Ok(graph)
    }

    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version()
    }

    /// Adds a standard (or refreshes its metadata) together with any edges it declares.
    pub fn add_standard(&self, standard: Standard) -> Result<u64> {
        self.add_standards(vec![standard])
    }

    /// Adds several standards atomically: nodes first, then declared edges, so
    /// a batch may reference standards that appear later in the same batch.
    pub fn add_standards(&self, standards: Vec<Standard>) -> Result<u64> {
        let count = standards.len();
        let version = self.update(|next| {
            for standard in &standards {
                next.insert_node(standard)?;
            }
            for standard in &standards {
                for edge in GraphSnapshot::declared_edges(standard) {
                    next.insert_edge(edge)?;
                }
            }
            Ok(())
        })?;
        info!(count, version, "standards added to knowledge graph");
        Ok(version)
    }

    /// Adds `from --kind--> to`. For `Supersedes`, `from` replaces `to`.
    pub fn add_relationship(&self, from: &str, kind: RelationshipKind, to: &str) -> Result<u64> {
        let edge = Edge {
            from: from.to_string(),
            kind,
            to: to.to_string(),
        };
        let version = self.update(|next| next.insert_edge(edge).map(|_| ()))?;
        debug!(from, to, %kind, version, "relationship added");
        Ok(version)
    }

    pub fn resolve(&self, query: &str) -> Option<Standard> {
        self.snapshot().resolve(query).cloned()
    }

    pub fn current_version(&self, id: &str) -> Option<Standard> {
        self.snapshot().current_version(id).cloned()
    }

    pub fn detect_conflicts(&self) -> Vec<GraphConflict> {
        self.snapshot().detect_conflicts()
    }

    fn update<F>(&self, apply: F) -> Result<u64>
    where
        F: FnOnce(&mut GraphSnapshot) -> Result<()>,
    {
        let _guard = self.writer.lock();
        let mut next = GraphSnapshot::clone(&self.current.load());
        apply(&mut next)?;
        next.version += 1;
        let version = next.version;
        self.current.store(Arc::new(next));
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditgraph_core::AuditGraphError;
    use std::thread;

    fn as2110_family() -> KnowledgeGraph {
        KnowledgeGraph::from_standards(vec![
            Standard::new("pcaob-as-2110", "PCAOB", "AS 2110")
                .with_title("Identifying and Assessing Risks of Material Misstatement"),
            Standard::new("pcaob-as-2110-r2023", "PCAOB", "AS 2110 (Revised 2023)")
                .superseding("pcaob-as-2110"),
            Standard::new("aicpa-au-c-700", "AICPA", "AU-C 700"),
        ])
        .unwrap()
    }

    #[test]
    fn current_version_walks_supersession_chain() {
        let graph = as2110_family();
        graph
            .add_standard(
                Standard::new("pcaob-as-2110-r2025", "PCAOB", "AS 2110 (Revised 2025)")
                    .superseding("pcaob-as-2110-r2023"),
            )
            .unwrap();

        let current = graph.current_version("pcaob-as-2110").unwrap();
        assert_eq!(current.id, "pcaob-as-2110-r2025");
        let current = graph.current_version("pcaob-as-2110-r2025").unwrap();
        assert_eq!(current.id, "pcaob-as-2110-r2025");
    }

    #[test]
    fn supersession_cycle_is_rejected_and_graph_unchanged() {
        let graph = as2110_family();
        let before = graph.version();

        let err = graph
            .add_relationship(
                "pcaob-as-2110",
                RelationshipKind::Supersedes,
                "pcaob-as-2110-r2023",
            )
            .unwrap_err();
        assert!(matches!(err, AuditGraphError::GraphIntegrity(_)));
        assert_eq!(graph.version(), before);
        assert!(graph
            .snapshot()
            .get("pcaob-as-2110")
            .unwrap()
            .supersedes
            .is_empty());

        let err = graph
            .add_relationship("aicpa-au-c-700", RelationshipKind::Supersedes, "aicpa-au-c-700")
            .unwrap_err();
        assert!(matches!(err, AuditGraphError::GraphIntegrity(_)));
    }

    #[test]
    fn dangling_relationship_is_rejected() {
        let graph = as2110_family();
        let err = graph
            .add_relationship("aicpa-au-c-700", RelationshipKind::References, "missing")
            .unwrap_err();
        assert!(err.to_string().contains("dangling"));
    }

    #[test]
    fn failed_batch_publishes_nothing() {
        let graph = as2110_family();
        let before = graph.snapshot();
        let result = graph.add_standards(vec![
            Standard::new("isa-570", "IAASB", "ISA 570"),
            Standard::new("isa-700", "IAASB", "ISA 700").superseding("unknown"),
        ]);
        assert!(result.is_err());
        assert!(graph.resolve("ISA 570").is_none());
        assert_eq!(graph.version(), before.version());
    }

    #[test]
    fn readers_keep_their_snapshot_across_writes() {
        let graph = as2110_family();
        let old = graph.snapshot();
        graph
            .add_standard(Standard::new("isa-570", "IAASB", "ISA 570 (Revised)"))
            .unwrap();

        assert!(old.resolve("ISA 570 (Revised)").is_none());
        assert!(graph.snapshot().resolve("isa 570 (revised)").is_some());
        assert_eq!(graph.version(), old.version() + 1);
    }

    #[test]
    fn resolves_by_number_and_paragraph() {
        let graph = as2110_family();
        let snapshot = graph.snapshot();
        assert_eq!(snapshot.resolve("AU-C 700.12").unwrap().id, "aicpa-au-c-700");
        assert_eq!(snapshot.resolve("as  2110").unwrap().id, "pcaob-as-2110");
        assert_eq!(snapshot.resolve("pcaob-as-2110").unwrap().number, "AS 2110");
        assert!(snapshot.resolve("AS 9999").is_none());
    }

    #[test]
    fn duplicate_citation_number_is_rejected() {
        let graph = as2110_family();
        let err = graph
            .add_standard(Standard::new("other", "PCAOB", "as 2110"))
            .unwrap_err();
        assert!(matches!(err, AuditGraphError::GraphIntegrity(_)));
    }

    #[test]
    fn detects_conflicting_relationships() {
        let graph = as2110_family();
        graph
            .add_standards(vec![
                Standard::new("alt-2110", "PCAOB", "AS 2110A").superseding("pcaob-as-2110"),
                Standard::new("guide-1", "AICPA", "AAG 1"),
            ])
            .unwrap();
        graph
            .add_relationship("guide-1", RelationshipKind::References, "pcaob-as-2110")
            .unwrap();
        graph
            .add_relationship(
                "pcaob-as-2110-r2023",
                RelationshipKind::CorrespondsTo,
                "pcaob-as-2110",
            )
            .unwrap();

        let conflicts = graph.detect_conflicts();
        assert!(conflicts.iter().any(|c| matches!(
            c,
            GraphConflict::MultipleSuccessors { standard, successors }
                if standard == "pcaob-as-2110" && successors.len() == 2
        )));
        assert!(conflicts
            .iter()
            .any(|c| matches!(c, GraphConflict::ContradictoryRelationship { .. })));
        assert!(conflicts.iter().any(|c| matches!(
            c,
            GraphConflict::ReferencesSuperseded { from, .. } if from == "guide-1"
        )));
    }

    #[test]
    fn concurrent_readers_see_consistent_snapshots() {
        let graph = Arc::new(as2110_family());
        let mut handles = Vec::new();
        for i in 0..4 {
            let g = graph.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let snap = g.snapshot();
                    // supersession edge and its back-reference are published together
                    let old = snap.get("pcaob-as-2110").unwrap();
                    assert_eq!(old.superseded_by.as_deref(), Some("pcaob-as-2110-r2023"));
                    let _ = snap.resolve(&format!("GEN {}", i));
                }
            }));
        }
        for i in 0..20 {
            graph
                .add_standard(Standard::new(format!("gen-{}", i), "TEST", format!("GEN {}", i)))
                .unwrap();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(graph.snapshot().len(), 23);
    }
}
