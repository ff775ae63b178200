use auditgraph_core::{
    normalize_citation, strip_paragraph, AuditGraphError, RelationshipKind, Result, Standard,
    StandardId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: StandardId,
    pub kind: RelationshipKind,
    pub to: StandardId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "conflict", rename_all = "snake_case")]
pub enum GraphConflict {
    /// More than one standard claims to supersede the same standard.
    MultipleSuccessors {
        standard: StandardId,
        successors: Vec<StandardId>,
    },
    /// A pair is related by supersession and also by equivalence/implementation.
    ContradictoryRelationship {
        from: StandardId,
        to: StandardId,
        kinds: Vec<RelationshipKind>,
    },
    /// A current standard still points at a superseded one.
    ReferencesSuperseded {
        from: StandardId,
        to: StandardId,
        kind: RelationshipKind,
    },
}

impl fmt::Display for GraphConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphConflict::MultipleSuccessors {
                standard,
                successors,
            } => write!(
                f,
                "{} is superseded by several standards: {}",
                standard,
                successors.join(", ")
            ),
            GraphConflict::ContradictoryRelationship { from, to, kinds } => {
                let kinds: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
                write!(
                    f,
                    "{} and {} are related by conflicting kinds: {}",
                    from,
                    to,
                    kinds.join(", ")
                )
            }
            GraphConflict::ReferencesSuperseded { from, to, kind } => {
                write!(f, "current standard {} {} superseded {}", from, kind, to)
            }
        }
    }
}

/// Immutable view of the knowledge graph at one version.
///
/// Every write clones the current snapshot, mutates the clone and publishes it
/// with `version + 1`; readers holding an older `Arc<GraphSnapshot>` are unaffected.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    pub(crate) version: u64,
    pub(crate) standards: BTreeMap<StandardId, Standard>,
    pub(crate) number_index: HashMap<String, StandardId>,
    pub(crate) edges: BTreeSet<Edge>,
}

impl GraphSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.standards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.standards.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Standard> {
        self.standards.get(id)
    }

    pub fn standards(&self) -> impl Iterator<Item = &Standard> {
        self.standards.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    /// Resolves by id, then by citation number, then by the number without a
    /// paragraph suffix (`AU-C 700.12` -> `AU-C 700`).
    pub fn resolve(&self, query: &str) -> Option<&Standard> {
        if let Some(standard) = self.standards.get(query.trim()) {
            return Some(standard);
        }
        let key = normalize_citation(query);
        if let Some(id) = self.number_index.get(&key) {
            return self.standards.get(id);
        }
        let base = strip_paragraph(&key)?;
        self.number_index
            .get(&base)
            .and_then(|id| self.standards.get(id))
    }

    /// Follows `superseded_by` until reaching a standard nothing supersedes.
    pub fn current_version(&self, id: &str) -> Option<&Standard> {
        let mut current = self.standards.get(id)?;
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(next_id) = current.superseded_by.as_deref() {
            if !seen.insert(current.id.as_str()) {
                // unreachable while the supersession DAG invariant holds
                break;
            }
            match self.standards.get(next_id) {
                Some(next) => current = next,
                None => break,
            }
        }
        Some(current)
    }

    /// Standards that supersede `id` directly.
    pub fn successors(&self, id: &str) -> Vec<&StandardId> {
        self.edges
            .iter()
            .filter(|e| e.kind == RelationshipKind::Supersedes && e.to == id)
            .map(|e| &e.from)
            .collect()
    }

    pub fn relationships_of(&self, id: &str) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| e.from == id || e.to == id)
            .collect()
    }

    pub fn detect_conflicts(&self) -> Vec<GraphConflict> {
        let mut conflicts = Vec::new();

        for id in self.standards.keys() {
            let successors = self.successors(id);
            if successors.len() > 1 {
                conflicts.push(GraphConflict::MultipleSuccessors {
                    standard: id.clone(),
                    successors: successors.into_iter().cloned().collect(),
                });
            }
        }

        let mut pair_kinds: BTreeMap<(StandardId, StandardId), BTreeSet<RelationshipKind>> =
            BTreeMap::new();
        for edge in &self.edges {
            let key = if edge.from <= edge.to {
                (edge.from.clone(), edge.to.clone())
            } else {
                (edge.to.clone(), edge.from.clone())
            };
            pair_kinds.entry(key).or_default().insert(edge.kind);
        }
        for ((from, to), kinds) in pair_kinds {
            let supersedes = kinds.contains(&RelationshipKind::Supersedes);
            let equivalent = kinds.contains(&RelationshipKind::CorrespondsTo)
                || kinds.contains(&RelationshipKind::Implements);
            if supersedes && equivalent {
                conflicts.push(GraphConflict::ContradictoryRelationship {
                    from,
                    to,
                    kinds: kinds.into_iter().collect(),
                });
            }
        }

        for edge in &self.edges {
            if !matches!(
                edge.kind,
                RelationshipKind::References | RelationshipKind::Implements
            ) {
                continue;
            }
            let from_current = self
                .standards
                .get(&edge.from)
                .map(Standard::is_current)
                .unwrap_or(false);
            let to_superseded = self
                .standards
                .get(&edge.to)
                .map(|s| !s.is_current())
                .unwrap_or(false);
            if from_current && to_superseded {
                conflicts.push(GraphConflict::ReferencesSuperseded {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    kind: edge.kind,
                });
            }
        }

        conflicts
    }

    // -- mutation, only ever applied to a private clone by `KnowledgeGraph` --

    pub(crate) fn insert_node(&mut self, standard: &Standard) -> Result<()> {
        if standard.id.trim().is_empty() {
            return Err(AuditGraphError::GraphIntegrity(
                "standard id cannot be empty".to_string(),
            ));
        }
        if standard.number.trim().is_empty() {
            return Err(AuditGraphError::GraphIntegrity(format!(
                "standard {} has no citation number",
                standard.id
            )));
        }

        let key = normalize_citation(&standard.number);
        if let Some(owner) = self.number_index.get(&key) {
            if owner != &standard.id {
                return Err(AuditGraphError::GraphIntegrity(format!(
                    "citation number '{}' already belongs to {}",
                    standard.number, owner
                )));
            }
        }

        match self.standards.get_mut(&standard.id) {
            Some(existing) => {
                let old_key = normalize_citation(&existing.number);
                if old_key != key {
                    self.number_index.remove(&old_key);
                }
                existing.issuing_body = standard.issuing_body.clone();
                existing.number = standard.number.clone();
                existing.title = standard.title.clone();
            }
            None => {
                let mut node = standard.clone();
                node.supersedes.clear();
                node.superseded_by = None;
                node.relationships.clear();
                self.standards.insert(node.id.clone(), node);
            }
        }
        self.number_index.insert(key, standard.id.clone());
        Ok(())
    }

    /// Edges declared on an inserted standard.
    pub(crate) fn declared_edges(standard: &Standard) -> Vec<Edge> {
        let mut edges: Vec<Edge> = standard
            .supersedes
            .iter()
            .map(|target| Edge {
                from: standard.id.clone(),
                kind: RelationshipKind::Supersedes,
                to: target.clone(),
            })
            .collect();
        if let Some(successor) = &standard.superseded_by {
            edges.push(Edge {
                from: successor.clone(),
                kind: RelationshipKind::Supersedes,
                to: standard.id.clone(),
            });
        }
        edges.extend(standard.relationships.iter().map(|r| Edge {
            from: standard.id.clone(),
            kind: r.kind,
            to: r.target.clone(),
        }));
        edges
    }

    pub(crate) fn insert_edge(&mut self, edge: Edge) -> Result<bool> {
        for endpoint in [&edge.from, &edge.to] {
            if !self.standards.contains_key(endpoint) {
                return Err(AuditGraphError::GraphIntegrity(format!(
                    "dangling relationship {} {} {}: unknown standard {}",
                    edge.from, edge.kind, edge.to, endpoint
                )));
            }
        }

        if edge.kind == RelationshipKind::Supersedes {
            if edge.from == edge.to {
                return Err(AuditGraphError::GraphIntegrity(format!(
                    "{} cannot supersede itself",
                    edge.from
                )));
            }
            if self.supersedes_transitively(&edge.to, &edge.from) {
                return Err(AuditGraphError::GraphIntegrity(format!(
                    "{} supersedes {} would create a supersession cycle",
                    edge.from, edge.to
                )));
            }
        }

        if !self.edges.insert(edge.clone()) {
            return Ok(false);
        }

        if let Some(from) = self.standards.get_mut(&edge.from) {
            from.relationships.push(auditgraph_core::Relationship {
                kind: edge.kind,
                target: edge.to.clone(),
            });
            if edge.kind == RelationshipKind::Supersedes {
                from.supersedes.push(edge.to.clone());
            }
        }
        if edge.kind == RelationshipKind::Supersedes {
            // latest supersession wins; competing successors surface in detect_conflicts
            if let Some(to) = self.standards.get_mut(&edge.to) {
                to.superseded_by = Some(edge.from.clone());
            }
        }
        Ok(true)
    }

    /// True when `start` supersedes `target` through one or more edges.
    fn supersedes_transitively(&self, start: &str, target: &str) -> bool {
        let mut stack = vec![start];
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(standard) = self.standards.get(id) {
                stack.extend(standard.supersedes.iter().map(String::as_str));
            }
        }
        false
    }
}
