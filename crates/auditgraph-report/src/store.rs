use async_trait::async_trait;
use auditgraph_core::{AuditGraphError, Report, ReportId, ReportStatus, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Persistence boundary for reports.
///
/// `commit` is the only way to change a stored report: it succeeds only when
/// the caller's copy still carries the stored `version`, and bumps it.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Stores a new report at version 1.
    async fn insert(&self, report: Report) -> Result<Report>;

    async fn get(&self, id: ReportId) -> Result<Report>;

    async fn list(&self, status: Option<ReportStatus>) -> Result<Vec<Report>>;

    /// Replaces the stored report if `report.version` matches, returning the
    /// committed copy with its new version.
    async fn commit(&self, report: Report) -> Result<Report>;

    /// Claims an issuance number for `id`. `false` when another report holds it.
    async fn reserve_number(&self, number: &str, id: ReportId) -> Result<bool>;

    async fn release_number(&self, number: &str, id: ReportId) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryReportStore {
    reports: Arc<DashMap<ReportId, Report>>,
    numbers: Arc<DashMap<String, ReportId>>,
}

impl InMemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn insert(&self, mut report: Report) -> Result<Report> {
        report.version = 1;
        match self.reports.entry(report.id) {
            Entry::Occupied(_) => Err(AuditGraphError::ConcurrentModification {
                report_id: report.id,
                expected: 0,
                found: 1,
            }),
            Entry::Vacant(slot) => {
                slot.insert(report.clone());
                debug!(report_id = %report.id, "report stored");
                Ok(report)
            }
        }
    }

    async fn get(&self, id: ReportId) -> Result<Report> {
        self.reports
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| AuditGraphError::NotFound(format!("report {}", id)))
    }

    async fn list(&self, status: Option<ReportStatus>) -> Result<Vec<Report>> {
        let mut reports: Vec<Report> = self
            .reports
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .map(|r| r.value().clone())
            .collect();
        reports.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(reports)
    }

    async fn commit(&self, mut report: Report) -> Result<Report> {
        // The shard write lock held by `get_mut` makes check-and-swap atomic.
        let mut stored = self
            .reports
            .get_mut(&report.id)
            .ok_or_else(|| AuditGraphError::NotFound(format!("report {}", report.id)))?;
        if stored.version != report.version {
            return Err(AuditGraphError::ConcurrentModification {
                report_id: report.id,
                expected: report.version,
                found: stored.version,
            });
        }
        report.version += 1;
        *stored = report.clone();
        debug!(
            report_id = %report.id,
            version = report.version,
            status = %report.status,
            "report committed"
        );
        Ok(report)
    }

    async fn reserve_number(&self, number: &str, id: ReportId) -> Result<bool> {
        match self.numbers.entry(number.to_string()) {
            Entry::Occupied(holder) => Ok(*holder.get() == id),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(true)
            }
        }
    }

    async fn release_number(&self, number: &str, id: ReportId) -> Result<()> {
        self.numbers.remove_if(number, |_, holder| *holder == id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditgraph_core::{GenerationMethod, ReportContext, ReportType};
    use tokio_test::block_on;
    use uuid::Uuid;

    fn draft() -> Report {
        Report::new_draft(
            ReportType::AuditOpinion,
            "public_company",
            "US GAAP",
            ReportContext::new("Acme Corp"),
            GenerationMethod::Pipeline,
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn stale_commit_is_rejected() {
        let store = InMemoryReportStore::new();
        let stored = store.insert(draft()).await.unwrap();
        assert_eq!(stored.version, 1);

        let first = stored.clone();
        let second = stored.clone();
        let committed = store.commit(first).await.unwrap();
        assert_eq!(committed.version, 2);

        match store.commit(second).await.unwrap_err() {
            AuditGraphError::ConcurrentModification { expected, found, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn numbers_are_unique_per_store() {
        let store = InMemoryReportStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(store.reserve_number("AUD-20240101-AAAAAAAA", a).await.unwrap());
        assert!(store.reserve_number("AUD-20240101-AAAAAAAA", a).await.unwrap());
        assert!(!store.reserve_number("AUD-20240101-AAAAAAAA", b).await.unwrap());

        store.release_number("AUD-20240101-AAAAAAAA", b).await.unwrap();
        assert!(!store.reserve_number("AUD-20240101-AAAAAAAA", b).await.unwrap());
        store.release_number("AUD-20240101-AAAAAAAA", a).await.unwrap();
        assert!(store.reserve_number("AUD-20240101-AAAAAAAA", b).await.unwrap());
    }

    #[test]
    fn missing_reports_are_not_found() {
        let store = InMemoryReportStore::new();
        assert!(matches!(
            block_on(store.get(Uuid::new_v4())),
            Err(AuditGraphError::NotFound(_))
        ));
        assert!(block_on(store.list(None)).unwrap().is_empty());
        assert!(store.is_empty());
    }
}
