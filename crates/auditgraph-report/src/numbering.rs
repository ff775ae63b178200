use auditgraph_core::ReportType;
use chrono::NaiveDate;
use uuid::Uuid;

/// `<PREFIX>-<YYYYMMDD>-<SUFFIX>` where the suffix is eight uppercase hex
/// digits of a random UUID. Uniqueness within a store is enforced when the
/// number is reserved, not here.
pub fn report_number(report_type: ReportType, issued_on: NaiveDate) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect::<String>()
        .to_uppercase();
    format!(
        "{}-{}-{}",
        report_type.number_prefix(),
        issued_on.format("%Y%m%d"),
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn number_has_prefix_date_and_suffix() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let number = report_number(ReportType::AuditOpinion, date);
        let shape = Regex::new(r"^AUD-20240331-[0-9A-F]{8}$").unwrap();
        assert!(shape.is_match(&number), "unexpected number {number}");
        assert!(report_number(ReportType::InternalControl, date).starts_with("ICR-"));
    }
}
