//! Citation token recognition shared by section construction and the citation validator.

use once_cell::sync::Lazy;
use regex::Regex;

/// Bracketed regulatory references: `[AS 2110]`, `[AU-C 700.12]`,
/// `[ASC 205-40]`, `[ISA 570 (Revised)]`.
pub static CITATION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\[((?:[A-Z][A-Za-z]*(?:-[A-Z][A-Za-z]*)?\s+)+\d+[A-Za-z0-9]*(?:[.\-]\d+[A-Za-z0-9]*)*(?:\s*\([^\[\]()]+\))?)\]",
    )
    .expect("citation pattern is valid")
});

static PARAGRAPH_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d)\.\d+[A-Za-z0-9]*").expect("paragraph pattern is valid"));

/// Citation tokens in order of first appearance, without brackets, deduplicated.
pub fn extract_citations(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in CITATION_PATTERN.captures_iter(text) {
        let token = caps[1].split_whitespace().collect::<Vec<_>>().join(" ");
        if !out.contains(&token) {
            out.push(token);
        }
    }
    out
}

/// Canonical lookup key: uppercase, single spaces.
pub fn normalize_citation(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// `AU-C 700.12` -> `AU-C 700`. `None` when there is no paragraph suffix.
pub fn strip_paragraph(raw: &str) -> Option<String> {
    if PARAGRAPH_SUFFIX.is_match(raw) {
        Some(PARAGRAPH_SUFFIX.replacen(raw, 1, "$1").into_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_common_citation_shapes() {
        let text = "Per [AS 2110], [AU-C 700.12], [ASC 205-40] and [ISA 570 (Revised)]. \
                    Footnote [1] and [see below] are ignored.";
        assert_eq!(
            extract_citations(text),
            vec!["AS 2110", "AU-C 700.12", "ASC 205-40", "ISA 570 (Revised)"]
        );
    }

    #[test]
    fn deduplicates_and_collapses_whitespace() {
        let text = "[AS  2110] then [AS 2110] again";
        assert_eq!(extract_citations(text), vec!["AS 2110"]);
    }

    #[test]
    fn strips_paragraph_reference() {
        assert_eq!(strip_paragraph("AU-C 700.12").as_deref(), Some("AU-C 700"));
        assert_eq!(strip_paragraph("AS 2110"), None);
        assert_eq!(normalize_citation(" as   2110 "), "AS 2110");
    }
}
