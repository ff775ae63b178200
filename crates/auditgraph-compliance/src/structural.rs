use std::collections::HashMap;
use std::sync::Arc;

use crate::rules::StructuralCheck;

/// Section text split into the units structural rules reason about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSection {
    pub paragraphs: Vec<String>,
    pub headings: Vec<String>,
    pub word_count: usize,
}

impl ParsedSection {
    /// Paragraphs are blank-line separated blocks. A line is a heading when it
    /// starts with `#` or ends with `:` and is at most eight words long.
    pub fn parse(content: &str) -> Self {
        let mut parsed = ParsedSection::default();
        let mut current: Vec<&str> = Vec::new();

        let flush = |current: &mut Vec<&str>, parsed: &mut ParsedSection| {
            if !current.is_empty() {
                parsed.paragraphs.push(current.join(" "));
                current.clear();
            }
        };

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                flush(&mut current, &mut parsed);
                continue;
            }
            if let Some(heading) = as_heading(trimmed) {
                flush(&mut current, &mut parsed);
                parsed.headings.push(heading);
                continue;
            }
            parsed.word_count += trimmed.split_whitespace().count();
            current.push(trimmed);
        }
        flush(&mut current, &mut parsed);
        parsed
    }

    pub fn has_heading(&self, heading: &str) -> bool {
        self.headings.iter().any(|h| h.eq_ignore_ascii_case(heading.trim()))
    }
}

fn as_heading(line: &str) -> Option<String> {
    if line.starts_with('#') {
        return Some(line.trim_start_matches('#').trim().to_string());
    }
    if line.ends_with(':') && line.split_whitespace().count() <= 8 {
        return Some(line.trim_end_matches(':').trim().to_string());
    }
    None
}

/// A named predicate over a parsed section, registered on the engine.
pub type StructuralPredicate = Arc<dyn Fn(&ParsedSection) -> bool + Send + Sync>;

/// Outcome of a structural check: `Ok(None)` passes, `Ok(Some(detail))` fails,
/// `Err(name)` means the named callable is not registered.
pub(crate) fn run_check(
    check: &StructuralCheck,
    parsed: &ParsedSection,
    callables: &HashMap<String, StructuralPredicate>,
) -> Result<Option<String>, String> {
    let failure = match check {
        StructuralCheck::MinWords { min } => (parsed.word_count < *min)
            .then(|| format!("section has {} words, at least {} required", parsed.word_count, min)),
        StructuralCheck::MaxWords { max } => (parsed.word_count > *max)
            .then(|| format!("section has {} words, at most {} allowed", parsed.word_count, max)),
        StructuralCheck::MinParagraphs { min } => (parsed.paragraphs.len() < *min).then(|| {
            format!(
                "section has {} paragraphs, at least {} required",
                parsed.paragraphs.len(),
                min
            )
        }),
        StructuralCheck::RequiresHeading { heading } => (!parsed.has_heading(heading))
            .then(|| format!("missing required heading '{}'", heading)),
        StructuralCheck::Custom { name } => {
            let predicate = callables.get(name).ok_or_else(|| name.clone())?;
            (!predicate(parsed)).then(|| format!("structural check '{}' failed", name))
        }
    };
    Ok(failure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_paragraphs_headings_and_words() {
        let text = "# Opinion\nIn our opinion the statements\npresent fairly.\n\nSecond paragraph here.\n\nBasis for Opinion:\nWe are independent.";
        let parsed = ParsedSection::parse(text);
        assert_eq!(parsed.headings, vec!["Opinion", "Basis for Opinion"]);
        assert_eq!(parsed.paragraphs.len(), 3);
        assert_eq!(parsed.paragraphs[0], "In our opinion the statements present fairly.");
        assert_eq!(parsed.word_count, 13);
        assert!(parsed.has_heading("basis for opinion"));
    }

    #[test]
    fn runs_builtin_and_custom_checks() {
        let parsed = ParsedSection::parse("One two three.\n\nFour five.");
        let mut callables: HashMap<String, StructuralPredicate> = HashMap::new();
        callables.insert(
            "two_paragraphs".to_string(),
            Arc::new(|p: &ParsedSection| p.paragraphs.len() == 2),
        );

        assert_eq!(run_check(&StructuralCheck::MinWords { min: 5 }, &parsed, &callables), Ok(None));
        assert!(run_check(&StructuralCheck::MaxWords { max: 4 }, &parsed, &callables)
            .unwrap()
            .is_some());
        assert_eq!(
            run_check(
                &StructuralCheck::Custom { name: "two_paragraphs".into() },
                &parsed,
                &callables
            ),
            Ok(None)
        );
        assert_eq!(
            run_check(&StructuralCheck::Custom { name: "missing".into() }, &parsed, &callables),
            Err("missing".to_string())
        );
    }
}
