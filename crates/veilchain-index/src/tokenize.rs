use std::collections::BTreeSet;

/// Hard cap on tokens taken from one text; oversized payloads index their
/// head rather than ballooning the term space.
const MAX_TOKENS_PER_TEXT: usize = 512;

/// Split free text into normalized index terms: lowercase, alphanumeric
/// runs, at least two characters.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let mut terms = BTreeSet::new();
    let mut taken = 0usize;
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.len() < 2 {
            continue;
        }
        if terms.insert(raw.to_lowercase()) {
            taken += 1;
            if taken >= MAX_TOKENS_PER_TEXT {
                break;
            }
        }
    }
    terms
}

/// Normalize a single user-supplied term the same way the indexer does.
pub fn normalize_term(term: &str) -> Option<String> {
    let t = term.trim().to_lowercase();
    if t.len() < 2 {
        None
    } else {
        Some(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_normalizes() {
        let terms = tokenize("Quarterly REPORT: project-x, 2026!");
        assert!(terms.contains("quarterly"));
        assert!(terms.contains("report"));
        assert!(terms.contains("project"));
        assert!(terms.contains("2026"));
        assert!(!terms.contains("x"));
    }

    #[test]
    fn single_characters_dropped() {
        assert!(tokenize("a b c").is_empty());
    }

    #[test]
    fn normalize_rejects_short_terms() {
        assert_eq!(normalize_term("  Fin  "), Some("fin".into()));
        assert_eq!(normalize_term("x"), None);
    }
}
