// crates/db/src/search.rs
//! Query-string handling for full-text search.
//!
//! User queries arrive as free text with optional quoted phrases. FTS5 has
//! its own query language (AND/OR/NEAR, column filters, `*` expansion), and
//! feeding raw user text into MATCH turns typos into syntax errors. So the
//! query is tokenized here into bare terms and quoted phrases, each term is
//! quoted to neutralize operators, and the terms are joined with OR —
//! search is a total function and never an error.

/// Maximum snippet length returned to callers, in characters.
pub const SNIPPET_MAX_CHARS: usize = 200;

/// Tokenize a raw query into terms and quoted phrases.
///
/// `project "exact phrase" ketchup` → `["project", "exact phrase", "ketchup"]`
pub fn tokenize_query(raw: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut chars = raw.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut phrase = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                phrase.push(c);
            }
            if !phrase.trim().is_empty() {
                terms.push(phrase.trim().to_string());
            }
        } else {
            let mut term = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '"' {
                    break;
                }
                term.push(c);
                chars.next();
            }
            terms.push(term);
        }
    }

    terms
}

/// Build an FTS5 MATCH expression with OR logic, or `None` for a query with
/// no usable terms.
///
/// Every term is double-quoted (internal quotes doubled) so FTS5 treats it
/// as a literal token or phrase rather than query syntax.
pub fn build_match_expr(raw: &str) -> Option<String> {
    let terms = tokenize_query(raw);
    if terms.is_empty() {
        return None;
    }

    let quoted: Vec<String> = terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    Some(quoted.join(" OR "))
}

/// Clamp a snippet to [`SNIPPET_MAX_CHARS`] on a char boundary.
pub fn clamp_snippet(snippet: &str) -> String {
    if snippet.chars().count() <= SNIPPET_MAX_CHARS {
        snippet.to_string()
    } else {
        snippet.chars().take(SNIPPET_MAX_CHARS).collect()
    }
}
