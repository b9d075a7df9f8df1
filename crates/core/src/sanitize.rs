// crates/core/src/sanitize.rs
//! Pre-decode repair of transcript lines.
//!
//! The transcript producer writes captured error text verbatim, which can
//! leave lone UTF-16 surrogate escapes (`\uD83D` with no low half) or
//! truncated `\u` sequences in the middle of a JSON string. `serde_json`
//! rejects the whole line for these, so each raw line is repaired first:
//! the offending escape is replaced with U+FFFD and everything else is
//! passed through untouched.

use std::borrow::Cow;

const REPLACEMENT: char = '\u{FFFD}';

/// Repair lone surrogate halves and malformed `\u` escapes in a raw line.
///
/// Returns the input unchanged (borrowed) when it contains no `\u` escape.
/// Valid escapes, including proper surrogate pairs, are preserved verbatim.
pub fn sanitize_line(line: &str) -> Cow<'_, str> {
    if !line.contains("\\u") {
        return Cow::Borrowed(line);
    }

    let bytes = line.as_bytes();
    let mut out = String::with_capacity(line.len());
    let mut i = 0;

    while i < bytes.len() {
        let Some(rel) = line[i..].find('\\') else {
            out.push_str(&line[i..]);
            break;
        };
        out.push_str(&line[i..i + rel]);
        i += rel;

        // Count the backslash run. Pairs are literal backslashes; only an
        // odd run leaves a live escape introducer.
        let run_start = i;
        while i < bytes.len() && bytes[i] == b'\\' {
            i += 1;
        }
        let run = i - run_start;
        for _ in 0..run / 2 {
            out.push_str("\\\\");
        }
        if run % 2 == 0 {
            continue;
        }

        if i >= bytes.len() || bytes[i] != b'u' {
            // Some other escape (\n, \", \t, ...) — emit verbatim.
            out.push('\\');
            continue;
        }

        // We are at the `u` of a live `\u` escape.
        match parse_hex4(&bytes[i + 1..]) {
            Some(cp) if (0xD800..=0xDBFF).contains(&cp) => {
                // High surrogate — valid only with a low half right behind it.
                let rest = &bytes[i + 5..];
                let low = (rest.len() >= 6 && rest[0] == b'\\' && rest[1] == b'u')
                    .then(|| parse_hex4(&rest[2..]))
                    .flatten()
                    .filter(|lo| (0xDC00..=0xDFFF).contains(lo));
                if low.is_some() {
                    out.push('\\');
                    out.push_str(&line[i..i + 11]);
                    i += 11;
                } else {
                    out.push(REPLACEMENT);
                    i += 5;
                }
            }
            Some(cp) if (0xDC00..=0xDFFF).contains(&cp) => {
                // Lone low surrogate.
                out.push(REPLACEMENT);
                i += 5;
            }
            Some(_) => {
                out.push('\\');
                out.push_str(&line[i..i + 5]);
                i += 5;
            }
            None => {
                // Truncated escape: consume `u` plus whatever hex digits
                // follow so the fragment does not leak into the output.
                let mut consumed = 1;
                while consumed < 5
                    && i + consumed < bytes.len()
                    && bytes[i + consumed].is_ascii_hexdigit()
                {
                    consumed += 1;
                }
                out.push(REPLACEMENT);
                i += consumed;
            }
        }
    }

    Cow::Owned(out)
}

/// Parse exactly four ASCII hex digits into a code unit.
fn parse_hex4(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 4 {
        return None;
    }
    let mut value: u32 = 0;
    for &b in &bytes[..4] {
        let digit = (b as char).to_digit(16)?;
        value = value * 16 + digit;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_lines_are_borrowed() {
        let line = r#"{"type":"user","message":{"content":"hello"}}"#;
        assert!(matches!(sanitize_line(line), Cow::Borrowed(_)));
    }

    #[test]
    fn valid_escapes_pass_through() {
        let line = r#"{"content":"café \n \" \\ done"}"#;
        assert_eq!(sanitize_line(line).as_ref(), line);
    }

    #[test]
    fn valid_surrogate_pair_is_preserved() {
        let line = "{\"content\":\"\\uD83D\\uDE00\"}";
        assert_eq!(sanitize_line(line).as_ref(), line);
        // The result must stay decodable.
        let v: serde_json::Value = serde_json::from_str(sanitize_line(line).as_ref()).unwrap();
        assert_eq!(v["content"].as_str().unwrap(), "\u{1F600}");
    }

    #[test]
    fn lone_high_surrogate_becomes_replacement() {
        let line = r#"{"content":"broken \uD83D here"}"#;
        let repaired = sanitize_line(line);
        assert_eq!(repaired.as_ref(), "{\"content\":\"broken \u{FFFD} here\"}");
        assert!(serde_json::from_str::<serde_json::Value>(repaired.as_ref()).is_ok());
    }

    #[test]
    fn lone_low_surrogate_becomes_replacement() {
        let line = r#"{"content":"\uDC00"}"#;
        assert_eq!(sanitize_line(line).as_ref(), "{\"content\":\"\u{FFFD}\"}");
    }

    #[test]
    fn truncated_escape_is_consumed() {
        let line = r#"{"content":"bad \uD8"}"#;
        let repaired = sanitize_line(line);
        assert_eq!(repaired.as_ref(), "{\"content\":\"bad \u{FFFD}\"}");
        assert!(serde_json::from_str::<serde_json::Value>(repaired.as_ref()).is_ok());
    }

    #[test]
    fn escaped_backslash_is_not_an_escape() {
        // `\\u1234` is a literal backslash followed by text, not an escape.
        let line = r#"{"content":"\\uD83D"}"#;
        assert_eq!(sanitize_line(line).as_ref(), line);
    }

    #[test]
    fn high_surrogate_followed_by_plain_text_is_replaced() {
        let line = r#"{"content":"\uD83DA"}"#;
        assert_eq!(sanitize_line(line).as_ref(), "{\"content\":\"\u{FFFD}A\"}");
    }
}
