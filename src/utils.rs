//! Helpers for scanning the condition strings the planner prints. All of them treat text between
//! single quotes as opaque, with `''` as an escaped quote.

/// Byte offset of the parenthesis closing the one at `open`.
pub fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(open) != Some(&b'(') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_quote = false;
    for (idx, &byte) in bytes.iter().enumerate().skip(open) {
        match byte {
            b'\'' => in_quote = !in_quote,
            b'(' if !in_quote => depth += 1,
            b')' if !in_quote => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Removes one pair of parentheses if they enclose the whole text.
pub fn strip_outer_parens(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.starts_with('(') && matching_paren(trimmed, 0) == Some(trimmed.len() - 1) {
        trimmed[1..trimmed.len() - 1].trim()
    } else {
        trimmed
    }
}

pub fn is_parenthesized(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with('(') && matching_paren(trimmed, 0) == Some(trimmed.len() - 1)
}

/// Splits on `separator` where it occurs outside of parentheses and quotes.
pub fn split_top_level<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let bytes = text.as_bytes();
    let sep = separator.as_bytes();
    let mut parts = vec![];
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut start = 0;
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\'' => in_quote = !in_quote,
            b'(' if !in_quote => depth += 1,
            b')' if !in_quote => depth -= 1,
            _ if !in_quote && depth == 0 && bytes[idx..].starts_with(sep) => {
                parts.push(&text[start..idx]);
                idx += sep.len();
                start = idx;
                continue;
            }
            _ => {}
        }
        idx += 1;
    }
    parts.push(&text[start..]);
    parts
}

pub fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_paren() {
        let text = "((a = ')') AND (b = 1))";
        assert_eq!(matching_paren(text, 0), Some(text.len() - 1));
        assert_eq!(matching_paren(text, 1), Some(9));
        assert_eq!(matching_paren(text, 2), None);
        assert_eq!(matching_paren("(a", 0), None);
    }

    #[test]
    fn test_strip_outer_parens() {
        assert_eq!(strip_outer_parens(" (a = 1) "), "a = 1");
        assert_eq!(strip_outer_parens("(a = 1) AND (b = 2)"), "(a = 1) AND (b = 2)");
        assert_eq!(strip_outer_parens("a = 1"), "a = 1");
        assert!(is_parenthesized("((a) OR (b))"));
        assert!(!is_parenthesized("(a) OR (b)"));
    }

    #[test]
    fn test_split_top_level() {
        assert_eq!(
            split_top_level("(a AND b) AND c = ' AND ' AND d", " AND "),
            vec!["(a AND b)", "c = ' AND '", "d"]
        );
        assert_eq!(split_top_level("x", " AND "), vec!["x"]);
    }
}
