//! Lexical pre-pass over the raw query text.
//!
//! Comments are stripped, string literals are pulled out and replaced by
//! placeholder tokens, and whitespace is normalized. Everything
//! downstream (statement splitting, variable resolution) operates on the
//! literal-free text; [combine_string_literals] puts the literals back
//! when a snippet is parsed or reported.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Error;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"___RBQL_STRING_LITERAL([0-9]+)___").expect("valid regex"));

pub fn string_literal_placeholder(index: usize) -> String {
    format!("___RBQL_STRING_LITERAL{index}___")
}

/// True when the character at byte offset `pos` is preceded by an odd
/// number of backslashes.
fn is_escaped_at(chars: &[char], pos: usize) -> bool {
    let mut backslashes = 0;
    while backslashes < pos && chars[pos - backslashes - 1] == '\\' {
        backslashes += 1;
    }
    backslashes % 2 == 1
}

/// Remove `#`-to-end-of-line comments that occur outside string literals.
pub fn strip_comments(text: &str) -> String {
    let mut result = Vec::new();
    for line in text.lines() {
        let chars: Vec<char> = line.chars().collect();
        let mut cur_quote = None;
        let mut cut = chars.len();
        for (i, &c) in chars.iter().enumerate() {
            match cur_quote {
                None if c == '#' => {
                    cut = i;
                    break;
                }
                None if c == '\'' || c == '"' => cur_quote = Some(c),
                Some(q) if c == q && !is_escaped_at(&chars, i) => cur_quote = None,
                _ => {}
            }
        }
        result.push(chars[..cut].iter().collect::<String>().trim_end().to_string());
    }
    result.join("\n")
}

/// Replace every string literal with `___RBQL_STRING_LITERAL{i}___` and
/// return the literals (quotes included) in order of appearance.
pub fn separate_string_literals(text: &str) -> Result<(String, Vec<String>)> {
    let chars: Vec<char> = text.chars().collect();
    let mut format_expression = String::new();
    let mut literals = Vec::new();
    let mut cur_quote = None;
    let mut literal_start = 0;
    for (i, &c) in chars.iter().enumerate() {
        match cur_quote {
            None if c == '\'' || c == '"' => {
                cur_quote = Some(c);
                literal_start = i;
            }
            None => format_expression.push(c),
            Some(_) if c == '\n' => {
                return Err(Error::parsing(
                    "Multiline string literals are not allowed in the query",
                )
                .into());
            }
            Some(q) if c == q && !is_escaped_at(&chars, i) => {
                cur_quote = None;
                format_expression.push_str(&string_literal_placeholder(literals.len()));
                literals.push(chars[literal_start..=i].iter().collect());
            }
            Some(_) => {}
        }
    }
    if cur_quote.is_some() {
        return Err(Error::parsing("Unterminated string literal in the query").into());
    }
    Ok((format_expression, literals))
}

/// Inverse of [separate_string_literals].
pub fn combine_string_literals(code: &str, literals: &[String]) -> String {
    PLACEHOLDER_RE
        .replace_all(code, |caps: &regex::Captures| {
            let index: usize = caps[1].parse().unwrap_or(usize::MAX);
            literals.get(index).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Strip the surrounding quotes and decode backslash escapes.
pub fn unquote_string_literal(literal: &str) -> String {
    let chars: Vec<char> = literal.chars().collect();
    if chars.len() < 2 {
        return literal.to_string();
    }
    let mut result = String::new();
    let mut i = 1;
    while i < chars.len() - 1 {
        if chars[i] == '\\' && i + 1 < chars.len() - 1 {
            let next = chars[i + 1];
            result.push(match next {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => other,
            });
            i += 2;
        } else {
            result.push(chars[i]);
            i += 1;
        }
    }
    result
}

/// Collapse whitespace runs into single spaces.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_strip_comments() {
        assert_eq!(strip_comments("select a1 # hello"), "select a1");
        assert_eq!(strip_comments("v = \"hello\" #world  "), "v = \"hello\"");
        assert_eq!(
            strip_comments(r#"v = "hel\"lo" #w'or"ld  "#),
            r#"v = "hel\"lo""#
        );
        assert_eq!(
            strip_comments(r#"v = "hello\\" #w'or"ld  "#),
            r#"v = "hello\\""#
        );
        assert_eq!(strip_comments(" # a comment"), "");
        // '#' inside a literal is not a comment
        assert_eq!(strip_comments("select '#tag'"), "select '#tag'");
    }

    #[test]
    fn test_separate_string_literals() {
        let (code, literals) =
            separate_string_literals(r#"select a1, "hello", 'wor"ld'"#).unwrap();
        assert_eq!(
            code,
            "select a1, ___RBQL_STRING_LITERAL0___, ___RBQL_STRING_LITERAL1___"
        );
        assert_eq!(literals, vec![r#""hello""#, r#"'wor"ld'"#]);
        assert_eq!(
            combine_string_literals(&code, &literals),
            r#"select a1, "hello", 'wor"ld'"#
        );
    }

    #[test]
    fn test_escaped_quotes_stay_inside_literal() {
        let (code, literals) = separate_string_literals(r#"where a1 == 'it\'s'"#).unwrap();
        assert_eq!(code, "where a1 == ___RBQL_STRING_LITERAL0___");
        assert_eq!(literals, vec![r#"'it\'s'"#]);
    }

    #[test]
    fn test_unterminated_literal() {
        let err = separate_string_literals("select \"oops").unwrap_err();
        assert!(err.to_string().contains("Unterminated"));
    }

    #[test]
    fn test_multiline_literal() {
        let err = separate_string_literals("select \"a\nb\"").unwrap_err();
        assert!(err.to_string().contains("Multiline"));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote_string_literal(r#""a\tb""#), "a\tb");
        assert_eq!(unquote_string_literal(r#"'it\'s'"#), "it's");
        assert_eq!(unquote_string_literal(r#""back\\slash""#), "back\\slash");
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(
            normalize_whitespace("  select\ta1 ,\n a2  "),
            "select a1 , a2"
        );
    }
}
