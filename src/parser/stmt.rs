//! Statement splitter: locates top-level clause keywords in the
//! normalized, literal-free query text and slices it into clause
//! snippets with their modifiers.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    StrictLeft,
    Anti,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistinctMode {
    #[default]
    None,
    Distinct,
    DistinctCount,
}

/// The query sliced into clause texts, still carrying literal
/// placeholders.
#[derive(Debug, Default)]
pub struct Statements {
    pub select: Option<String>,
    pub update: Option<String>,
    pub where_clause: Option<String>,
    pub group_by: Option<String>,
    pub order_by: Option<String>,
    pub reverse_order: bool,
    pub except: Option<String>,
    pub join: Option<(JoinKind, String)>,
    pub from_table: Option<String>,
    pub top_count: Option<u64>,
    pub distinct: DistinctMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    Select,
    Update,
    Where,
    GroupBy,
    OrderBy,
    Limit,
    Except,
    From,
    StrictLeftJoin,
    LeftJoin,
    InnerJoin,
    AntiJoin,
    Join,
}

impl Keyword {
    fn display(&self) -> &'static str {
        match self {
            Keyword::Select => "SELECT",
            Keyword::Update => "UPDATE",
            Keyword::Where => "WHERE",
            Keyword::GroupBy => "GROUP BY",
            Keyword::OrderBy => "ORDER BY",
            Keyword::Limit => "LIMIT",
            Keyword::Except => "EXCEPT",
            Keyword::From => "FROM",
            Keyword::StrictLeftJoin => "STRICT LEFT JOIN",
            Keyword::LeftJoin => "LEFT JOIN",
            Keyword::InnerJoin => "INNER JOIN",
            Keyword::AntiJoin => "ANTI JOIN",
            Keyword::Join => "JOIN",
        }
    }

    fn join_kind(&self) -> Option<JoinKind> {
        match self {
            Keyword::StrictLeftJoin => Some(JoinKind::StrictLeft),
            Keyword::LeftJoin => Some(JoinKind::Left),
            Keyword::InnerJoin | Keyword::Join => Some(JoinKind::Inner),
            Keyword::AntiJoin => Some(JoinKind::Anti),
            _ => None,
        }
    }
}

const KEYWORDS: &[Keyword] = &[
    Keyword::Select,
    Keyword::Update,
    Keyword::Where,
    Keyword::GroupBy,
    Keyword::OrderBy,
    Keyword::Limit,
    Keyword::Except,
    Keyword::From,
    Keyword::StrictLeftJoin,
    Keyword::LeftJoin,
    Keyword::InnerJoin,
    Keyword::AntiJoin,
    Keyword::Join,
];

static KEYWORD_RES: Lazy<Vec<(Keyword, Regex)>> = Lazy::new(|| {
    KEYWORDS
        .iter()
        .map(|kw| {
            let pattern = format!(r"(?i)\b{}\b", kw.display());
            (*kw, Regex::new(&pattern).expect("valid keyword regex"))
        })
        .collect()
});

static TOP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^top ([0-9]+)(?: |$)").expect("valid regex"));
static DISTINCT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^distinct( count)?(?: |$)").expect("valid regex"));
static LIMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").expect("valid regex"));
static ORDER_DIRECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.*) (asc|desc)$").expect("valid regex"));
static UPDATE_SET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^set ").expect("valid regex"));

/// Keyword occurrences at word boundaries delimited by spaces (the text
/// is whitespace-normalized, so a single space is the only separator).
fn locate_keywords(text: &str) -> Vec<(usize, usize, Keyword)> {
    let bytes = text.as_bytes();
    let mut matches = Vec::new();
    for (kw, re) in KEYWORD_RES.iter() {
        for m in re.find_iter(text) {
            let space_before = m.start() == 0 || bytes[m.start() - 1] == b' ';
            let space_after = m.end() == bytes.len() || bytes[m.end()] == b' ';
            if space_before && space_after {
                matches.push((m.start(), m.end(), *kw));
            }
        }
    }
    // Longest match wins at equal starts; matches nested inside an
    // earlier, longer keyword are dropped.
    matches.sort_by(|l, r| l.0.cmp(&r.0).then(r.1.cmp(&l.1)));
    let mut kept: Vec<(usize, usize, Keyword)> = Vec::new();
    for m in matches {
        if kept.last().map_or(true, |last| m.0 >= last.1) {
            kept.push(m);
        }
    }
    kept
}

/// Slice the normalized query into clause texts and parse the clause
/// modifiers.
pub fn split_query(text: &str) -> Result<Statements> {
    let located = locate_keywords(text);
    if located.is_empty() || located[0].0 != 0 {
        return Err(Error::parsing(
            "Query must start with one of the following statements: SELECT, UPDATE",
        )
        .into());
    }

    let mut statements = Statements::default();
    let mut seen: Vec<Keyword> = Vec::new();
    for (i, &(_, end, kw)) in located.iter().enumerate() {
        let clause_end = located.get(i + 1).map(|next| next.0).unwrap_or(text.len());
        let clause = text[end..clause_end].trim().to_string();

        let group_name = kw.join_kind().map(|_| "JOIN").unwrap_or(kw.display());
        if seen
            .iter()
            .any(|s| s.join_kind().map(|_| "JOIN").unwrap_or(s.display()) == group_name)
        {
            return Err(Error::parsing(format!(
                "More than one \"{group_name}\" statements found"
            ))
            .into());
        }
        seen.push(kw);

        match kw {
            Keyword::Select => parse_select_modifiers(clause, &mut statements)?,
            Keyword::Update => {
                let clause = UPDATE_SET_RE.replace(&clause, "").into_owned();
                statements.update = Some(clause);
            }
            Keyword::Where => statements.where_clause = Some(clause),
            Keyword::GroupBy => statements.group_by = Some(clause),
            Keyword::OrderBy => {
                let (key, reverse) = match ORDER_DIRECTION_RE.captures(&clause) {
                    Some(caps) => (
                        caps[1].trim().to_string(),
                        caps[2].eq_ignore_ascii_case("desc"),
                    ),
                    None => (clause, false),
                };
                statements.order_by = Some(key);
                statements.reverse_order = reverse;
            }
            Keyword::Limit => {
                if !LIMIT_RE.is_match(&clause) {
                    return Err(Error::parsing("LIMIT keyword must be followed by an integer").into());
                }
                let count = clause
                    .parse()
                    .map_err(|_| Error::parsing("LIMIT keyword must be followed by an integer"))?;
                if statements.top_count.is_some() {
                    return Err(
                        Error::parsing("Unable to use both TOP and LIMIT in one query").into()
                    );
                }
                statements.top_count = Some(count);
            }
            Keyword::Except => statements.except = Some(clause),
            Keyword::From => {
                if clause.is_empty() || clause.contains(' ') {
                    return Err(Error::parsing("FROM keyword must be followed by a table identifier").into());
                }
                statements.from_table = Some(clause);
            }
            _ => {
                if let Some(kind) = kw.join_kind() {
                    statements.join = Some((kind, clause));
                }
            }
        }
    }

    match (&statements.select, &statements.update) {
        (Some(_), Some(_)) => {
            Err(Error::parsing("Query can not contain both SELECT and UPDATE statements").into())
        }
        (None, None) => {
            Err(Error::parsing("Query must contain either SELECT or UPDATE statement").into())
        }
        _ => Ok(statements),
    }
}

fn parse_select_modifiers(clause: String, statements: &mut Statements) -> Result<()> {
    let mut rest = clause;
    if let Some(caps) = TOP_RE.captures(&rest) {
        let count = caps[1]
            .parse()
            .map_err(|_| Error::parsing("Invalid TOP count"))?;
        statements.top_count = Some(count);
        let consumed = caps[0].len();
        rest = rest[consumed..].trim_start().to_string();
    }
    if let Some(caps) = DISTINCT_RE.captures(&rest) {
        statements.distinct = if caps.get(1).is_some() {
            DistinctMode::DistinctCount
        } else {
            DistinctMode::Distinct
        };
        let consumed = caps[0].len();
        rest = rest[consumed..].trim_start().to_string();
    }
    statements.select = Some(rest);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_basic_split() {
        let stmts = split_query("SELECT a1, a2 WHERE a1 == 5 ORDER BY a2 DESC LIMIT 10").unwrap();
        assert_eq!(stmts.select.as_deref(), Some("a1, a2"));
        assert_eq!(stmts.where_clause.as_deref(), Some("a1 == 5"));
        assert_eq!(stmts.order_by.as_deref(), Some("a2"));
        assert!(stmts.reverse_order);
        assert_eq!(stmts.top_count, Some(10));
    }

    #[test]
    fn test_case_insensitive_keywords() {
        let stmts = split_query("select * where a1").unwrap();
        assert_eq!(stmts.select.as_deref(), Some("*"));
        assert_eq!(stmts.where_clause.as_deref(), Some("a1"));
    }

    #[test]
    fn test_join_kinds() {
        let stmts = split_query("SELECT a1 STRICT LEFT JOIN b ON a1 == b1").unwrap();
        let (kind, clause) = stmts.join.unwrap();
        assert_eq!(kind, JoinKind::StrictLeft);
        assert_eq!(clause, "b ON a1 == b1");

        let stmts = split_query("SELECT a1 JOIN b ON a1 == b1").unwrap();
        assert_eq!(stmts.join.unwrap().0, JoinKind::Inner);

        let stmts = split_query("SELECT a1 ANTI JOIN b ON a1 == b1").unwrap();
        assert_eq!(stmts.join.unwrap().0, JoinKind::Anti);
    }

    #[test]
    fn test_top_and_distinct_modifiers() {
        let stmts = split_query("SELECT TOP 20 DISTINCT a1").unwrap();
        assert_eq!(stmts.top_count, Some(20));
        assert_eq!(stmts.distinct, DistinctMode::Distinct);
        assert_eq!(stmts.select.as_deref(), Some("a1"));

        let stmts = split_query("SELECT DISTINCT COUNT a1").unwrap();
        assert_eq!(stmts.distinct, DistinctMode::DistinctCount);
        assert_eq!(stmts.select.as_deref(), Some("a1"));
    }

    #[test]
    fn test_distinct_count_aggregate_not_confused_with_modifier() {
        let stmts = split_query("SELECT DISTINCT COUNT(a1)").unwrap();
        assert_eq!(stmts.distinct, DistinctMode::Distinct);
        assert_eq!(stmts.select.as_deref(), Some("COUNT(a1)"));
    }

    #[test]
    fn test_keyword_inside_identifier_not_split() {
        let stmts = split_query("SELECT selection WHERE wherever == 1").unwrap();
        assert_eq!(stmts.select.as_deref(), Some("selection"));
        assert_eq!(stmts.where_clause.as_deref(), Some("wherever == 1"));
    }

    #[test]
    fn test_duplicate_clause() {
        let err = split_query("SELECT a1 WHERE a1 WHERE a2").unwrap_err();
        assert!(err.to_string().contains("More than one \"WHERE\""));
        let err = split_query("SELECT a1 JOIN b ON a1 == b1 LEFT JOIN c ON a1 == b1").unwrap_err();
        assert!(err.to_string().contains("More than one \"JOIN\""));
    }

    #[test]
    fn test_select_and_update_conflict() {
        assert!(split_query("SELECT a1 UPDATE a2 = 3").is_err());
        assert!(split_query("WHERE a1").is_err());
    }

    #[test]
    fn test_query_prefix_rejected() {
        let err = split_query("hello SELECT a1").unwrap_err();
        assert!(err.to_string().contains("must start"));
    }

    #[test]
    fn test_update_set_prefix() {
        let stmts = split_query("UPDATE SET a1 = 5 WHERE a2 == 3").unwrap();
        assert_eq!(stmts.update.as_deref(), Some("a1 = 5"));
        let stmts = split_query("UPDATE a1 = 5").unwrap();
        assert_eq!(stmts.update.as_deref(), Some("a1 = 5"));
    }

    #[test]
    fn test_top_and_limit_conflict() {
        assert!(split_query("SELECT TOP 5 a1 LIMIT 5").is_err());
    }

    #[test]
    fn test_limit_requires_integer() {
        assert!(split_query("SELECT a1 LIMIT ten").is_err());
    }

    #[test]
    fn test_from_clause() {
        let stmts = split_query("SELECT a1 FROM input_table").unwrap();
        assert_eq!(stmts.from_table.as_deref(), Some("input_table"));
    }
}
