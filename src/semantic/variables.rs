//! Column-variable discovery.
//!
//! Four passes over the literal-free query text populate a
//! [VariableMap] for one record source: basic positional (`a3`), array
//! style (`a[3]`, `a["name"]`), dictionary style (header names behind
//! string subscripts), and attribute style (`a.name`). Input adapters
//! call [build_variable_map] from their `get_variables_map`
//! implementation.

use std::collections::HashMap;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::parser::preprocess;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    /// False for alias registrations that exist only so star expansion
    /// and EXCEPT can name them.
    pub initialize: bool,
    /// None marks a row-scoped pseudo-variable (NR, NF).
    pub index: Option<usize>,
}

pub type VariableMap = HashMap<String, VariableInfo>;

/// Header names that can never become attribute variables.
const RESERVED_NAMES: &[&str] = &["NR", "NF", "a", "b"];

static BASIC_VARIABLE_RES: Lazy<[(char, Regex); 2]> = Lazy::new(|| {
    let make = |prefix| {
        Regex::new(&format!(r"\b{prefix}([1-9][0-9]*)\b")).expect("valid regex")
    };
    [('a', make('a')), ('b', make('b'))]
});

static ARRAY_VARIABLE_RES: Lazy<[(char, Regex); 2]> = Lazy::new(|| {
    let make = |prefix| {
        Regex::new(&format!(r"\b{prefix}\[([1-9][0-9]*)\]")).expect("valid regex")
    };
    [('a', make('a')), ('b', make('b'))]
});

static DICT_VARIABLE_RES: Lazy<[(char, Regex); 2]> = Lazy::new(|| {
    let make = |prefix| {
        Regex::new(&format!(
            r"\b{prefix}\[___RBQL_STRING_LITERAL([0-9]+)___\]"
        ))
        .expect("valid regex")
    };
    [('a', make('a')), ('b', make('b'))]
});

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[_a-zA-Z][_a-zA-Z0-9]*$").expect("valid regex"));

fn regex_for<'a>(prefix: char, table: &'a [(char, Regex); 2]) -> Option<&'a Regex> {
    table.iter().find(|(p, _)| *p == prefix).map(|(_, re)| re)
}

/// Pass 1: `a1`, `a2`, ... map to 0-based positional indices. A trailing
/// `.` or `[` is a legal boundary so that `a1.split(",")` still
/// registers `a1`.
pub fn parse_basic_variables(text: &str, prefix: char, map: &mut VariableMap) {
    let Some(re) = regex_for(prefix, &BASIC_VARIABLE_RES) else {
        return;
    };
    for caps in re.captures_iter(text) {
        if let Ok(number) = caps[1].parse::<usize>() {
            map.insert(
                format!("{prefix}{number}"),
                VariableInfo {
                    initialize: true,
                    index: Some(number - 1),
                },
            );
        }
    }
}

/// Pass 2: `a[3]` — 1-based like `a3`.
pub fn parse_array_variables(text: &str, prefix: char, map: &mut VariableMap) {
    let Some(re) = regex_for(prefix, &ARRAY_VARIABLE_RES) else {
        return;
    };
    for caps in re.captures_iter(text) {
        if let Ok(number) = caps[1].parse::<usize>() {
            map.insert(
                format!("{prefix}[{number}]"),
                VariableInfo {
                    initialize: true,
                    index: Some(number - 1),
                },
            );
        }
    }
}

/// Pass 3: `a["name"]` / `a['name']` resolved against the header. Both
/// quote styles are registered for every referenced column; the
/// single-quoted alias is marked `initialize: false`.
pub fn parse_dictionary_variables(
    text: &str,
    prefix: char,
    literals: &[String],
    header: &[String],
    map: &mut VariableMap,
) {
    let Some(re) = regex_for(prefix, &DICT_VARIABLE_RES) else {
        return;
    };
    let mut referenced: Vec<String> = Vec::new();
    for caps in re.captures_iter(text) {
        if let Ok(literal_index) = caps[1].parse::<usize>() {
            if let Some(literal) = literals.get(literal_index) {
                referenced.push(preprocess::unquote_string_literal(literal));
            }
        }
    }
    for (i, column_name) in header.iter().enumerate() {
        if referenced.iter().any(|r| r == column_name) {
            map.insert(
                format!("{prefix}[\"{column_name}\"]"),
                VariableInfo {
                    initialize: true,
                    index: Some(i),
                },
            );
            map.insert(
                format!("{prefix}['{column_name}']"),
                VariableInfo {
                    initialize: false,
                    index: Some(i),
                },
            );
        }
    }
}

/// Pass 4: `a.name` for identifier-valid, non-reserved header names.
pub fn parse_attribute_variables(
    text: &str,
    prefix: char,
    header: &[String],
    map: &mut VariableMap,
) {
    for (i, column_name) in header.iter().enumerate() {
        if RESERVED_NAMES.contains(&column_name.as_str())
            || !IDENTIFIER_RE.is_match(column_name)
        {
            continue;
        }
        let re = Regex::new(&format!(
            r"\b{prefix}\.{}\b",
            regex::escape(column_name)
        ));
        let Ok(re) = re else { continue };
        if re.is_match(text) {
            map.insert(
                format!("{prefix}.{column_name}"),
                VariableInfo {
                    initialize: true,
                    index: Some(i),
                },
            );
        }
    }
}

/// Opt-out pass (`normalize_column_names = false`): header names usable
/// as bare variables.
pub fn map_bare_column_names(text: &str, header: &[String], map: &mut VariableMap) {
    for (i, column_name) in header.iter().enumerate() {
        if RESERVED_NAMES.contains(&column_name.as_str())
            || !IDENTIFIER_RE.is_match(column_name)
        {
            continue;
        }
        let re = Regex::new(&format!(r"\b{}\b", regex::escape(column_name)));
        let Ok(re) = re else { continue };
        if re.is_match(text) {
            map.insert(
                column_name.clone(),
                VariableInfo {
                    initialize: true,
                    index: Some(i),
                },
            );
        }
    }
}

fn register_special_variables(text: &str, map: &mut VariableMap) {
    for name in ["NR", "NF"] {
        let re = Regex::new(&format!(r"\b{name}\b")).expect("valid regex");
        if re.is_match(text) {
            map.insert(
                name.to_string(),
                VariableInfo {
                    initialize: true,
                    index: None,
                },
            );
        }
    }
}

/// The default `get_variables_map` implementation: run every pass
/// against the raw query text.
pub fn build_variable_map(
    query_text: &str,
    prefix: char,
    header: Option<&[String]>,
    normalize_column_names: bool,
) -> Result<VariableMap> {
    let stripped = preprocess::strip_comments(query_text);
    let (format_expression, literals) = preprocess::separate_string_literals(&stripped)?;
    let text = preprocess::normalize_whitespace(&format_expression);

    let mut map = VariableMap::new();
    parse_basic_variables(&text, prefix, &mut map);
    parse_array_variables(&text, prefix, &mut map);
    if let Some(header) = header {
        parse_dictionary_variables(&text, prefix, &literals, header, &mut map);
        parse_attribute_variables(&text, prefix, header, &mut map);
        if !normalize_column_names {
            map_bare_column_names(&text, header, &mut map);
        }
    }
    if prefix == 'a' {
        register_special_variables(&text, &mut map);
    }
    Ok(map)
}

#[cfg(test)]
mod test {
    use super::*;

    fn names(map: &VariableMap) -> Vec<String> {
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }

    #[test]
    fn test_basic_variables() {
        let map = build_variable_map("select a1, a2 where b3 > a10", 'a', None, true).unwrap();
        assert_eq!(names(&map), vec!["a1", "a10", "a2"]);
        assert_eq!(map["a10"].index, Some(9));

        let map = build_variable_map("select a1, a2 where b3 > a10", 'b', None, true).unwrap();
        assert_eq!(names(&map), vec!["b3"]);
    }

    #[test]
    fn test_variable_followed_by_method_call() {
        let map = build_variable_map("select a1.split(\",\")", 'a', None, true).unwrap();
        assert_eq!(map["a1"].index, Some(0));
    }

    #[test]
    fn test_identifier_boundary_respected() {
        let map = build_variable_map("select a1x, za2", 'a', None, true).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_array_variables() {
        let map = build_variable_map("select a[2], a[10]", 'a', None, true).unwrap();
        assert_eq!(map["a[2]"].index, Some(1));
        assert_eq!(map["a[10]"].index, Some(9));
    }

    #[test]
    fn test_dictionary_variables() {
        let header = vec!["name".to_string(), "city x".to_string()];
        let map =
            build_variable_map("select a[\"city x\"]", 'a', Some(&header), true).unwrap();
        assert_eq!(map["a[\"city x\"]"].index, Some(1));
        assert!(map["a[\"city x\"]"].initialize);
        assert!(!map["a['city x']"].initialize);
        assert!(!map.contains_key("a[\"name\"]"));
    }

    #[test]
    fn test_attribute_variables() {
        let header = vec!["name".to_string(), "year".to_string(), "it-x".to_string()];
        let map = build_variable_map("select a.year where a.name", 'a', Some(&header), true)
            .unwrap();
        assert_eq!(map["a.year"].index, Some(1));
        assert_eq!(map["a.name"].index, Some(0));
        // non-identifier names are not attribute-addressable
        assert!(!map.contains_key("a.it-x"));
    }

    #[test]
    fn test_bare_column_names() {
        let header = vec!["name".to_string(), "year".to_string()];
        let map = build_variable_map("select year", 'a', Some(&header), false).unwrap();
        assert_eq!(map["year"].index, Some(1));
        assert!(!map.contains_key("name"));
    }

    #[test]
    fn test_special_variables() {
        let map = build_variable_map("select NR, NF", 'a', None, true).unwrap();
        assert_eq!(map["NR"].index, None);
        assert_eq!(map["NF"].index, None);
        let map = build_variable_map("select NR", 'b', None, true).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_string_literal_content_ignored() {
        let map = build_variable_map("select \"a1 and a2\", a3", 'a', None, true).unwrap();
        assert_eq!(names(&map), vec!["a3"]);
    }
}
