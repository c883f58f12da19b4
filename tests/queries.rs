//! End-to-end query scenarios driven through the public API.

use rbql::{
    query, query_table, ErrorKind, InputIterator, QueryOptions, Record, TableIterator,
    TableRegistry, TableWriter, Value,
};
use similar_asserts::assert_eq;

fn s(text: &str) -> Value {
    Value::from(text)
}

fn i(number: i64) -> Value {
    Value::Int(number)
}

fn run(query_text: &str, input: Vec<Record>) -> Vec<Record> {
    query_table(query_text, input, None, &QueryOptions::new())
        .unwrap()
        .rows
}

fn run_join(query_text: &str, input: Vec<Record>, join: Vec<Record>) -> Vec<Record> {
    query_table(query_text, input, Some(join), &QueryOptions::new())
        .unwrap()
        .rows
}

fn people() -> Vec<Record> {
    vec![
        vec![s("Roosevelt"), i(1858), s("USA")],
        vec![s("Napoleon"), i(1769), s("France")],
        vec![s("Confucius"), i(-551), s("China")],
    ]
}

fn populations() -> Vec<Record> {
    vec![
        vec![s("China"), i(1386)],
        vec![s("France"), i(67)],
        vec![s("USA"), i(327)],
        vec![s("Russia"), i(140)],
    ]
}

#[test]
fn scenario_where_with_projection() {
    let input = vec![
        vec![s("abc"), i(1234)],
        vec![s("abc"), i(1234)],
        vec![s("efg"), i(100)],
        vec![s("abc"), i(100)],
        vec![s("cde"), i(12999)],
        vec![s("aaa"), i(2000)],
        vec![s("abc"), i(100)],
    ];
    let rows = run("SELECT a1, int(a2) * 10 WHERE a1 == \"abc\"", input);
    assert_eq!(
        rows,
        vec![
            vec![s("abc"), i(12340)],
            vec![s("abc"), i(12340)],
            vec![s("abc"), i(1000)],
            vec![s("abc"), i(1000)],
        ]
    );
}

#[test]
fn scenario_order_by_desc() {
    let rows = run("SELECT * ORDER BY int(a2) DESC", people());
    assert_eq!(
        rows,
        vec![
            vec![s("Roosevelt"), i(1858), s("USA")],
            vec![s("Napoleon"), i(1769), s("France")],
            vec![s("Confucius"), i(-551), s("China")],
        ]
    );
}

#[test]
fn scenario_inner_join_with_projection() {
    let rows = run_join(
        "SELECT a2 // 10, b2, \"name \" + a1 JOIN B ON a3 == b1 ORDER BY a2",
        people(),
        populations(),
    );
    assert_eq!(
        rows,
        vec![
            vec![i(-56), i(1386), s("name Confucius")],
            vec![i(176), i(67), s("name Napoleon")],
            vec![i(185), i(327), s("name Roosevelt")],
        ]
    );
}

#[test]
fn scenario_aggregation_with_implicit_grouping() {
    let input = vec![
        vec![i(1), s("x")],
        vec![i(2), s("x")],
        vec![i(3), s("y")],
        vec![i(4), s("y")],
        vec![i(5), s("y")],
    ];
    let rows = run("SELECT a2, COUNT(*), SUM(int(a1))", input);
    assert_eq!(
        rows,
        vec![vec![s("x"), i(2), i(3)], vec![s("y"), i(3), i(12)]]
    );
}

#[test]
fn scenario_unnest() {
    let rows = run("SELECT UNNEST(a1.split(\",\"))", vec![vec![s("a,b,c")]]);
    assert_eq!(rows, vec![vec![s("a")], vec![s("b")], vec![s("c")]]);
}

#[test]
fn scenario_left_join_null_padding() {
    let rows = run_join(
        "SELECT a1, b2 LEFT JOIN B ON a1 == b1",
        vec![vec![s("X"), i(1)], vec![s("Y"), i(2)]],
        vec![vec![s("X"), s("foo")]],
    );
    assert_eq!(
        rows,
        vec![vec![s("X"), s("foo")], vec![s("Y"), Value::Null]]
    );
}

// §8 invariants

#[test]
fn property_trivial_query_is_identity() {
    let input = people();
    let rows = run("SELECT * WHERE true", input.clone());
    assert_eq!(rows, input);
}

#[test]
fn property_filter_preserves_rows_and_order() {
    let input = people();
    let rows = run("SELECT * WHERE int(a2) > 0", input.clone());
    assert!(rows.len() <= input.len());
    let mut cursor = 0;
    for row in &rows {
        // every output row is an input row, in input order
        let position = input[cursor..].iter().position(|r| r == row).unwrap();
        cursor += position + 1;
    }
}

#[test]
fn property_order_by_desc_is_a_sorted_permutation() {
    let input = vec![
        vec![s("a"), i(5)],
        vec![s("b"), i(9)],
        vec![s("c"), i(1)],
        vec![s("d"), i(9)],
    ];
    let mut rows = run("SELECT a1, a2 ORDER BY a2 DESC", input.clone());
    for pair in rows.windows(2) {
        assert!(pair[0][1] >= pair[1][1]);
    }
    rows.sort();
    let mut expected = input;
    expected.sort();
    assert_eq!(rows, expected);
}

#[test]
fn property_distinct_is_idempotent() {
    let input = vec![
        vec![s("x")],
        vec![s("y")],
        vec![s("x")],
        vec![s("z")],
        vec![s("y")],
    ];
    let once = run("SELECT DISTINCT a1", input);
    let twice = run("SELECT DISTINCT a1", once.clone());
    assert_eq!(once, twice);
    assert_eq!(once, vec![vec![s("x")], vec![s("y")], vec![s("z")]]);
}

#[test]
fn property_aggregate_group_cardinality() {
    let input = vec![
        vec![i(1), s("x")],
        vec![i(2), s("y")],
        vec![i(3), s("x")],
    ];
    // all-aggregate projection: exactly one row
    let rows = run("SELECT COUNT(*)", input.clone());
    assert_eq!(rows, vec![vec![i(3)]]);
    // one row per distinct key
    let rows = run("SELECT a2, COUNT(*)", input);
    assert_eq!(rows.len(), 2);
}

#[test]
fn property_inner_join_cardinality() {
    let input = vec![vec![s("k1")], vec![s("k2")], vec![s("k1")]];
    let join = vec![
        vec![s("k1"), i(1)],
        vec![s("k1"), i(2)],
        vec![s("k3"), i(3)],
    ];
    let rows = run_join("SELECT a1, b2 JOIN B ON a1 == b1", input, join);
    // k1 matches twice (x2 input rows), k2 matches nothing
    assert_eq!(rows.len(), 4);
}

#[test]
fn property_left_join_covers_every_input_row() {
    let input = vec![vec![s("k1")], vec![s("k2")], vec![s("k1")]];
    let join = vec![vec![s("k1"), i(1)], vec![s("k1"), i(2)]];
    let rows = run_join("SELECT a1, b2 LEFT JOIN B ON a1 == b1", input, join);
    assert_eq!(rows.len(), 5);
    assert_eq!(
        rows.iter().filter(|r| r[1] == Value::Null).count(),
        1
    );
}

#[test]
fn property_unnest_fans_out_one_to_n() {
    let input = vec![vec![s("a,b")], vec![s("c")], vec![s("d,e,f")]];
    let rows = run("SELECT UNNEST(a1.split(\",\")), a1", input);
    assert_eq!(rows.len(), 6);
    assert_eq!(rows[0], vec![s("a"), s("a,b")]);
    assert_eq!(rows[5], vec![s("f"), s("d,e,f")]);
}

#[test]
fn property_limit_takes_a_prefix() {
    let input = people();
    let full = run("SELECT * ORDER BY int(a2)", input.clone());
    let limited = run("SELECT * ORDER BY int(a2) LIMIT 2", input);
    assert_eq!(limited, full[..2].to_vec());
}

#[test]
fn property_update_preserves_row_count_and_order() {
    let input = vec![
        vec![s("x"), i(1)],
        vec![s("y"), i(2)],
        vec![s("x"), i(3)],
    ];
    let rows = run("UPDATE SET a2 = a2 * 10 WHERE a1 == \"x\"", input);
    assert_eq!(
        rows,
        vec![
            vec![s("x"), i(10)],
            vec![s("y"), i(2)],
            vec![s("x"), i(30)],
        ]
    );
}

// surface details

#[test]
fn test_top_modifier() {
    let rows = run("SELECT TOP 2 a1", people());
    assert_eq!(rows, vec![vec![s("Roosevelt")], vec![s("Napoleon")]]);
}

#[test]
fn test_distinct_count() {
    let input = vec![vec![s("x")], vec![s("x")], vec![s("y")], vec![s("x")]];
    let rows = run("SELECT DISTINCT COUNT a1", input);
    assert_eq!(rows, vec![vec![i(3), s("x")], vec![i(1), s("y")]]);
}

#[test]
fn test_except() {
    let rows = run("SELECT * EXCEPT a2", people());
    assert_eq!(
        rows,
        vec![
            vec![s("Roosevelt"), s("USA")],
            vec![s("Napoleon"), s("France")],
            vec![s("Confucius"), s("China")],
        ]
    );
}

#[test]
fn test_like_patterns() {
    let input = vec![vec![s("abc")], vec![s("axxc")], vec![s("abcd")]];
    let rows = run("SELECT a1 WHERE a1 LIKE 'a%c'", input.clone());
    assert_eq!(rows, vec![vec![s("abc")], vec![s("axxc")]]);
    let rows = run("SELECT a1 WHERE a1 NOT LIKE 'a_c'", input);
    assert_eq!(rows, vec![vec![s("axxc")], vec![s("abcd")]]);
}

#[test]
fn test_nr_and_nf() {
    let input = vec![vec![s("x")], vec![s("y"), s("z")]];
    let rows = run("SELECT NR, NF", input);
    assert_eq!(rows, vec![vec![i(1), i(1)], vec![i(2), i(2)]]);
}

#[test]
fn test_safe_get_tolerates_short_records() {
    let input = vec![vec![s("x"), s("full")], vec![s("y")]];
    let rows = run("SELECT a1, safe_get(a, 2)", input);
    assert_eq!(
        rows,
        vec![vec![s("x"), s("full")], vec![s("y"), Value::Null]]
    );
}

#[test]
fn test_named_columns_and_output_header() {
    let options = QueryOptions::new()
        .with_input_column_names(vec!["name".to_string(), "year".to_string()]);
    let result = query_table(
        "SELECT a.year, a.name as who WHERE a[\"year\"] > 0",
        vec![
            vec![s("Roosevelt"), i(1858)],
            vec![s("Confucius"), i(-551)],
        ],
        None,
        &options,
    )
    .unwrap();
    assert_eq!(result.rows, vec![vec![i(1858), s("Roosevelt")]]);
    assert_eq!(
        result.header,
        Some(vec!["year".to_string(), "who".to_string()])
    );
}

#[test]
fn test_bare_column_names_without_normalization() {
    let options = QueryOptions::new()
        .with_normalized_column_names(false)
        .with_input_column_names(vec!["name".to_string(), "year".to_string()]);
    let result = query_table(
        "SELECT name WHERE year > 0",
        vec![
            vec![s("Roosevelt"), i(1858)],
            vec![s("Confucius"), i(-551)],
        ],
        None,
        &options,
    )
    .unwrap();
    assert_eq!(result.rows, vec![vec![s("Roosevelt")]]);
}

#[test]
fn test_strict_left_join_rejects_ambiguous_key() {
    let err = query_table(
        "SELECT a1, b2 STRICT LEFT JOIN B ON a1 == b1",
        vec![vec![s("k1")]],
        Some(vec![vec![s("k1"), i(1)], vec![s("k1"), i(2)]]),
        &QueryOptions::new(),
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(err.message.contains("STRICT LEFT JOIN"));
}

#[test]
fn test_anti_join() {
    let rows = run_join(
        "SELECT a1 ANTI JOIN B ON a1 == b1",
        vec![vec![s("k1")], vec![s("k2")], vec![s("k3")]],
        vec![vec![s("k1")], vec![s("k3")]],
    );
    assert_eq!(rows, vec![vec![s("k2")]]);
}

#[test]
fn test_update_with_join() {
    let rows = run_join(
        "UPDATE SET a2 = b2 WHERE b2 > a2 JOIN B ON a1 == b1",
        vec![vec![s("x"), i(5)], vec![s("y"), i(7)], vec![s("z"), i(1)]],
        vec![vec![s("x"), i(50)], vec![s("y"), i(2)]],
    );
    assert_eq!(
        rows,
        vec![
            vec![s("x"), i(50)],
            vec![s("y"), i(7)],
            vec![s("z"), i(1)],
        ]
    );
}

#[test]
fn test_update_with_ambiguous_join_match_fails() {
    let err = query_table(
        "UPDATE SET a2 = b2 JOIN B ON a1 == b1",
        vec![vec![s("x"), i(5)]],
        Some(vec![vec![s("x"), i(1)], vec![s("x"), i(2)]]),
        &QueryOptions::new(),
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(err.message.contains("UPDATE"));
}

#[test]
fn test_missing_field_error_is_annotated_with_record_number() {
    let err = query_table(
        "SELECT a3",
        vec![vec![s("x"), s("y")], vec![s("only")]],
        None,
        &QueryOptions::new(),
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(err.message, "No \"a3\" field at record 1");
}

#[test]
fn test_group_by_violation() {
    let err = query_table(
        "SELECT a1, COUNT(*) GROUP BY a2",
        vec![vec![s("p"), s("g")], vec![s("q"), s("g")]],
        None,
        &QueryOptions::new(),
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(err.message.contains("Unable to group by"));
}

#[test]
fn test_explicit_group_by_fixes_the_key() {
    let input = vec![
        vec![s("x"), i(1)],
        vec![s("y"), i(2)],
        vec![s("x"), i(4)],
    ];
    let rows = run("SELECT MAX(a2), MIN(a2) GROUP BY a1", input);
    assert_eq!(rows, vec![vec![i(4), i(1)], vec![i(2), i(2)]]);
}

#[test]
fn test_aggregate_functions() {
    let input = vec![
        vec![i(2), s("x")],
        vec![i(4), s("x")],
        vec![i(9), s("y")],
    ];
    let rows = run(
        "SELECT a2, AVG(a1), MEDIAN(a1), VARIANCE(a1), ARRAY_AGG(a1), FOLD(a1)",
        input,
    );
    assert_eq!(
        rows,
        vec![
            vec![
                s("x"),
                Value::Float(3.0),
                Value::Float(3.0),
                Value::Float(1.0),
                Value::List(vec![i(2), i(4)]),
                s("2|4"),
            ],
            vec![
                s("y"),
                Value::Float(9.0),
                i(9),
                Value::Float(0.0),
                Value::List(vec![i(9)]),
                s("9"),
            ],
        ]
    );
}

#[test]
fn test_count_distinct_aggregate() {
    let input = vec![
        vec![s("x"), s("g")],
        vec![s("x"), s("g")],
        vec![s("y"), s("g")],
    ];
    let rows = run("SELECT a2, COUNT(DISTINCT a1)", input);
    assert_eq!(rows, vec![vec![s("g"), i(2)]]);
}

#[test]
fn test_inconsistent_field_counts_warning() {
    let result = query_table(
        "SELECT a1",
        vec![vec![s("x"), s("y")], vec![s("only")]],
        None,
        &QueryOptions::new(),
    )
    .unwrap();
    assert_eq!(result.rows.len(), 2);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("Inconsistent number of fields")));
}

#[test]
fn test_comments_are_stripped() {
    let rows = run(
        "SELECT a1 # projection\nWHERE a1 == \"x\" # and a filter",
        vec![vec![s("x")], vec![s("y")]],
    );
    assert_eq!(rows, vec![vec![s("x")]]);
}

#[test]
fn test_error_kinds() {
    let input = || vec![vec![s("x")]];
    let err = query_table("SELECT a1 WHERE", input(), None, &QueryOptions::new()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::QueryParsing);

    let err = query_table("SELECT zzz", input(), None, &QueryOptions::new()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::QuerySyntax);

    let err = query_table(
        "SELECT a1 JOIN unknown_table ON a1 == b1",
        input(),
        None,
        &QueryOptions::new(),
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::QuerySyntax);

    let err =
        query_table("SELECT 1 // int(a1)", vec![vec![i(0)]], None, &QueryOptions::new())
            .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(err.message.starts_with("At record 1"));
}

// FROM + custom registry

struct MapRegistry {
    tables: std::collections::HashMap<String, Vec<Record>>,
    join_has_header: bool,
}

impl TableRegistry for MapRegistry {
    fn get_iterator_by_table_id(
        &mut self,
        table_id: &str,
        single_char_alias: char,
    ) -> rbql::Result<Box<dyn InputIterator>> {
        let table = self.tables.remove(table_id).ok_or_else(|| {
            rbql::Error::io(format!("Unable to find table \"{table_id}\""))
        })?;
        let mut iterator = TableIterator::new(table).with_prefix(single_char_alias);
        if single_char_alias == 'b' && self.join_has_header {
            iterator = iterator.with_header_row();
        }
        Ok(Box::new(iterator))
    }
}

#[test]
fn test_from_clause_resolves_input_through_registry() {
    let mut registry = MapRegistry {
        tables: [("people".to_string(), people())].into_iter().collect(),
        join_has_header: false,
    };
    let mut writer = TableWriter::new();
    let warnings = query(
        "SELECT a1 FROM people WHERE a3 == \"USA\"",
        None,
        &mut writer,
        Some(&mut registry),
        &QueryOptions::new(),
    )
    .unwrap();
    assert!(warnings.is_empty());
    assert_eq!(writer.table, vec![vec![s("Roosevelt")]]);
}

#[test]
fn test_join_table_header_row_is_consumed_with_warning() {
    let join_rows = vec![
        vec![s("country"), s("population")],
        vec![s("USA"), i(327)],
    ];
    let mut registry = MapRegistry {
        tables: [("pop".to_string(), join_rows)].into_iter().collect(),
        join_has_header: true,
    };
    let mut input = TableIterator::new(people());
    let mut writer = TableWriter::new();
    let warnings = query(
        "SELECT a1, b.population JOIN pop ON a3 == b1",
        Some(&mut input),
        &mut writer,
        Some(&mut registry),
        &QueryOptions::new(),
    )
    .unwrap();
    assert_eq!(writer.table, vec![vec![s("Roosevelt"), i(327)]]);
    assert!(warnings.iter().any(|w| w.contains("treated as a header")));
}
