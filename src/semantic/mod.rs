//! Query compilation: split statements + variable maps → executable plan.
//!
//! Expression snippets are parsed into [Expr] trees and resolved against
//! the variable maps of both record sources; SELECT items are classified
//! (plain, star splice, aggregate, UNNEST, EXCEPT projection); the
//! output header is derived alongside.

pub mod variables;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::ast::{AggFunc, Expr, Table};
use crate::engine::functions::FunctionRegistry;
use crate::error::Error;
use crate::parser::expr::parse_expression;
use crate::parser::stmt::{DistinctMode, JoinKind, Statements};
use variables::VariableMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    Update,
}

#[derive(Debug)]
pub enum SelectItem {
    Expr(Expr),
    /// `*`, `a.*` or `b.*` — a splice point expanded at row time.
    Star(Option<Table>),
    Aggregate { func: AggFunc, arg: Expr },
    Unnest(Expr),
}

#[derive(Debug)]
pub enum SelectPlan {
    Items(Vec<SelectItem>),
    /// `SELECT * EXCEPT ...`: all input fields but these indices.
    Except(Vec<usize>),
}

#[derive(Debug)]
pub struct JoinPlan {
    pub kind: JoinKind,
    pub lhs_keys: Vec<Expr>,
    pub rhs_keys: Vec<Expr>,
}

#[derive(Debug)]
pub struct OrderBy {
    pub key: Expr,
    pub reverse: bool,
}

#[derive(Debug)]
pub struct CompiledQuery {
    pub kind: QueryKind,
    pub select: SelectPlan,
    pub update_sets: Vec<(usize, Expr)>,
    pub where_expr: Option<Expr>,
    pub top_count: Option<u64>,
    pub distinct: DistinctMode,
    pub join: Option<JoinPlan>,
    pub group_by: Vec<Expr>,
    pub aggregated: bool,
    pub order_by: Option<OrderBy>,
    pub output_header: Option<Vec<String>>,
}

pub(crate) struct CompileContext<'a> {
    pub a_map: &'a VariableMap,
    pub b_map: Option<&'a VariableMap>,
    pub a_header: Option<&'a [String]>,
    pub b_header: Option<&'a [String]>,
    pub functions: &'a FunctionRegistry,
}

struct ResolveContext<'a> {
    a_map: &'a VariableMap,
    b_map: Option<&'a VariableMap>,
    functions: &'a FunctionRegistry,
}

static AS_ALIAS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.+) as ([_a-zA-Z][_a-zA-Z0-9]*)$").expect("valid regex"));
static COUNT_STAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bCOUNT ?\( ?\* ?\)").expect("valid regex"));
static AGGREGATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(COUNT_DISTINCT|COUNT|MIN|MAX|SUM|AVG|MEDIAN|VARIANCE|ARRAY_AGG|FOLD) ?\((.*)\)$",
    )
    .expect("valid regex")
});
static COUNT_DISTINCT_ARG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^distinct (.+)$").expect("valid regex"));
static UNNEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:unnest|unfold) ?\((.*)\)$").expect("valid regex"));
static JOIN_ON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^([^ ]+) on (.+)$").expect("valid regex"));

fn table_label(table: Table) -> &'static str {
    match table {
        Table::A => "input",
        Table::B => "join",
    }
}

fn table_ident(name: &str) -> Option<Table> {
    match name {
        "a" => Some(Table::A),
        "b" => Some(Table::B),
        _ => None,
    }
}

/// Split on `sep` outside parentheses and brackets.
fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            _ => {}
        }
        if c == sep && depth == 0 {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

/// Split on a case-insensitive word pattern (e.g. `" and "`) outside
/// parentheses and brackets.
fn split_top_level_word(text: &str, word: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let word_chars: Vec<char> = word.chars().collect();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            _ => {}
        }
        let is_split = depth == 0
            && i + word_chars.len() <= chars.len()
            && chars[i..i + word_chars.len()]
                .iter()
                .zip(&word_chars)
                .all(|(a, b)| a.eq_ignore_ascii_case(b));
        if is_split {
            parts.push(std::mem::take(&mut current));
            i += word_chars.len();
        } else {
            current.push(c);
            i += 1;
        }
    }
    parts.push(current);
    parts
}

/// True when the first `(` of `inner` is balanced against its final `)`,
/// i.e. `inner` really is a single call argument list.
fn is_balanced(inner: &str) -> bool {
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn resolve_ident(name: String, ctx: &ResolveContext) -> Result<Expr> {
    match name.as_str() {
        "NR" => return Ok(Expr::Nr),
        "NF" => return Ok(Expr::Nf),
        _ => {}
    }
    let a_hit = ctx.a_map.get(&name).and_then(|info| info.index);
    let b_hit = ctx
        .b_map
        .and_then(|map| map.get(&name))
        .and_then(|info| info.index);
    match (a_hit, b_hit) {
        (Some(_), Some(_)) => {
            Err(Error::syntax(format!("Ambiguous column name \"{name}\"")).into())
        }
        (Some(index), None) => Ok(Expr::Column {
            table: Table::A,
            index,
        }),
        (None, Some(index)) => Ok(Expr::Column {
            table: Table::B,
            index,
        }),
        (None, None) => {
            if ctx.b_map.is_none() && name.starts_with('b') && name[1..].parse::<usize>().is_ok()
            {
                return Err(Error::syntax(format!(
                    "Unable to use variable \"{name}\" without a JOIN table"
                ))
                .into());
            }
            Err(Error::syntax(format!("Unknown variable or function \"{name}\"")).into())
        }
    }
}

fn resolve_attr(recv: Expr, name: String, ctx: &ResolveContext) -> Result<Expr> {
    if let Expr::Ident(table_name) = &recv {
        if let Some(table) = table_ident(table_name) {
            let map = match table {
                Table::A => Some(ctx.a_map),
                Table::B => ctx.b_map,
            };
            let key = format!("{}.{name}", table.prefix());
            let info = map.and_then(|m| m.get(&key)).and_then(|info| info.index);
            return match info {
                Some(index) => Ok(Expr::Column { table, index }),
                None => Err(Error::syntax(format!(
                    "Unable to find column \"{name}\" in the {} table",
                    table_label(table)
                ))
                .into()),
            };
        }
    }
    Err(Error::syntax(format!("Unknown attribute \"{name}\"")).into())
}

fn resolve_subscript(table: Table, index: Expr, ctx: &ResolveContext) -> Result<Expr> {
    let map = match table {
        Table::A => Some(ctx.a_map),
        Table::B => ctx.b_map,
    };
    let prefix = table.prefix();
    let keys = match &index {
        Expr::Literal(crate::value::Value::Int(n)) => vec![format!("{prefix}[{n}]")],
        Expr::Literal(crate::value::Value::Str(s)) => {
            vec![format!("{prefix}[\"{s}\"]"), format!("{prefix}['{s}']")]
        }
        _ => {
            return Err(
                Error::parsing("Column subscript must be an integer or a string literal").into(),
            )
        }
    };
    for key in &keys {
        if let Some(index) = map.and_then(|m| m.get(key)).and_then(|info| info.index) {
            return Ok(Expr::Column { table, index });
        }
    }
    Err(Error::syntax(format!(
        "Unable to find column {} in the {} table",
        keys[0],
        table_label(table)
    ))
    .into())
}

fn resolve_apply(callee: Expr, args: Vec<Expr>, ctx: &ResolveContext) -> Result<Expr> {
    match callee {
        Expr::Ident(name) => {
            if AggFunc::try_from(name.as_str()).is_ok() {
                return Err(Error::syntax(format!(
                    "Unable to use aggregate function \"{name}\" inside an expression"
                ))
                .into());
            }
            if name.eq_ignore_ascii_case("unnest") || name.eq_ignore_ascii_case("unfold") {
                return Err(Error::syntax(
                    "UNNEST must be a whole top-level select item",
                )
                .into());
            }
            if name == "safe_get" {
                let [table_arg, index_arg]: [Expr; 2] = args.try_into().map_err(|_| {
                    Error::parsing("safe_get() expects a table (a or b) and a 1-based index")
                })?;
                let Expr::Ident(table_name) = &table_arg else {
                    return Err(Error::parsing(
                        "safe_get() expects a table (a or b) and a 1-based index",
                    )
                    .into());
                };
                let Some(table) = table_ident(table_name) else {
                    return Err(Error::parsing(
                        "safe_get() expects a table (a or b) and a 1-based index",
                    )
                    .into());
                };
                let index = resolve_expr(index_arg, ctx)?;
                return Ok(Expr::SafeGet {
                    table,
                    index: Box::new(index),
                });
            }
            if !ctx.functions.is_known(&name) {
                return Err(Error::syntax(format!("Unknown function \"{name}\"")).into());
            }
            let args: Result<Vec<Expr>> =
                args.into_iter().map(|arg| resolve_expr(arg, ctx)).collect();
            Ok(Expr::Call { name, args: args? })
        }
        Expr::Attr { recv, name } => {
            if let Expr::Ident(table_name) = recv.as_ref() {
                if table_ident(table_name).is_some() {
                    // `a.name(...)` — a column is not callable.
                    return Err(Error::syntax(format!(
                        "Column \"{table_name}.{name}\" is not callable"
                    ))
                    .into());
                }
            }
            let recv = resolve_expr(*recv, ctx)?;
            let args: Result<Vec<Expr>> =
                args.into_iter().map(|arg| resolve_expr(arg, ctx)).collect();
            Ok(Expr::Method {
                recv: Box::new(recv),
                name,
                args: args?,
            })
        }
        _ => Err(Error::parsing("Expression is not callable").into()),
    }
}

/// Rewrite name-based nodes into typed access paths.
fn resolve_expr(expr: Expr, ctx: &ResolveContext) -> Result<Expr> {
    Ok(match expr {
        Expr::Literal(_)
        | Expr::Column { .. }
        | Expr::Nr
        | Expr::Nf
        | Expr::Call { .. }
        | Expr::Method { .. }
        | Expr::SafeGet { .. } => expr,
        Expr::Star => {
            return Err(
                Error::parsing("\"*\" is only allowed inside COUNT(*) or as a select item").into(),
            )
        }
        Expr::Ident(name) => resolve_ident(name, ctx)?,
        Expr::Attr { recv, name } => resolve_attr(*recv, name, ctx)?,
        Expr::Index { recv, index } => {
            if let Expr::Ident(table_name) = recv.as_ref() {
                if let Some(table) = table_ident(table_name) {
                    return resolve_subscript(table, *index, ctx);
                }
            }
            Expr::Index {
                recv: Box::new(resolve_expr(*recv, ctx)?),
                index: Box::new(resolve_expr(*index, ctx)?),
            }
        }
        Expr::Apply { callee, args } => resolve_apply(*callee, args, ctx)?,
        Expr::Unary { op, expr } => Expr::Unary {
            op,
            expr: Box::new(resolve_expr(*expr, ctx)?),
        },
        Expr::Binary { left, op, right } => Expr::Binary {
            left: Box::new(resolve_expr(*left, ctx)?),
            op,
            right: Box::new(resolve_expr(*right, ctx)?),
        },
        Expr::Like {
            expr,
            pattern,
            regex,
            negated,
        } => Expr::Like {
            expr: Box::new(resolve_expr(*expr, ctx)?),
            pattern,
            regex,
            negated,
        },
    })
}

fn parse_and_resolve(snippet: &str, literals: &[String], ctx: &ResolveContext) -> Result<Expr> {
    resolve_expr(parse_expression(snippet, literals)?, ctx)
}

/// Extract the table identifier and the ON condition from a join clause.
pub(crate) fn parse_join_table_id(join_text: &str) -> Result<(String, String)> {
    let caps = JOIN_ON_RE.captures(join_text).ok_or_else(|| {
        Error::syntax(format!(
            "Invalid JOIN syntax: \"{join_text}\". Expected: \"<table> ON a... == b...\""
        ))
    })?;
    Ok((caps[1].to_string(), caps[2].to_string()))
}

fn parse_join(
    kind: JoinKind,
    join_text: &str,
    literals: &[String],
    ctx: &ResolveContext,
) -> Result<JoinPlan> {
    let (_, condition) = parse_join_table_id(join_text)?;
    let mut lhs_keys = Vec::new();
    let mut rhs_keys = Vec::new();
    for equality in split_top_level_word(&condition, " and ") {
        let sides = split_top_level_word(&equality, "==");
        let [left, right]: [String; 2] = sides.try_into().map_err(|_| {
            Error::syntax(format!(
                "Invalid JOIN condition \"{}\": expected \"a... == b...\"",
                equality.trim()
            ))
        })?;
        let left = parse_and_resolve(left.trim(), literals, ctx)?;
        let right = parse_and_resolve(right.trim(), literals, ctx)?;
        let classify = |expr: &Expr| match expr {
            Expr::Column { table, .. } => Some(*table),
            _ => None,
        };
        match (classify(&left), classify(&right)) {
            (Some(Table::A), Some(Table::B)) => {
                lhs_keys.push(left);
                rhs_keys.push(right);
            }
            (Some(Table::B), Some(Table::A)) => {
                lhs_keys.push(right);
                rhs_keys.push(left);
            }
            (Some(l), Some(r)) if l == r => {
                return Err(Error::syntax(
                    "Invalid JOIN condition: keys must reference both the input and the join table",
                )
                .into())
            }
            _ => {
                return Err(Error::syntax(
                    "Invalid JOIN condition: each side must be a single column variable",
                )
                .into())
            }
        }
    }
    Ok(JoinPlan {
        kind,
        lhs_keys,
        rhs_keys,
    })
}

fn compile_select_items(
    select_text: &str,
    literals: &[String],
    ctx: &ResolveContext,
) -> Result<(Vec<SelectItem>, Vec<Option<String>>)> {
    let mut items = Vec::new();
    let mut aliases = Vec::new();
    for raw_item in split_top_level(select_text, ',') {
        let mut item_text = raw_item.trim().to_string();
        if item_text.is_empty() {
            return Err(Error::parsing("Empty select item").into());
        }

        match item_text.as_str() {
            "*" => {
                items.push(SelectItem::Star(None));
                aliases.push(None);
                continue;
            }
            "a.*" => {
                items.push(SelectItem::Star(Some(Table::A)));
                aliases.push(None);
                continue;
            }
            "b.*" => {
                if ctx.b_map.is_none() {
                    return Err(Error::syntax("Unable to use \"b.*\" without a JOIN table").into());
                }
                items.push(SelectItem::Star(Some(Table::B)));
                aliases.push(None);
                continue;
            }
            _ => {}
        }

        let mut alias = None;
        let alias_parts = AS_ALIAS_RE
            .captures(&item_text)
            .map(|caps| (caps[1].trim().to_string(), caps[2].to_string()));
        if let Some((expr_part, alias_part)) = alias_parts {
            item_text = expr_part;
            alias = Some(alias_part);
        }

        let item_text = COUNT_STAR_RE.replace_all(&item_text, "COUNT(1)").into_owned();

        if let Some(caps) = UNNEST_RE.captures(&item_text) {
            let inner = caps[1].to_string();
            if is_balanced(&inner) {
                let arg = parse_and_resolve(&inner, literals, ctx)?;
                items.push(SelectItem::Unnest(arg));
                aliases.push(alias);
                continue;
            }
        }

        if let Some(caps) = AGGREGATE_RE.captures(&item_text) {
            let inner = caps[2].to_string();
            if is_balanced(&inner) {
                let mut func: AggFunc = caps[1]
                    .parse()
                    .map_err(|_| Error::parsing("Unknown aggregate function"))?;
                let mut inner = inner;
                if func == AggFunc::Count {
                    if let Some(distinct_caps) = COUNT_DISTINCT_ARG_RE.captures(&inner) {
                        func = AggFunc::CountDistinct;
                        inner = distinct_caps[1].to_string();
                    }
                }
                let arg = parse_and_resolve(&inner, literals, ctx)?;
                items.push(SelectItem::Aggregate { func, arg });
                aliases.push(alias);
                continue;
            }
        }

        let expr = parse_and_resolve(&item_text, literals, ctx)?;
        items.push(SelectItem::Expr(expr));
        aliases.push(alias);
    }
    Ok((items, aliases))
}

fn compile_except(
    except_text: &str,
    literals: &[String],
    ctx: &ResolveContext,
) -> Result<Vec<usize>> {
    let mut indices = Vec::new();
    for part in split_top_level(except_text, ',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(Error::parsing("Invalid EXCEPT list").into());
        }
        let expr = parse_and_resolve(part, literals, ctx)?;
        match expr {
            Expr::Column {
                table: Table::A,
                index,
            } => {
                if !indices.contains(&index) {
                    indices.push(index);
                }
            }
            Expr::Column { table: Table::B, .. } => {
                return Err(
                    Error::syntax("EXCEPT currently only supports input table fields").into(),
                )
            }
            _ => {
                return Err(Error::parsing(format!(
                    "Invalid EXCEPT entry \"{part}\": expected an input column reference"
                ))
                .into())
            }
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

fn find_assignment_operator(item: &str) -> Option<usize> {
    let bytes = item.as_bytes();
    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            b'=' if depth == 0 => {
                let next_is_eq = bytes.get(i + 1) == Some(&b'=');
                let prev_is_op = i > 0 && matches!(bytes[i - 1], b'=' | b'!' | b'<' | b'>');
                if !next_is_eq && !prev_is_op {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn compile_update(
    update_text: &str,
    literals: &[String],
    ctx: &ResolveContext,
) -> Result<Vec<(usize, Expr)>> {
    let mut sets = Vec::new();
    for item in split_top_level(update_text, ',') {
        let item = item.trim();
        let eq_pos = find_assignment_operator(item).ok_or_else(|| {
            Error::parsing(format!("Unable to parse \"UPDATE\" expression \"{item}\""))
        })?;
        let target_text = item[..eq_pos].trim();
        let rhs_text = item[eq_pos + 1..].trim();
        let target = parse_and_resolve(target_text, literals, ctx)?;
        let index = match target {
            Expr::Column {
                table: Table::A,
                index,
            } => index,
            Expr::Column { table: Table::B, .. } => {
                return Err(
                    Error::syntax("Unable to use JOIN table fields as UPDATE targets").into(),
                )
            }
            _ => {
                return Err(Error::parsing(format!(
                    "UPDATE target \"{target_text}\" must be an input column reference"
                ))
                .into())
            }
        };
        let value = parse_and_resolve(rhs_text, literals, ctx)?;
        sets.push((index, value));
    }
    if sets.is_empty() {
        return Err(Error::parsing("UPDATE query must have at least one assignment").into());
    }
    Ok(sets)
}

fn compute_output_header(
    plan: &SelectPlan,
    aliases: &[Option<String>],
    ctx: &CompileContext,
    join_present: bool,
    distinct: DistinctMode,
) -> Option<Vec<String>> {
    if ctx.a_header.is_none() && ctx.b_header.is_none() {
        return None;
    }
    let mut header = Vec::new();
    match plan {
        SelectPlan::Except(indices) => {
            let a_header = ctx.a_header?;
            for (i, name) in a_header.iter().enumerate() {
                if !indices.contains(&i) {
                    header.push(name.clone());
                }
            }
        }
        SelectPlan::Items(items) => {
            for (item, alias) in items.iter().zip(aliases) {
                let fallback = |header: &[String]| format!("col{}", header.len() + 1);
                match item {
                    SelectItem::Star(None) => {
                        header.extend(ctx.a_header?.iter().cloned());
                        if join_present {
                            header.extend(ctx.b_header?.iter().cloned());
                        }
                    }
                    SelectItem::Star(Some(Table::A)) => header.extend(ctx.a_header?.iter().cloned()),
                    SelectItem::Star(Some(Table::B)) => header.extend(ctx.b_header?.iter().cloned()),
                    SelectItem::Expr(Expr::Column { table, index }) => {
                        let source = match table {
                            Table::A => ctx.a_header,
                            Table::B => ctx.b_header,
                        };
                        let name = alias.clone().or_else(|| {
                            source.and_then(|h| h.get(*index).cloned())
                        });
                        let name = name.unwrap_or_else(|| fallback(&header));
                        header.push(name);
                    }
                    _ => {
                        let name = alias.clone().unwrap_or_else(|| fallback(&header));
                        header.push(name);
                    }
                }
            }
        }
    }
    if distinct == DistinctMode::DistinctCount {
        header.insert(0, "count".to_string());
    }
    Some(header)
}

pub(crate) fn compile(
    statements: &Statements,
    literals: &[String],
    ctx: &CompileContext,
) -> Result<CompiledQuery> {
    let rctx = ResolveContext {
        a_map: ctx.a_map,
        b_map: ctx.b_map,
        functions: ctx.functions,
    };

    let where_expr = statements
        .where_clause
        .as_deref()
        .map(|text| parse_and_resolve(text, literals, &rctx))
        .transpose()?;

    let join = statements
        .join
        .as_ref()
        .map(|(kind, text)| parse_join(*kind, text, literals, &rctx))
        .transpose()?;

    let group_by: Vec<Expr> = match statements.group_by.as_deref() {
        Some(text) => split_top_level(text, ',')
            .iter()
            .map(|part| parse_and_resolve(part.trim(), literals, &rctx))
            .collect::<Result<_>>()?,
        None => Vec::new(),
    };

    let order_by = statements
        .order_by
        .as_deref()
        .map(|text| {
            parse_and_resolve(text, literals, &rctx).map(|key| OrderBy {
                key,
                reverse: statements.reverse_order,
            })
        })
        .transpose()?;

    let (kind, select, aliases, update_sets) = if let Some(update_text) = &statements.update {
        for (clause, present) in [
            ("ORDER BY", statements.order_by.is_some()),
            ("GROUP BY", statements.group_by.is_some()),
            ("EXCEPT", statements.except.is_some()),
            ("DISTINCT", statements.distinct != DistinctMode::None),
        ] {
            if present {
                return Err(Error::parsing(format!(
                    "Unable to use \"{clause}\" in UPDATE queries"
                ))
                .into());
            }
        }
        let sets = compile_update(update_text, literals, &rctx)?;
        (
            QueryKind::Update,
            SelectPlan::Items(Vec::new()),
            Vec::new(),
            sets,
        )
    } else {
        let select_text = statements.select.as_deref().unwrap_or_default();
        if let Some(except_text) = &statements.except {
            if select_text.trim() != "*" {
                return Err(
                    Error::parsing("EXCEPT is only allowed after \"SELECT *\"").into()
                );
            }
            let indices = compile_except(except_text, literals, &rctx)?;
            (QueryKind::Select, SelectPlan::Except(indices), Vec::new(), Vec::new())
        } else {
            if select_text.trim().is_empty() {
                return Err(Error::parsing("\"SELECT\" expression is empty").into());
            }
            let (items, aliases) = compile_select_items(select_text, literals, &rctx)?;
            (QueryKind::Select, SelectPlan::Items(items), aliases, Vec::new())
        }
    };

    let (has_aggregate_items, has_star, unnest_count) = match &select {
        SelectPlan::Items(items) => (
            items
                .iter()
                .any(|item| matches!(item, SelectItem::Aggregate { .. })),
            items.iter().any(|item| matches!(item, SelectItem::Star(_))),
            items
                .iter()
                .filter(|item| matches!(item, SelectItem::Unnest(_)))
                .count(),
        ),
        SelectPlan::Except(_) => (false, false, 0),
    };
    let aggregated = has_aggregate_items || !group_by.is_empty();

    // Implicit grouping: without an explicit GROUP BY, the non-aggregate
    // select items form the group key. An all-aggregate projection keeps
    // the key empty and yields a single global group.
    let mut group_by = group_by;
    if has_aggregate_items && group_by.is_empty() {
        if let SelectPlan::Items(items) = &select {
            group_by = items
                .iter()
                .filter_map(|item| match item {
                    SelectItem::Expr(expr) => Some(expr.clone()),
                    _ => None,
                })
                .collect();
        }
    }

    if unnest_count > 1 {
        return Err(Error::parsing("Only one UNNEST is allowed per query").into());
    }
    if aggregated {
        if matches!(select, SelectPlan::Except(_)) {
            return Err(Error::parsing("Unable to use GROUP BY with EXCEPT").into());
        }
        if statements.distinct != DistinctMode::None || order_by.is_some() {
            return Err(Error::parsing(
                "Unable to use \"ORDER BY\" or \"DISTINCT\" keywords in aggregate query",
            )
            .into());
        }
        if unnest_count > 0 {
            return Err(Error::parsing("Unable to use UNNEST in aggregate query").into());
        }
        if has_star {
            return Err(
                Error::parsing("Unable to use \"*\" select item in aggregate query").into(),
            );
        }
    }

    let output_header = match kind {
        QueryKind::Update => ctx.a_header.map(|h| h.to_vec()),
        QueryKind::Select => compute_output_header(
            &select,
            &aliases,
            ctx,
            join.is_some(),
            statements.distinct,
        ),
    };

    Ok(CompiledQuery {
        kind,
        select,
        update_sets,
        where_expr,
        top_count: statements.top_count,
        distinct: statements.distinct,
        join,
        group_by,
        aggregated,
        order_by,
        output_header,
    })
}

/// Parse + resolve a standalone expression snippet; positional `a`
/// variables resolve against the snippet itself.
#[cfg(test)]
pub(crate) fn compile_test_expression(snippet: &str) -> Expr {
    let a_map = variables::build_variable_map(snippet, 'a', None, true).unwrap();
    let functions = FunctionRegistry::new();
    let rctx = ResolveContext {
        a_map: &a_map,
        b_map: None,
        functions: &functions,
    };
    let (format_expression, literals) =
        crate::parser::preprocess::separate_string_literals(snippet).unwrap();
    parse_and_resolve(&format_expression, &literals, &rctx).unwrap()
}
