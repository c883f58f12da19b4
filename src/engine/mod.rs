//! The streaming back-end: external iterator/writer contracts and the
//! single-pass executor.
//!
//! The executor owns the writer stack and the join index for one query:
//! pull record → join expand → WHERE → projection / in-place update →
//! writer stack → finalize.

pub mod aggregate;
pub mod eval;
pub mod functions;
pub mod join;
pub mod writers;

use anyhow::Result;

use crate::error::{BadFieldError, Error, ErrorKind};
use crate::semantic::variables::VariableMap;
use crate::semantic::{CompiledQuery, QueryKind, SelectItem, SelectPlan};
use crate::value::{Record, Value};
use eval::{eval, EvalContext};
use functions::FunctionRegistry;
use join::Joiner;
use writers::Writer;

/// Record source contract. `get_record` returning `None` signals end of
/// stream.
pub trait InputIterator {
    /// May inspect the query text to register only referenced columns.
    fn get_variables_map(&mut self, query_text: &str) -> Result<VariableMap>;
    fn get_header(&self) -> Option<Vec<String>>;
    fn get_record(&mut self) -> Result<Option<Record>>;
    fn get_warnings(&self) -> Vec<String> {
        Vec::new()
    }
    /// Idempotent.
    fn finish(&mut self) {}
}

/// Record sink contract. `write` returning false asks the executor to
/// stop pushing.
pub trait OutputWriter {
    fn write(&mut self, record: Record) -> Result<bool>;
    fn set_header(&mut self, _header: Option<&[String]>) {}
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
    fn get_warnings(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Maps FROM/JOIN table identifiers to input iterators.
pub trait TableRegistry {
    fn get_iterator_by_table_id(
        &mut self,
        table_id: &str,
        single_char_alias: char,
    ) -> Result<Box<dyn InputIterator>>;
}

fn write_row(writer: &mut Writer, sort_key: Option<Value>, record: Record) -> Result<bool> {
    match sort_key {
        Some(key) => writer.write_sorted(key, record),
        None => writer.write(record),
    }
}

fn process_select(
    plan: &CompiledQuery,
    record_a: &Record,
    matches: Vec<Option<&Record>>,
    nr: i64,
    nf: usize,
    writer: &mut Writer,
    functions: &FunctionRegistry,
) -> Result<bool> {
    for record_b in matches {
        let ctx = EvalContext {
            record_a,
            record_b: record_b.map(|r| r.as_slice()),
            nr,
            nf,
            functions,
        };
        if let Some(where_expr) = &plan.where_expr {
            if !eval(where_expr, &ctx)?.is_truthy() {
                continue;
            }
        }

        if plan.aggregated {
            let key: Result<Vec<Value>> =
                plan.group_by.iter().map(|expr| eval(expr, &ctx)).collect();
            let SelectPlan::Items(items) = &plan.select else {
                anyhow::bail!("Internal error: aggregate query without select items");
            };
            let values: Result<Vec<Value>> = items
                .iter()
                .map(|item| match item {
                    SelectItem::Aggregate { arg, .. } => eval(arg, &ctx),
                    SelectItem::Expr(expr) => eval(expr, &ctx),
                    _ => anyhow::bail!("Internal error: star or UNNEST in aggregate query"),
                })
                .collect();
            if !writer.write_grouped(key?, values?)? {
                return Ok(false);
            }
            continue;
        }

        let mut out_fields: Record = Vec::new();
        let mut unnest: Option<(usize, Vec<Value>)> = None;
        match &plan.select {
            SelectPlan::Except(skip_indices) => {
                for (i, value) in record_a.iter().enumerate() {
                    if !skip_indices.contains(&i) {
                        out_fields.push(value.clone());
                    }
                }
            }
            SelectPlan::Items(items) => {
                for item in items {
                    match item {
                        SelectItem::Star(None) => {
                            out_fields.extend(record_a.iter().cloned());
                            if let Some(rb) = record_b {
                                out_fields.extend(rb.iter().cloned());
                            }
                        }
                        SelectItem::Star(Some(crate::ast::Table::A)) => {
                            out_fields.extend(record_a.iter().cloned());
                        }
                        SelectItem::Star(Some(crate::ast::Table::B)) => {
                            if let Some(rb) = record_b {
                                out_fields.extend(rb.iter().cloned());
                            }
                        }
                        SelectItem::Expr(expr) => out_fields.push(eval(expr, &ctx)?),
                        SelectItem::Unnest(expr) => {
                            let Value::List(values) = eval(expr, &ctx)? else {
                                anyhow::bail!("UNNEST argument must be a list");
                            };
                            unnest = Some((out_fields.len(), values));
                            out_fields.push(Value::Null);
                        }
                        SelectItem::Aggregate { .. } => {
                            anyhow::bail!("Internal error: aggregate item in plain query")
                        }
                    }
                }
            }
        }

        let sort_key = plan
            .order_by
            .as_ref()
            .map(|order_by| eval(&order_by.key, &ctx))
            .transpose()?;

        match unnest {
            Some((position, values)) => {
                for value in values {
                    let mut row = out_fields.clone();
                    row[position] = value;
                    if !write_row(writer, sort_key.clone(), row)? {
                        return Ok(false);
                    }
                }
            }
            None => {
                if !write_row(writer, sort_key, out_fields)? {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

fn process_update(
    plan: &CompiledQuery,
    record_a: &Record,
    matches: Vec<Option<&Record>>,
    nr: i64,
    nf: usize,
    writer: &mut Writer,
    functions: &FunctionRegistry,
) -> Result<bool> {
    if matches.len() > 1 {
        anyhow::bail!(
            "More than one record in UPDATE query matched a key from the input table in the join table"
        );
    }
    let record_b = matches.first().and_then(|m| *m);
    let mut up_fields = record_a.clone();
    if !matches.is_empty() {
        let ctx = EvalContext {
            record_a,
            record_b: record_b.map(|r| r.as_slice()),
            nr,
            nf,
            functions,
        };
        let passes = match &plan.where_expr {
            Some(where_expr) => eval(where_expr, &ctx)?.is_truthy(),
            None => true,
        };
        if passes {
            for (index, expr) in &plan.update_sets {
                let value = eval(expr, &ctx)?;
                match up_fields.get_mut(*index) {
                    Some(field) => *field = value,
                    None => {
                        return Err(BadFieldError {
                            prefix: 'a',
                            index: *index,
                        }
                        .into())
                    }
                }
            }
        }
    }
    writer.write(up_fields)
}

fn annotate_record_error(error: anyhow::Error, nr: i64) -> anyhow::Error {
    if let Some(bad_field) = error.downcast_ref::<BadFieldError>() {
        return Error::runtime(format!(
            "No \"{}{}\" field at record {}",
            bad_field.prefix,
            bad_field.index + 1,
            nr
        ))
        .into();
    }
    match error.downcast::<Error>() {
        // Adapter-level errors (e.g. a defective join table) already
        // carry their own context.
        Ok(structured) if structured.kind == ErrorKind::IoHandling => structured.into(),
        Ok(structured) => Error::new(
            structured.kind,
            format!("At record {}: {}", nr, structured.message),
        )
        .into(),
        Err(other) => Error::runtime(format!("At record {nr}: {other:#}")).into(),
    }
}

/// The streaming main loop.
pub(crate) fn execute(
    plan: &CompiledQuery,
    input: &mut dyn InputIterator,
    joiner: &mut Joiner,
    output: &mut dyn OutputWriter,
    functions: &FunctionRegistry,
) -> Result<()> {
    output.set_header(plan.output_header.as_deref());
    let mut writer = writers::compose(plan, output);
    let mut nr: i64 = 0;
    let mut stop = false;
    while !stop {
        let Some(record_a) = input.get_record()? else {
            break;
        };
        nr += 1;
        let nf = record_a.len();
        let proceed = (|| -> Result<bool> {
            let lhs_key: Vec<Value> = match &plan.join {
                Some(join) => {
                    let ctx = EvalContext {
                        record_a: &record_a,
                        record_b: None,
                        nr,
                        nf,
                        functions,
                    };
                    join.lhs_keys
                        .iter()
                        .map(|expr| eval(expr, &ctx))
                        .collect::<Result<_>>()?
                }
                None => Vec::new(),
            };
            let matches = joiner.get_rhs(&lhs_key, functions)?;
            match plan.kind {
                QueryKind::Select => {
                    process_select(plan, &record_a, matches, nr, nf, &mut writer, functions)
                }
                QueryKind::Update => {
                    process_update(plan, &record_a, matches, nr, nf, &mut writer, functions)
                }
            }
        })();
        match proceed {
            Ok(keep_going) => stop = !keep_going,
            Err(error) => return Err(annotate_record_error(error, nr)),
        }
    }
    log::debug!("main loop finished after {nr} input records");
    writer.finish()?;
    Ok(())
}
