//! Hash join support: a lazily built index over the join table and the
//! lookup strategies layered on top of it.

use std::collections::HashMap;

use anyhow::Result;
use itertools::Itertools;

use crate::ast::Expr;
use crate::engine::eval::{eval, EvalContext};
use crate::engine::functions::FunctionRegistry;
use crate::engine::InputIterator;
use crate::error::{BadFieldError, Error};
use crate::parser::stmt::JoinKind;
use crate::value::{Record, Value};

/// Index from join-key tuples to join-table records in discovery order.
/// Built on the first lookup, in a single pass over the join source.
pub struct JoinIndex {
    source: Box<dyn InputIterator>,
    rhs_keys: Vec<Expr>,
    map: HashMap<Vec<Value>, Vec<Record>>,
    null_record: Record,
    built: bool,
}

impl JoinIndex {
    pub fn new(source: Box<dyn InputIterator>, rhs_keys: Vec<Expr>) -> Self {
        JoinIndex {
            source,
            rhs_keys,
            map: HashMap::new(),
            null_record: Vec::new(),
            built: false,
        }
    }

    fn ensure_built(&mut self, functions: &FunctionRegistry) -> Result<()> {
        if self.built {
            return Ok(());
        }
        self.built = true;
        let mut nr: i64 = 0;
        let mut max_record_len = 0;
        while let Some(record) = self.source.get_record()? {
            nr += 1;
            max_record_len = max_record_len.max(record.len());
            let ctx = EvalContext {
                record_a: &[],
                record_b: Some(record.as_slice()),
                nr,
                nf: record.len(),
                functions,
            };
            let key: Result<Vec<Value>> =
                self.rhs_keys.iter().map(|expr| eval(expr, &ctx)).collect();
            let key = key.map_err(|e| match e.downcast_ref::<BadFieldError>() {
                Some(bad) => Error::io(format!(
                    "No \"b{}\" field at record {} in the JOIN table",
                    bad.index + 1,
                    nr
                ))
                .into(),
                None => e,
            })?;
            self.map.entry(key).or_default().push(record);
        }
        self.null_record = vec![Value::Null; max_record_len];
        log::debug!("join index built: {} distinct keys, {} records", self.map.len(), nr);
        Ok(())
    }

    fn lookup(&self, key: &[Value]) -> &[Record] {
        self.map.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Join strategy selected from the query plan. `None` yields a single
/// empty match so the main loop always runs once per input record.
pub enum Joiner {
    None,
    Inner(JoinIndex),
    Left(JoinIndex),
    StrictLeft(JoinIndex),
    Anti(JoinIndex),
}

impl Joiner {
    pub fn new(kind: JoinKind, index: JoinIndex) -> Self {
        match kind {
            JoinKind::Inner => Joiner::Inner(index),
            JoinKind::Left => Joiner::Left(index),
            JoinKind::StrictLeft => Joiner::StrictLeft(index),
            JoinKind::Anti => Joiner::Anti(index),
        }
    }

    /// Records to pair the current input record with. `None` entries
    /// stand for "no join-table record" (no-join queries, LEFT padding
    /// is a real null-filled record instead).
    pub fn get_rhs(
        &mut self,
        lhs_key: &[Value],
        functions: &FunctionRegistry,
    ) -> Result<Vec<Option<&Record>>> {
        // Null never matches anything.
        let null_key = lhs_key.iter().any(|v| v.is_null());
        match self {
            Joiner::None => Ok(vec![None]),
            Joiner::Inner(index) => {
                index.ensure_built(functions)?;
                if null_key {
                    return Ok(Vec::new());
                }
                Ok(index.lookup(lhs_key).iter().map(Some).collect())
            }
            Joiner::Left(index) => {
                index.ensure_built(functions)?;
                let bucket = if null_key { &[] } else { index.lookup(lhs_key) };
                if bucket.is_empty() {
                    Ok(vec![Some(&index.null_record)])
                } else {
                    Ok(bucket.iter().map(Some).collect())
                }
            }
            Joiner::StrictLeft(index) => {
                index.ensure_built(functions)?;
                let bucket = if null_key { &[] } else { index.lookup(lhs_key) };
                if bucket.len() != 1 {
                    Err(Error::runtime(format!(
                        "In \"STRICT LEFT JOIN\" each key in A must have exactly one match in B. Bad A key: \"{}\"",
                        lhs_key.iter().map(|v| v.to_string()).join(", ")
                    ))
                    .into())
                } else {
                    Ok(vec![Some(&bucket[0])])
                }
            }
            Joiner::Anti(index) => {
                index.ensure_built(functions)?;
                let empty = null_key || index.lookup(lhs_key).is_empty();
                if empty {
                    Ok(vec![None])
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    /// The borrowed join source, for warning collection and finalization.
    pub fn source_mut(&mut self) -> Option<&mut dyn InputIterator> {
        match self {
            Joiner::None => None,
            Joiner::Inner(index)
            | Joiner::Left(index)
            | Joiner::StrictLeft(index)
            | Joiner::Anti(index) => Some(index.source.as_mut()),
        }
    }
}
