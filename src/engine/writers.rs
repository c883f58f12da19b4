//! The writer stack: record-consuming transformers composed bottom-up
//! around the terminal output sink, per query plan.
//!
//! `write` returns false to signal saturation; the executor stops at the
//! next record boundary. `finish` flushes buffered writers top-down.

use std::collections::{BTreeSet, HashSet};

use anyhow::{bail, Result};
use indexmap::IndexMap;

use crate::engine::aggregate::{Aggregator, GroupKey};
use crate::engine::OutputWriter;
use crate::semantic::{CompiledQuery, SelectItem, SelectPlan};
use crate::parser::stmt::DistinctMode;
use crate::value::{Record, Value};

pub enum Writer<'a> {
    /// Terminal adapter around the user-supplied sink.
    Output { dst: &'a mut dyn OutputWriter },
    /// LIMIT / TOP.
    Top {
        count: u64,
        written: u64,
        inner: Box<Writer<'a>>,
    },
    /// DISTINCT: set membership on whole records.
    Uniq {
        seen: HashSet<Record>,
        inner: Box<Writer<'a>>,
    },
    /// DISTINCT COUNT: first-seen order, count-prefixed rows on finish.
    UniqCount {
        records: IndexMap<Record, i64>,
        inner: Box<Writer<'a>>,
    },
    /// ORDER BY: buffers (key, record), emits sorted on finish.
    Sorted {
        entries: Vec<(Value, Record)>,
        reverse: bool,
        inner: Box<Writer<'a>>,
    },
    /// GROUP BY / aggregate queries: one slot per select item, groups
    /// emitted in sorted key order on finish.
    Aggregate {
        aggregators: Vec<Aggregator>,
        keys: BTreeSet<GroupKey>,
        inner: Box<Writer<'a>>,
    },
}

impl<'a> Writer<'a> {
    pub fn write(&mut self, record: Record) -> Result<bool> {
        match self {
            Writer::Output { dst } => dst.write(record),
            Writer::Top {
                count,
                written,
                inner,
            } => {
                if *written >= *count {
                    return Ok(false);
                }
                let proceed = inner.write(record)?;
                *written += 1;
                Ok(proceed)
            }
            Writer::Uniq { seen, inner } => {
                if !seen.insert(record.clone()) {
                    return Ok(true);
                }
                inner.write(record)
            }
            Writer::UniqCount { records, .. } => {
                *records.entry(record).or_insert(0) += 1;
                Ok(true)
            }
            Writer::Sorted { .. } => bail!("Internal error: sort writer expects a sort key"),
            Writer::Aggregate { .. } => {
                bail!("Internal error: aggregate writer expects a group key")
            }
        }
    }

    /// Entry point used instead of [Writer::write] when ORDER BY is
    /// active; only the outermost writer is sort-aware.
    pub fn write_sorted(&mut self, sort_key: Value, record: Record) -> Result<bool> {
        match self {
            Writer::Sorted { entries, .. } => {
                entries.push((sort_key, record));
                Ok(true)
            }
            _ => bail!("Internal error: sort key routed to a non-sort writer"),
        }
    }

    /// Entry point used instead of [Writer::write] for aggregate queries.
    pub fn write_grouped(&mut self, key: GroupKey, values: Vec<Value>) -> Result<bool> {
        match self {
            Writer::Aggregate {
                aggregators, keys, ..
            } => {
                for (aggregator, value) in aggregators.iter_mut().zip(values) {
                    aggregator.increment(&key, value)?;
                }
                keys.insert(key);
                Ok(true)
            }
            _ => bail!("Internal error: group key routed to a non-aggregate writer"),
        }
    }

    pub fn finish(&mut self) -> Result<()> {
        match self {
            Writer::Output { dst } => dst.finish(),
            Writer::Top { inner, .. } | Writer::Uniq { inner, .. } => inner.finish(),
            Writer::UniqCount { records, inner } => {
                for (record, count) in std::mem::take(records) {
                    let mut row = Vec::with_capacity(record.len() + 1);
                    row.push(Value::Int(count));
                    row.extend(record);
                    if !inner.write(row)? {
                        break;
                    }
                }
                inner.finish()
            }
            Writer::Sorted {
                entries,
                reverse,
                inner,
            } => {
                let mut entries = std::mem::take(entries);
                // Stable sort in both directions: reversing the key
                // comparison, not the buffer, keeps ties in first-seen
                // order.
                if *reverse {
                    entries.sort_by(|l, r| r.0.cmp(&l.0));
                } else {
                    entries.sort_by(|l, r| l.0.cmp(&r.0));
                }
                for (_, record) in entries {
                    if !inner.write(record)? {
                        break;
                    }
                }
                inner.finish()
            }
            Writer::Aggregate {
                aggregators,
                keys,
                inner,
            } => {
                for key in keys.iter() {
                    let row: Result<Record> = aggregators
                        .iter()
                        .map(|aggregator| aggregator.final_value(key))
                        .collect();
                    if !inner.write(row?)? {
                        break;
                    }
                }
                inner.finish()
            }
        }
    }
}

/// Compose the stack for one query: terminal, then LIMIT, then
/// aggregation or DISTINCT / DISTINCT COUNT, then ORDER BY outermost.
pub fn compose<'a>(plan: &CompiledQuery, output: &'a mut dyn OutputWriter) -> Writer<'a> {
    let mut writer = Writer::Output { dst: output };
    if let Some(count) = plan.top_count {
        writer = Writer::Top {
            count,
            written: 0,
            inner: Box::new(writer),
        };
    }
    if plan.aggregated {
        let aggregators = match &plan.select {
            SelectPlan::Items(items) => items
                .iter()
                .map(|item| match item {
                    SelectItem::Aggregate { func, .. } => Aggregator::for_func(*func),
                    _ => Aggregator::subkey_checker(),
                })
                .collect(),
            SelectPlan::Except(_) => Vec::new(),
        };
        writer = Writer::Aggregate {
            aggregators,
            keys: BTreeSet::new(),
            inner: Box::new(writer),
        };
    } else {
        match plan.distinct {
            DistinctMode::Distinct => {
                writer = Writer::Uniq {
                    seen: HashSet::new(),
                    inner: Box::new(writer),
                };
            }
            DistinctMode::DistinctCount => {
                writer = Writer::UniqCount {
                    records: IndexMap::new(),
                    inner: Box::new(writer),
                };
            }
            DistinctMode::None => {}
        }
        if let Some(order_by) = &plan.order_by {
            writer = Writer::Sorted {
                entries: Vec::new(),
                reverse: order_by.reverse,
                inner: Box::new(writer),
            };
        }
    }
    writer
}
