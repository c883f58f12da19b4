//! Per-group aggregation state.
//!
//! Each aggregator keeps its own key → state map, mirroring the writer
//! protocol: `increment` per row, `final_value` per group at finish.
//! Numeric inputs lift from int to float the first time a float (or a
//! float-looking string) is seen.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use itertools::Itertools;

use crate::ast::AggFunc;
use crate::engine::functions::to_float;
use crate::value::Value;

pub type GroupKey = Vec<Value>;

/// Int-until-proven-float numeric parser shared by MIN/MAX/SUM/MEDIAN.
pub struct NumParser {
    is_int: bool,
}

impl NumParser {
    pub fn new() -> Self {
        NumParser { is_int: true }
    }

    pub fn parse(&mut self, value: &Value) -> Result<Value> {
        if self.is_int {
            match value {
                Value::Int(i) => return Ok(Value::Int(*i)),
                Value::Str(s) => {
                    if let Ok(i) = s.trim().parse::<i64>() {
                        return Ok(Value::Int(i));
                    }
                }
                _ => {}
            }
            self.is_int = false;
        }
        Ok(Value::Float(to_float(value)?))
    }
}

impl Default for NumParser {
    fn default() -> Self {
        NumParser::new()
    }
}

fn add_numeric(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::Int(l), Value::Int(r)) => l
            .checked_add(*r)
            .map(Value::Int)
            .ok_or_else(|| anyhow::anyhow!("Integer overflow in SUM")),
        _ => Ok(Value::Float(to_float(left)? + to_float(right)?)),
    }
}

pub fn format_group_key(key: &GroupKey) -> String {
    match key.len() {
        0 => "()".to_string(),
        1 => key[0].to_string(),
        _ => format!("({})", key.iter().map(|v| v.to_string()).join(", ")),
    }
}

pub enum Aggregator {
    Min {
        stats: HashMap<GroupKey, Value>,
        num: NumParser,
    },
    Max {
        stats: HashMap<GroupKey, Value>,
        num: NumParser,
    },
    Count {
        stats: HashMap<GroupKey, i64>,
    },
    CountDistinct {
        stats: HashMap<GroupKey, HashSet<Value>>,
    },
    Sum {
        stats: HashMap<GroupKey, Value>,
        num: NumParser,
    },
    Avg {
        stats: HashMap<GroupKey, (f64, i64)>,
    },
    Variance {
        stats: HashMap<GroupKey, (f64, f64, i64)>,
    },
    Median {
        stats: HashMap<GroupKey, Vec<Value>>,
        num: NumParser,
    },
    ArrayAgg {
        stats: HashMap<GroupKey, Vec<Value>>,
    },
    Fold {
        stats: HashMap<GroupKey, Vec<Value>>,
    },
    /// Implicit aggregator for non-aggregate columns in a grouped query:
    /// remembers the first value and fails on divergence.
    Subkey {
        stats: HashMap<GroupKey, Value>,
    },
}

impl Aggregator {
    pub fn for_func(func: AggFunc) -> Aggregator {
        match func {
            AggFunc::Min => Aggregator::Min {
                stats: HashMap::new(),
                num: NumParser::new(),
            },
            AggFunc::Max => Aggregator::Max {
                stats: HashMap::new(),
                num: NumParser::new(),
            },
            AggFunc::Count => Aggregator::Count {
                stats: HashMap::new(),
            },
            AggFunc::CountDistinct => Aggregator::CountDistinct {
                stats: HashMap::new(),
            },
            AggFunc::Sum => Aggregator::Sum {
                stats: HashMap::new(),
                num: NumParser::new(),
            },
            AggFunc::Avg => Aggregator::Avg {
                stats: HashMap::new(),
            },
            AggFunc::Variance => Aggregator::Variance {
                stats: HashMap::new(),
            },
            AggFunc::Median => Aggregator::Median {
                stats: HashMap::new(),
                num: NumParser::new(),
            },
            AggFunc::ArrayAgg => Aggregator::ArrayAgg {
                stats: HashMap::new(),
            },
            AggFunc::Fold => Aggregator::Fold {
                stats: HashMap::new(),
            },
        }
    }

    pub fn subkey_checker() -> Aggregator {
        Aggregator::Subkey {
            stats: HashMap::new(),
        }
    }

    pub fn increment(&mut self, key: &GroupKey, value: Value) -> Result<()> {
        match self {
            Aggregator::Min { stats, num } => {
                let value = num.parse(&value)?;
                match stats.get_mut(key) {
                    Some(current) => {
                        if value < *current {
                            *current = value;
                        }
                    }
                    None => {
                        stats.insert(key.clone(), value);
                    }
                }
            }
            Aggregator::Max { stats, num } => {
                let value = num.parse(&value)?;
                match stats.get_mut(key) {
                    Some(current) => {
                        if value > *current {
                            *current = value;
                        }
                    }
                    None => {
                        stats.insert(key.clone(), value);
                    }
                }
            }
            Aggregator::Count { stats } => {
                *stats.entry(key.clone()).or_insert(0) += 1;
            }
            Aggregator::CountDistinct { stats } => {
                stats.entry(key.clone()).or_default().insert(value);
            }
            Aggregator::Sum { stats, num } => {
                let value = num.parse(&value)?;
                let current = stats.entry(key.clone()).or_insert(Value::Int(0));
                *current = add_numeric(current, &value)?;
            }
            Aggregator::Avg { stats } => {
                let value = to_float(&value)?;
                let (sum, count) = stats.entry(key.clone()).or_insert((0.0, 0));
                *sum += value;
                *count += 1;
            }
            Aggregator::Variance { stats } => {
                let value = to_float(&value)?;
                let (sum, sum_of_squares, count) =
                    stats.entry(key.clone()).or_insert((0.0, 0.0, 0));
                *sum += value;
                *sum_of_squares += value * value;
                *count += 1;
            }
            Aggregator::Median { stats, num } => {
                let value = num.parse(&value)?;
                stats.entry(key.clone()).or_default().push(value);
            }
            Aggregator::ArrayAgg { stats } | Aggregator::Fold { stats } => {
                stats.entry(key.clone()).or_default().push(value);
            }
            Aggregator::Subkey { stats } => match stats.get(key) {
                None => {
                    stats.insert(key.clone(), value);
                }
                Some(current) => {
                    if !current.loose_eq(&value) {
                        bail!(
                            "Unable to group by \"{}\", different values in output: \"{}\" and \"{}\"",
                            format_group_key(key),
                            current,
                            value
                        );
                    }
                }
            },
        }
        Ok(())
    }

    pub fn final_value(&self, key: &GroupKey) -> Result<Value> {
        match self {
            Aggregator::Min { stats, .. }
            | Aggregator::Max { stats, .. }
            | Aggregator::Sum { stats, .. }
            | Aggregator::Subkey { stats } => stats
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Internal error: empty aggregation group")),
            Aggregator::Count { stats } => Ok(Value::Int(*stats.get(key).unwrap_or(&0))),
            Aggregator::CountDistinct { stats } => Ok(Value::Int(
                stats.get(key).map(|set| set.len() as i64).unwrap_or(0),
            )),
            Aggregator::Avg { stats } => {
                let (sum, count) = stats
                    .get(key)
                    .ok_or_else(|| anyhow::anyhow!("Internal error: empty aggregation group"))?;
                Ok(Value::Float(sum / *count as f64))
            }
            Aggregator::Variance { stats } => {
                let (sum, sum_of_squares, count) = stats
                    .get(key)
                    .ok_or_else(|| anyhow::anyhow!("Internal error: empty aggregation group"))?;
                let count = *count as f64;
                Ok(Value::Float(
                    sum_of_squares / count - (sum / count) * (sum / count),
                ))
            }
            Aggregator::Median { stats, .. } => {
                let mut values = stats
                    .get(key)
                    .ok_or_else(|| anyhow::anyhow!("Internal error: empty aggregation group"))?
                    .clone();
                values.sort();
                let middle = values.len() / 2;
                if values.len() % 2 == 1 {
                    Ok(values[middle].clone())
                } else {
                    let left = &values[middle - 1];
                    let right = &values[middle];
                    if left.loose_eq(right) {
                        Ok(left.clone())
                    } else {
                        Ok(Value::Float((to_float(left)? + to_float(right)?) / 2.0))
                    }
                }
            }
            Aggregator::ArrayAgg { stats } => Ok(Value::List(
                stats.get(key).cloned().unwrap_or_default(),
            )),
            Aggregator::Fold { stats } => Ok(Value::Str(
                stats
                    .get(key)
                    .map(|values| values.iter().map(|v| v.to_string()).join("|"))
                    .unwrap_or_default(),
            )),
        }
    }
}
