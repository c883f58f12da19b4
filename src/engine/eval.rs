//! Tree-walking evaluator for resolved expressions.
//!
//! Arithmetic keeps the host-language flavor of the surface queries:
//! `/` is float division, `//` floors, `%` takes the divisor's sign,
//! `and`/`or` return an operand rather than a bare boolean.

use std::cmp::Ordering;

use anyhow::{bail, Result};

use crate::ast::{BinOp, Expr, Table, UnOp};
use crate::engine::functions::{self, FunctionRegistry};
use crate::error::BadFieldError;
use crate::value::Value;

pub struct EvalContext<'a> {
    pub record_a: &'a [Value],
    pub record_b: Option<&'a [Value]>,
    pub nr: i64,
    pub nf: usize,
    pub functions: &'a FunctionRegistry,
}

pub fn eval(expr: &Expr, ctx: &EvalContext) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Column { table, index } => get_field(*table, *index, ctx),
        Expr::Nr => Ok(Value::Int(ctx.nr)),
        Expr::Nf => Ok(Value::Int(ctx.nf as i64)),
        Expr::SafeGet { table, index } => {
            let index = match eval(index, ctx)? {
                Value::Int(i) => i,
                other => bail!("safe_get() index must be an int, got {}", other.type_name()),
            };
            let record = match table {
                Table::A => ctx.record_a,
                Table::B => ctx.record_b.unwrap_or(&[]),
            };
            if index >= 1 && (index as usize) <= record.len() {
                Ok(record[index as usize - 1].clone())
            } else {
                Ok(Value::Null)
            }
        }
        Expr::Index { recv, index } => {
            let recv = eval(recv, ctx)?;
            let index = eval(index, ctx)?;
            index_value(&recv, &index)
        }
        Expr::Call { name, args } => {
            let args: Result<Vec<Value>> = args.iter().map(|arg| eval(arg, ctx)).collect();
            ctx.functions.call(name, &args?)
        }
        Expr::Method { recv, name, args } => {
            let recv = eval(recv, ctx)?;
            let args: Result<Vec<Value>> = args.iter().map(|arg| eval(arg, ctx)).collect();
            functions::call_method(&recv, name, &args?)
        }
        Expr::Unary { op, expr } => {
            let value = eval(expr, ctx)?;
            match op {
                UnOp::Not => Ok(Value::Bool(!value.is_truthy())),
                UnOp::Neg => match value {
                    Value::Int(i) => i
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| anyhow::anyhow!("Integer overflow")),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => bail!("Unable to negate {} value", other.type_name()),
                },
            }
        }
        Expr::Binary { left, op, right } => match op {
            // Short-circuiting, returning an operand like the original
            // host language does.
            BinOp::And => {
                let left = eval(left, ctx)?;
                if left.is_truthy() {
                    eval(right, ctx)
                } else {
                    Ok(left)
                }
            }
            BinOp::Or => {
                let left = eval(left, ctx)?;
                if left.is_truthy() {
                    Ok(left)
                } else {
                    eval(right, ctx)
                }
            }
            _ => {
                let left = eval(left, ctx)?;
                let right = eval(right, ctx)?;
                binary_op(*op, &left, &right)
            }
        },
        Expr::Like {
            expr,
            pattern,
            regex,
            negated,
        } => match eval(expr, ctx)? {
            Value::Str(s) => Ok(Value::Bool(regex.is_match(&s) != *negated)),
            Value::Null => Ok(Value::Bool(false)),
            other => bail!(
                "LIKE pattern \"{pattern}\" requires a string operand, got {}",
                other.type_name()
            ),
        },
        Expr::Ident(_) | Expr::Star | Expr::Attr { .. } | Expr::Apply { .. } => {
            bail!("Internal error: unresolved expression node survived compilation")
        }
    }
}

fn get_field(table: Table, index: usize, ctx: &EvalContext) -> Result<Value> {
    let record = match table {
        Table::A => ctx.record_a,
        Table::B => ctx.record_b.unwrap_or(&[]),
    };
    record.get(index).cloned().ok_or_else(|| {
        BadFieldError {
            prefix: table.prefix(),
            index,
        }
        .into()
    })
}

fn index_value(recv: &Value, index: &Value) -> Result<Value> {
    let Value::Int(i) = index else {
        bail!("Subscript must be an int, got {}", index.type_name());
    };
    match recv {
        Value::List(items) => {
            let len = items.len() as i64;
            let effective = if *i < 0 { len + i } else { *i };
            if effective < 0 || effective >= len {
                bail!("List index {i} out of range");
            }
            Ok(items[effective as usize].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let effective = if *i < 0 { len + i } else { *i };
            if effective < 0 || effective >= len {
                bail!("String index {i} out of range");
            }
            Ok(Value::Str(chars[effective as usize].to_string()))
        }
        other => bail!("Value of type {} is not subscriptable", other.type_name()),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

/// Ordering for `<`/`>` style comparisons and the `min`/`max` builtins:
/// numerics compare across Int/Float, text compares with text,
/// everything else is a type error.
pub(crate) fn compare_values(left: &Value, right: &Value) -> Result<Ordering> {
    match (left, right) {
        (Value::Int(l), Value::Int(r)) => Ok(l.cmp(r)),
        (Value::Str(l), Value::Str(r)) => Ok(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Ok(l.cmp(r)),
        _ => match (as_f64(left), as_f64(right)) {
            (Some(l), Some(r)) => Ok(l.total_cmp(&r)),
            _ => bail!(
                "Unable to compare {} and {} values",
                left.type_name(),
                right.type_name()
            ),
        },
    }
}

fn python_floor_div(left: i64, right: i64) -> i64 {
    let quotient = left / right;
    let remainder = left % right;
    if remainder != 0 && (remainder < 0) != (right < 0) {
        quotient - 1
    } else {
        quotient
    }
}

fn python_mod(left: i64, right: i64) -> i64 {
    ((left % right) + right) % right
}

fn binary_op(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    match op {
        BinOp::Eq => return Ok(Value::Bool(left.loose_eq(right))),
        BinOp::Ne => return Ok(Value::Bool(!left.loose_eq(right))),
        BinOp::Lt => return Ok(Value::Bool(compare_values(left, right)?.is_lt())),
        BinOp::Lte => return Ok(Value::Bool(compare_values(left, right)?.is_le())),
        BinOp::Gt => return Ok(Value::Bool(compare_values(left, right)?.is_gt())),
        BinOp::Gte => return Ok(Value::Bool(compare_values(left, right)?.is_ge())),
        _ => {}
    }

    if let BinOp::Add = op {
        match (left, right) {
            (Value::Str(l), Value::Str(r)) => return Ok(Value::Str(format!("{l}{r}"))),
            (Value::List(l), Value::List(r)) => {
                let mut combined = l.clone();
                combined.extend(r.iter().cloned());
                return Ok(Value::List(combined));
            }
            _ => {}
        }
    }

    let type_error = || {
        anyhow::anyhow!(
            "Unsupported operand types for {:?}: {} and {}",
            op,
            left.type_name(),
            right.type_name()
        )
    };

    // Exact arithmetic while both sides are ints.
    if let (Value::Int(l), Value::Int(r)) = (left, right) {
        return match op {
            BinOp::Add => l.checked_add(*r).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => l.checked_sub(*r).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => l.checked_mul(*r).map(Value::Int).ok_or_else(overflow),
            BinOp::Div => {
                if *r == 0 {
                    bail!("Division by zero");
                }
                Ok(Value::Float(*l as f64 / *r as f64))
            }
            BinOp::FloorDiv => {
                if *r == 0 {
                    bail!("Division by zero");
                }
                Ok(Value::Int(python_floor_div(*l, *r)))
            }
            BinOp::Mod => {
                if *r == 0 {
                    bail!("Division by zero");
                }
                Ok(Value::Int(python_mod(*l, *r)))
            }
            _ => Err(type_error()),
        };
    }

    let (Some(l), Some(r)) = (as_f64(left), as_f64(right)) else {
        return Err(type_error());
    };
    match op {
        BinOp::Add => Ok(Value::Float(l + r)),
        BinOp::Sub => Ok(Value::Float(l - r)),
        BinOp::Mul => Ok(Value::Float(l * r)),
        BinOp::Div => {
            if r == 0.0 {
                bail!("Division by zero");
            }
            Ok(Value::Float(l / r))
        }
        BinOp::FloorDiv => {
            if r == 0.0 {
                bail!("Division by zero");
            }
            Ok(Value::Float((l / r).floor()))
        }
        BinOp::Mod => {
            if r == 0.0 {
                bail!("Division by zero");
            }
            Ok(Value::Float(l - r * (l / r).floor()))
        }
        _ => Err(type_error()),
    }
}

fn overflow() -> anyhow::Error {
    anyhow::anyhow!("Integer overflow")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::semantic::compile_test_expression;

    fn eval_str(snippet: &str, record_a: &[Value]) -> Result<Value> {
        let registry = FunctionRegistry::new();
        let expr = compile_test_expression(snippet);
        let ctx = EvalContext {
            record_a,
            record_b: None,
            nr: 1,
            nf: record_a.len(),
            functions: &registry,
        };
        eval(&expr, &ctx)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_str("1 + 2 * 3", &[]).unwrap(), Value::Int(7));
        assert_eq!(eval_str("7 / 2", &[]).unwrap(), Value::Float(3.5));
        assert_eq!(eval_str("7 // 2", &[]).unwrap(), Value::Int(3));
        assert_eq!(eval_str("-551 // 10", &[]).unwrap(), Value::Int(-56));
        assert_eq!(eval_str("-7 % 3", &[]).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(eval_str("1 / 0", &[]).is_err());
        assert!(eval_str("1 // 0", &[]).is_err());
        assert!(eval_str("1 % 0", &[]).is_err());
    }

    #[test]
    fn test_string_concat() {
        assert_eq!(
            eval_str("\"name \" + a1", &[Value::from("Confucius")]).unwrap(),
            Value::Str("name Confucius".to_string())
        );
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval_str("1 < 2.5", &[]).unwrap(), Value::Bool(true));
        assert_eq!(eval_str("1 == 1.0", &[]).unwrap(), Value::Bool(true));
        assert_eq!(eval_str("1 == \"1\"", &[]).unwrap(), Value::Bool(false));
        assert!(eval_str("1 < \"2\"", &[]).is_err());
    }

    #[test]
    fn test_boolean_operators_return_operands() {
        assert_eq!(
            eval_str("\"\" or \"fallback\"", &[]).unwrap(),
            Value::Str("fallback".to_string())
        );
        assert_eq!(eval_str("0 and 1", &[]).unwrap(), Value::Int(0));
        assert_eq!(eval_str("not 0", &[]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_field_access_out_of_bounds() {
        let err = eval_str("a3", &[Value::from("x")]).unwrap_err();
        assert!(err.downcast_ref::<BadFieldError>().is_some());
    }

    #[test]
    fn test_safe_get() {
        let record = [Value::from("x")];
        assert_eq!(eval_str("safe_get(a, 1)", &record).unwrap(), Value::from("x"));
        assert_eq!(eval_str("safe_get(a, 3)", &record).unwrap(), Value::Null);
    }

    #[test]
    fn test_method_chain_with_index() {
        let record = [Value::from("a,b,c")];
        assert_eq!(
            eval_str("a1.split(\",\")[1]", &record).unwrap(),
            Value::from("b")
        );
        assert_eq!(
            eval_str("a1.split(\",\")[-1]", &record).unwrap(),
            Value::from("c")
        );
    }

    #[test]
    fn test_nr_nf() {
        let record = [Value::from("x"), Value::from("y")];
        assert_eq!(eval_str("NR", &record).unwrap(), Value::Int(1));
        assert_eq!(eval_str("NF", &record).unwrap(), Value::Int(2));
    }
}
