//! Builtin scalar functions, string methods, and the plugin table for
//! user-registered functions.

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::engine::eval::compare_values;
use crate::value::Value;

const BUILTIN_NAMES: &[&str] = &["int", "float", "str", "len", "abs", "min", "max", "round"];

pub type CustomFunction = Box<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Plugin table consulted during compilation: a name must be either a
/// builtin or registered here to be callable from a query.
#[derive(Default)]
pub struct FunctionRegistry {
    custom: HashMap<String, CustomFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        function: impl Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    ) {
        self.custom.insert(name.into(), Box::new(function));
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.custom.contains_key(name) || BUILTIN_NAMES.contains(&name)
    }

    pub(crate) fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        if let Some(function) = self.custom.get(name) {
            return function(args).map_err(|message| {
                anyhow::anyhow!("Custom function \"{name}\" failed: {message}")
            });
        }
        call_builtin(name, args)
    }
}

fn expect_arity(name: &str, args: &[Value], expected: std::ops::RangeInclusive<usize>) -> Result<()> {
    if !expected.contains(&args.len()) {
        bail!(
            "Function \"{}\" got {} arguments, expected {}..{}",
            name,
            args.len(),
            expected.start(),
            expected.end()
        );
    }
    Ok(())
}

pub(crate) fn to_int(value: &Value) -> Result<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Float(f) => Ok(f.trunc() as i64),
        Value::Bool(b) => Ok(*b as i64),
        Value::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Unable to convert \"{s}\" to int")),
        other => bail!("Unable to convert {} value to int", other.type_name()),
    }
}

pub(crate) fn to_float(value: &Value) -> Result<f64> {
    match value {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        Value::Bool(b) => Ok(*b as i64 as f64),
        Value::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Unable to convert \"{s}\" to float")),
        other => bail!("Unable to convert {} value to float", other.type_name()),
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "int" => {
            expect_arity(name, args, 1..=1)?;
            Ok(Value::Int(to_int(&args[0])?))
        }
        "float" => {
            expect_arity(name, args, 1..=1)?;
            Ok(Value::Float(to_float(&args[0])?))
        }
        "str" => {
            expect_arity(name, args, 1..=1)?;
            Ok(Value::Str(args[0].to_string()))
        }
        "len" => {
            expect_arity(name, args, 1..=1)?;
            match &args[0] {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(l) => Ok(Value::Int(l.len() as i64)),
                other => bail!("Unable to get len() of {} value", other.type_name()),
            }
        }
        "abs" => {
            expect_arity(name, args, 1..=1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(i.abs())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => bail!("Unable to get abs() of {} value", other.type_name()),
            }
        }
        "min" | "max" => {
            if args.len() < 2 {
                bail!("Function \"{name}\" expects at least 2 arguments");
            }
            let mut best = args[0].clone();
            for candidate in &args[1..] {
                let ordering = compare_values(candidate, &best)?;
                let replace = if name == "min" {
                    ordering.is_lt()
                } else {
                    ordering.is_gt()
                };
                if replace {
                    best = candidate.clone();
                }
            }
            Ok(best)
        }
        "round" => {
            expect_arity(name, args, 1..=2)?;
            let value = to_float(&args[0])?;
            match args.get(1) {
                None => Ok(Value::Int(value.round() as i64)),
                Some(digits) => {
                    let digits = to_int(digits)?;
                    let scale = 10f64.powi(digits as i32);
                    Ok(Value::Float((value * scale).round() / scale))
                }
            }
        }
        _ => bail!("Unknown function \"{name}\""),
    }
}

/// String method dispatch: `a1.split(",")` and friends.
pub(crate) fn call_method(recv: &Value, name: &str, args: &[Value]) -> Result<Value> {
    let Value::Str(s) = recv else {
        bail!(
            "Value of type {} has no method \"{}\"",
            recv.type_name(),
            name
        );
    };
    match name {
        "split" => {
            expect_arity(name, args, 0..=1)?;
            match args.first() {
                None => Ok(Value::List(
                    s.split_whitespace().map(Value::from).collect(),
                )),
                Some(Value::Str(sep)) if !sep.is_empty() => Ok(Value::List(
                    s.split(sep.as_str()).map(Value::from).collect(),
                )),
                Some(_) => bail!("split() separator must be a non-empty string"),
            }
        }
        "upper" => {
            expect_arity(name, args, 0..=0)?;
            Ok(Value::Str(s.to_uppercase()))
        }
        "lower" => {
            expect_arity(name, args, 0..=0)?;
            Ok(Value::Str(s.to_lowercase()))
        }
        "strip" => {
            expect_arity(name, args, 0..=0)?;
            Ok(Value::Str(s.trim().to_string()))
        }
        "replace" => {
            expect_arity(name, args, 2..=2)?;
            match (&args[0], &args[1]) {
                (Value::Str(from), Value::Str(to)) => {
                    Ok(Value::Str(s.replace(from.as_str(), to)))
                }
                _ => bail!("replace() expects two string arguments"),
            }
        }
        "startswith" => {
            expect_arity(name, args, 1..=1)?;
            match &args[0] {
                Value::Str(p) => Ok(Value::Bool(s.starts_with(p.as_str()))),
                _ => bail!("startswith() expects a string argument"),
            }
        }
        "endswith" => {
            expect_arity(name, args, 1..=1)?;
            match &args[0] {
                Value::Str(p) => Ok(Value::Bool(s.ends_with(p.as_str()))),
                _ => bail!("endswith() expects a string argument"),
            }
        }
        _ => bail!("Unknown string method \"{name}\""),
    }
}
