//! Expression trees for the embedded scalar language.
//!
//! The parser produces name-based nodes ([Expr::Ident], [Expr::Apply]);
//! semantic resolution rewrites them into typed access paths
//! ([Expr::Column], [Expr::Call], [Expr::Method]) before execution.

use regex::Regex;

use crate::value::Value;

/// The two record sources a query can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    A,
    B,
}

impl Table {
    pub fn prefix(&self) -> char {
        match self {
            Table::A => 'a',
            Table::B => 'b',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
}

/// Aggregate functions recognized in SELECT items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AggFunc {
    Min,
    Max,
    Sum,
    Avg,
    Count,
    CountDistinct,
    Median,
    Variance,
    ArrayAgg,
    Fold,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// Unresolved name; eliminated by resolution.
    Ident(String),
    /// `*` in argument position, i.e. `COUNT(*)`.
    Star,
    /// Field access resolved to a 0-based index.
    Column { table: Table, index: usize },
    /// 1-based number of the current input record.
    Nr,
    /// Number of fields in the current input record.
    Nf,
    /// Unresolved `recv.name`; eliminated by resolution.
    Attr { recv: Box<Expr>, name: String },
    /// Unresolved `recv[index]`; eliminated by resolution.
    Index { recv: Box<Expr>, index: Box<Expr> },
    /// Unresolved `callee(args)`; eliminated by resolution.
    Apply { callee: Box<Expr>, args: Vec<Expr> },
    /// Builtin or registered function call.
    Call { name: String, args: Vec<Expr> },
    /// String method call, e.g. `a1.split(",")`.
    Method {
        recv: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    /// Bounds-tolerant field access: null past the record end.
    SafeGet { table: Table, index: Box<Expr> },
    Unary { op: UnOp, expr: Box<Expr> },
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    /// `LIKE` / `NOT LIKE` with the pattern compiled at parse time.
    Like {
        expr: Box<Expr>,
        pattern: String,
        regex: Regex,
        negated: bool,
    },
}
