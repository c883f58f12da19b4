//! Parser for expression snippets: [Token] stream → [Expr] tree.
//!
//! Operator layering follows the usual arithmetic/comparison/boolean
//! precedence; `LIKE` patterns are translated into anchored regexes
//! right here, at translation time.

use anyhow::Result;
use chumsky::error::SimpleReason;
use chumsky::{prelude::*, Stream};
use itertools::Itertools;
use regex::Regex;

use crate::ast::{BinOp, Expr, UnOp};
use crate::error::Error;
use crate::parser::lexer::{lex, Token};
use crate::parser::preprocess::combine_string_literals;

enum Postfix {
    Attr(String),
    Args(Vec<Expr>),
    Index(Expr),
}

fn ctrl(c: char) -> impl Parser<Token, (), Error = Simple<Token>> + Clone {
    just(Token::Control(c)).ignored()
}

fn ident_part() -> impl Parser<Token, String, Error = Simple<Token>> {
    select! { Token::Ident(name) => name }
}

fn expr_parser() -> impl Parser<Token, Expr, Error = Simple<Token>> {
    recursive(|expr| {
        let literal = select! { Token::Literal(value) => Expr::Literal(value) };

        let ident = ident_part().map(Expr::Ident);

        let parenthesized = expr
            .clone()
            .delimited_by(ctrl('('), ctrl(')'));

        let star = ctrl('*').to(Expr::Star);

        let atom = choice((literal, ident, parenthesized, star)).boxed();

        // Postfix chain: attribute access, call arguments, indexing.
        let attr = ctrl('.').ignore_then(ident_part()).map(Postfix::Attr);
        let args = expr
            .clone()
            .separated_by(ctrl(','))
            .delimited_by(ctrl('('), ctrl(')'))
            .map(Postfix::Args);
        let index = expr
            .clone()
            .delimited_by(ctrl('['), ctrl(']'))
            .map(Postfix::Index);

        let term = atom
            .then(choice((attr, args, index)).repeated())
            .foldl(|recv, postfix| match postfix {
                Postfix::Attr(name) => Expr::Attr {
                    recv: Box::new(recv),
                    name,
                },
                Postfix::Args(args) => Expr::Apply {
                    callee: Box::new(recv),
                    args,
                },
                Postfix::Index(index) => Expr::Index {
                    recv: Box::new(recv),
                    index: Box::new(index),
                },
            })
            .boxed();

        let unary = ctrl('-')
            .to(UnOp::Neg)
            .repeated()
            .then(term)
            .foldr(|op, expr| Expr::Unary {
                op,
                expr: Box::new(expr),
            })
            .boxed();

        let product = binary_layer(
            unary,
            choice((
                ctrl('*').to(BinOp::Mul),
                just(Token::DivInt).to(BinOp::FloorDiv),
                ctrl('/').to(BinOp::Div),
                ctrl('%').to(BinOp::Mod),
            )),
        );

        let sum = binary_layer(
            product,
            ctrl('+').to(BinOp::Add).or(ctrl('-').to(BinOp::Sub)),
        );

        // `x LIKE 'pat%'` / `x NOT LIKE 'pat%'`
        let like = sum
            .clone()
            .then(
                just(Token::Not)
                    .or_not()
                    .then_ignore(just(Token::Like))
                    .then(sum)
                    .or_not(),
            )
            .try_map(|(left, like_part), span| match like_part {
                None => Ok(left),
                Some((negation, pattern_expr)) => {
                    build_like(left, pattern_expr, negation.is_some())
                        .map_err(|msg| Simple::custom(span, msg))
                }
            })
            .boxed();

        let comparison = binary_layer(
            like,
            choice((
                just(Token::Eq).to(BinOp::Eq),
                just(Token::Ne).to(BinOp::Ne),
                just(Token::Lte).to(BinOp::Lte),
                just(Token::Gte).to(BinOp::Gte),
                ctrl('<').to(BinOp::Lt),
                ctrl('>').to(BinOp::Gt),
            )),
        );

        let negation = just(Token::Not)
            .to(UnOp::Not)
            .repeated()
            .then(comparison)
            .foldr(|op, expr| Expr::Unary {
                op,
                expr: Box::new(expr),
            })
            .boxed();

        let conjunction = binary_layer(negation, just(Token::And).to(BinOp::And));

        binary_layer(conjunction, just(Token::Or).to(BinOp::Or))
    })
}

fn binary_layer<'a, Term, Op>(
    term: Term,
    op: Op,
) -> impl Parser<Token, Expr, Error = Simple<Token>> + Clone + 'a
where
    Term: Parser<Token, Expr, Error = Simple<Token>> + Clone + 'a,
    Op: Parser<Token, BinOp, Error = Simple<Token>> + Clone + 'a,
{
    term.clone()
        .then(op.then(term).repeated())
        .foldl(|left, (op, right)| Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
        .boxed()
}

fn build_like(expr: Expr, pattern_expr: Expr, negated: bool) -> Result<Expr, String> {
    let Expr::Literal(crate::value::Value::Str(pattern)) = pattern_expr else {
        return Err("LIKE pattern must be a string literal".to_string());
    };
    let regex = like_to_regex(&pattern)?;
    Ok(Expr::Like {
        expr: Box::new(expr),
        pattern,
        regex,
        negated,
    })
}

/// Convert a LIKE pattern into an anchored regex: `%` → `.*`, `_` → `.`,
/// everything else matched verbatim.
pub(crate) fn like_to_regex(pattern: &str) -> Result<Regex, String> {
    let mut rx = String::with_capacity(pattern.len() + 2);
    rx.push('^');
    for c in pattern.chars() {
        match c {
            '%' => rx.push_str(".*"),
            '_' => rx.push('.'),
            '.' | '^' | '$' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\' => {
                rx.push('\\');
                rx.push(c);
            }
            other => rx.push(other),
        }
    }
    rx.push('$');
    Regex::new(&rx).map_err(|e| format!("Invalid LIKE pattern \"{pattern}\": {e}"))
}

/// Parse one expression snippet (with literal placeholders) into an
/// unresolved [Expr].
pub fn parse_expression(snippet: &str, literals: &[String]) -> Result<Expr> {
    let readable = || combine_string_literals(snippet, literals).trim().to_string();
    let tokens = lex(snippet, literals)?;
    if tokens.is_empty() {
        return Err(Error::parsing("Empty expression").into());
    }
    let eoi = tokens.last().map(|(_, span)| span.end).unwrap_or(0);
    let stream = Stream::from_iter(eoi..eoi + 1, tokens.into_iter());
    expr_parser()
        .then_ignore(end())
        .parse(stream)
        .map_err(|errors| {
            let details = errors.iter().map(describe_parse_error).join("; ");
            Error::parsing(format!(
                "Unable to parse expression \"{}\": {}",
                readable(),
                details
            ))
            .into()
        })
}

fn describe_parse_error(error: &Simple<Token>) -> String {
    if let SimpleReason::Custom(message) = error.reason() {
        return message.clone();
    }
    match error.found() {
        Some(token) => format!("unexpected {token:?}"),
        None => "unexpected end of expression".to_string(),
    }
}
