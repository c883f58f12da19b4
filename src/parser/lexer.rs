//! Lexer for expression snippets.
//!
//! Snippets arrive with string literals already replaced by placeholder
//! tokens; [lex] maps placeholders back into string values, so
//! downstream never sees them.

use anyhow::Result;
use chumsky::{error::Cheap, prelude::*};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Error;
use crate::parser::preprocess::unquote_string_literal;
use crate::value::Value;

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Token {
    Ident(String),
    Literal(Value),

    /// single-char control tokens
    Control(char),

    Eq,     // ==
    Ne,     // !=
    Gte,    // >=
    Lte,    // <=
    DivInt, // //

    // word operators, matched case-insensitively
    And,
    Or,
    Not,
    Like,
}

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^___RBQL_STRING_LITERAL([0-9]+)___$").expect("valid regex"));

fn lexer() -> impl Parser<char, Vec<(Token, std::ops::Range<usize>)>, Error = Cheap<char>> {
    let control_multi = choice((
        just("==").to(Token::Eq),
        just("!=").to(Token::Ne),
        just(">=").to(Token::Gte),
        just("<=").to(Token::Lte),
        just("//").to(Token::DivInt),
    ));

    let control = one_of("></%=+-*[]().,").map(Token::Control);

    let ident = ident_part().map(word_token);

    let literal = literal().map(Token::Literal);

    let whitespace = filter(|c: &char| c.is_whitespace()).repeated();

    let token = choice((control_multi, literal, ident, control));

    whitespace
        .clone()
        .ignore_then(token.map_with_span(|tok, span| (tok, span)))
        .repeated()
        .then_ignore(whitespace)
        .then_ignore(end())
}

fn ident_part() -> impl Parser<char, String, Error = Cheap<char>> {
    filter(|c: &char| c.is_ascii_alphabetic() || *c == '_')
        .chain(filter(|c: &char| c.is_ascii_alphanumeric() || *c == '_').repeated())
        .collect()
}

/// Word operators and word literals come out of the ident path so that
/// maximal-munch boundaries are respected (`android` is an ident, not
/// `and` + `roid`).
fn word_token(ident: String) -> Token {
    match ident.to_ascii_lowercase().as_str() {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "like" => Token::Like,
        "true" => Token::Literal(Value::Bool(true)),
        "false" => Token::Literal(Value::Bool(false)),
        "null" | "none" => Token::Literal(Value::Null),
        _ => Token::Ident(ident),
    }
}

fn literal() -> impl Parser<char, Value, Error = Cheap<char>> {
    let digits = filter(|c: &char| c.is_ascii_digit()).repeated().at_least(1);

    let exp = one_of("eE").chain(one_of("+-").or_not().chain::<char, _, _>(digits.clone()));

    let frac = just('.').chain(digits.clone());

    let number = digits
        .chain::<char, _, _>(frac.or_not().flatten())
        .chain::<char, _, _>(exp.or_not().flatten())
        .collect::<String>()
        .try_map(|s, span| {
            if let Ok(i) = s.parse::<i64>() {
                Ok(Value::Int(i))
            } else if let Ok(f) = s.parse::<f64>() {
                Ok(Value::Float(f))
            } else {
                Err(Cheap::expected_input_found(span, None, None))
            }
        });

    let string = quoted_string('"').or(quoted_string('\'')).map(Value::Str);

    number.or(string)
}

fn quoted_string(quote: char) -> impl Parser<char, String, Error = Cheap<char>> {
    let escaped = just('\\').ignore_then(any()).map(|c| match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        other => other,
    });
    let regular = filter(move |c: &char| *c != quote && *c != '\\');

    just(quote)
        .ignore_then(regular.or(escaped).repeated())
        .then_ignore(just(quote))
        .collect()
}

/// Tokenize one expression snippet, resolving literal placeholders
/// against the extracted literal table.
pub fn lex(snippet: &str, literals: &[String]) -> Result<Vec<(Token, std::ops::Range<usize>)>> {
    let tokens = lexer().parse(snippet).map_err(|_| {
        Error::parsing(format!(
            "Unable to parse expression: \"{}\"",
            crate::parser::preprocess::combine_string_literals(snippet, literals).trim()
        ))
    })?;

    tokens
        .into_iter()
        .map(|(tok, span)| {
            let tok = match tok {
                Token::Ident(name) => match PLACEHOLDER_RE.captures(&name) {
                    Some(caps) => {
                        let index: usize = caps[1]
                            .parse()
                            .map_err(|_| Error::parsing("Invalid string literal placeholder"))?;
                        let literal = literals.get(index).ok_or_else(|| {
                            Error::parsing("Invalid string literal placeholder")
                        })?;
                        Token::Literal(Value::Str(unquote_string_literal(literal)))
                    }
                    None => Token::Ident(name),
                },
                other => other,
            };
            Ok((tok, span))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn kinds(snippet: &str) -> Vec<Token> {
        lex(snippet, &[]).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_lex_numbers() {
        assert_eq!(kinds("12"), vec![Token::Literal(Value::Int(12))]);
        assert_eq!(kinds("12.5"), vec![Token::Literal(Value::Float(12.5))]);
        assert_eq!(kinds("1e3"), vec![Token::Literal(Value::Float(1000.0))]);
    }

    #[test]
    fn test_lex_operators() {
        assert_eq!(
            kinds("a2 // 10 >= -1"),
            vec![
                Token::Ident("a2".to_string()),
                Token::DivInt,
                Token::Literal(Value::Int(10)),
                Token::Gte,
                Token::Control('-'),
                Token::Literal(Value::Int(1)),
            ]
        );
    }

    #[test]
    fn test_lex_word_operators_case_insensitive() {
        assert_eq!(kinds("AND Or not"), vec![Token::And, Token::Or, Token::Not]);
        // ...but only at word boundaries
        assert_eq!(kinds("android"), vec![Token::Ident("android".to_string())]);
    }

    #[test]
    fn test_lex_word_literals() {
        assert_eq!(
            kinds("true None"),
            vec![
                Token::Literal(Value::Bool(true)),
                Token::Literal(Value::Null)
            ]
        );
    }

    #[test]
    fn test_lex_placeholder_restores_literal() {
        let literals = vec!["'it\\'s'".to_string()];
        let tokens = lex("a1 == ___RBQL_STRING_LITERAL0___", &literals).unwrap();
        assert_eq!(
            tokens.last().unwrap().0,
            Token::Literal(Value::Str("it's".to_string()))
        );
    }

    #[test]
    fn test_lex_inline_string() {
        assert_eq!(
            kinds(r#""a\tb""#),
            vec![Token::Literal(Value::Str("a\tb".to_string()))]
        );
    }

    #[test]
    fn test_lex_error() {
        assert!(lex("a1 ? 2", &[]).is_err());
    }
}
