//! Restricted SQL parser.
//!
//! Recognizes exactly one query shape and nothing else:
//!
//! ```text
//! SELECT <AGG>( <ident> | * ) FROM <ident> [ WHERE <pred> (AND <pred>)* ]
//! <pred> := <ident> <op> <literal>
//! <op>   := = | != | < | <= | > | >=
//! ```
//!
//! Keywords and aggregate names match case-insensitively; column names are
//! matched case-sensitively against the schema allowlist. The input is
//! canonicalized (trimmed, whitespace collapsed) before tokenization, and
//! comment/semicolon sequences are rejected outright.

use crate::domain::query::{AggFn, AggTarget, Filter, FilterOp, Literal, ParsedQuery};
use crate::domain::schema::{self, TABLE_NAME};

/// Why a query string was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NotAllowed {
    #[error("Comments and semicolons are not allowed")]
    CommentOrSemicolon,

    #[error("Only single aggregate queries are allowed, e.g. SELECT AVG(chol) FROM patient_records WHERE ...")]
    UnsupportedShape,

    #[error("Aggregate not allowed: {0}")]
    AggregateNotAllowed(String),

    #[error("Only the patient_records table is allowed, got: {0}")]
    TableNotAllowed(String),

    #[error("* is only allowed as the argument of COUNT")]
    StarRequiresCount,

    #[error("Column not allowed: {0}")]
    ColumnNotAllowed(String),

    #[error("OR is not allowed in WHERE clauses")]
    OrNotAllowed,

    #[error("Operator not allowed: {0}")]
    OperatorNotAllowed(String),

    #[error("Value format not allowed: {0}")]
    ValueNotAllowed(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    Star,
    Op(FilterOp),
}

/// Strip and collapse whitespace, rejecting injection-shaped substrings.
fn canonicalize(sql: &str) -> Result<String, NotAllowed> {
    for banned in [";", "--", "/*", "*/"] {
        if sql.contains(banned) {
            return Err(NotAllowed::CommentOrSemicolon);
        }
    }
    Ok(sql.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn tokenize(src: &str) -> Result<Vec<Token>, NotAllowed> {
    let mut tokens = Vec::new();
    let mut it = src.char_indices().peekable();

    while let Some(&(start, c)) = it.peek() {
        match c {
            c if c.is_whitespace() => {
                it.next();
            }
            '(' => {
                it.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                it.next();
                tokens.push(Token::RParen);
            }
            '*' => {
                it.next();
                tokens.push(Token::Star);
            }
            '=' => {
                it.next();
                tokens.push(Token::Op(FilterOp::Eq));
            }
            '!' => {
                it.next();
                match it.peek() {
                    Some(&(_, '=')) => {
                        it.next();
                        tokens.push(Token::Op(FilterOp::Ne));
                    }
                    _ => return Err(NotAllowed::OperatorNotAllowed("!".to_string())),
                }
            }
            // Longest operator first: `<=` must not lex as `<` then `=`.
            '<' => {
                it.next();
                if matches!(it.peek(), Some(&(_, '='))) {
                    it.next();
                    tokens.push(Token::Op(FilterOp::Le));
                } else {
                    tokens.push(Token::Op(FilterOp::Lt));
                }
            }
            '>' => {
                it.next();
                if matches!(it.peek(), Some(&(_, '='))) {
                    it.next();
                    tokens.push(Token::Op(FilterOp::Ge));
                } else {
                    tokens.push(Token::Op(FilterOp::Gt));
                }
            }
            '\'' => {
                it.next();
                let mut value = String::new();
                let mut closed = false;
                for (_, ch) in it.by_ref() {
                    if ch == '\'' {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                }
                if !closed {
                    return Err(NotAllowed::ValueNotAllowed(format!("'{value}")));
                }
                // 'ab''cd' would otherwise lex as two adjacent strings.
                if matches!(it.peek(), Some(&(_, '\''))) {
                    return Err(NotAllowed::ValueNotAllowed(format!("'{value}''...")));
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = start;
                while let Some(&(i, ch)) = it.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        end = i + ch.len_utf8();
                        it.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(src[start..end].to_string()));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                if c == '-' {
                    text.push('-');
                    it.next();
                    match it.peek() {
                        Some(&(_, d)) if d.is_ascii_digit() => {}
                        _ => return Err(NotAllowed::ValueNotAllowed(text)),
                    }
                }
                while let Some(&(_, d)) = it.peek() {
                    if d.is_ascii_digit() {
                        text.push(d);
                        it.next();
                    } else {
                        break;
                    }
                }
                let mut is_float = false;
                if matches!(it.peek(), Some(&(_, '.'))) {
                    is_float = true;
                    text.push('.');
                    it.next();
                    let mut fraction_digits = 0;
                    while let Some(&(_, d)) = it.peek() {
                        if d.is_ascii_digit() {
                            text.push(d);
                            fraction_digits += 1;
                            it.next();
                        } else {
                            break;
                        }
                    }
                    if fraction_digits == 0 {
                        return Err(NotAllowed::ValueNotAllowed(text));
                    }
                }
                if is_float {
                    let v: f64 = text
                        .parse()
                        .map_err(|_| NotAllowed::ValueNotAllowed(text.clone()))?;
                    tokens.push(Token::Float(v));
                } else {
                    let v: i64 = text
                        .parse()
                        .map_err(|_| NotAllowed::ValueNotAllowed(text.clone()))?;
                    tokens.push(Token::Int(v));
                }
            }
            _ => return Err(NotAllowed::UnsupportedShape),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), NotAllowed> {
        match self.next() {
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword) => Ok(()),
            _ => Err(NotAllowed::UnsupportedShape),
        }
    }

    fn expect_ident(&mut self) -> Result<String, NotAllowed> {
        match self.next() {
            Some(Token::Ident(word)) => Ok(word),
            _ => Err(NotAllowed::UnsupportedShape),
        }
    }

    fn allowlisted_column(&self, name: &str) -> Result<String, NotAllowed> {
        if name.eq_ignore_ascii_case("or") {
            return Err(NotAllowed::OrNotAllowed);
        }
        schema::canonical_column(name)
            .map(str::to_string)
            .ok_or_else(|| NotAllowed::ColumnNotAllowed(name.to_string()))
    }

    fn parse_predicate(&mut self) -> Result<Filter, NotAllowed> {
        let ident = self.expect_ident()?;
        let column = self.allowlisted_column(&ident)?;

        let op = match self.next() {
            Some(Token::Op(op)) => op,
            _ => return Err(NotAllowed::UnsupportedShape),
        };

        let value = match self.next() {
            Some(Token::Int(v)) => Literal::Int(v),
            Some(Token::Float(v)) => Literal::Float(v),
            Some(Token::Str(v)) => Literal::Str(v),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("or") => {
                return Err(NotAllowed::OrNotAllowed)
            }
            Some(Token::Ident(word)) => return Err(NotAllowed::ValueNotAllowed(word)),
            _ => return Err(NotAllowed::UnsupportedShape),
        };

        Ok(Filter { column, op, value })
    }

    fn parse_query(&mut self) -> Result<ParsedQuery, NotAllowed> {
        self.expect_keyword("select")?;

        let agg_word = self.expect_ident()?;
        match self.next() {
            Some(Token::LParen) => {}
            _ => return Err(NotAllowed::UnsupportedShape),
        }
        let agg_fn = AggFn::from_keyword(&agg_word)
            .ok_or(NotAllowed::AggregateNotAllowed(agg_word))?;

        let agg_target = match self.next() {
            Some(Token::Star) => {
                if agg_fn != AggFn::Count {
                    return Err(NotAllowed::StarRequiresCount);
                }
                AggTarget::Star
            }
            Some(Token::Ident(name)) => AggTarget::Column(self.allowlisted_column(&name)?),
            _ => return Err(NotAllowed::UnsupportedShape),
        };

        match self.next() {
            Some(Token::RParen) => {}
            _ => return Err(NotAllowed::UnsupportedShape),
        }

        self.expect_keyword("from")?;

        let table = self.expect_ident()?;
        if !table.eq_ignore_ascii_case(TABLE_NAME) {
            return Err(NotAllowed::TableNotAllowed(table));
        }

        let mut filters = Vec::new();
        if self.peek().is_some() {
            self.expect_keyword("where")?;
            loop {
                filters.push(self.parse_predicate()?);
                match self.next() {
                    None => break,
                    Some(Token::Ident(word)) if word.eq_ignore_ascii_case("and") => {}
                    Some(Token::Ident(word)) if word.eq_ignore_ascii_case("or") => {
                        return Err(NotAllowed::OrNotAllowed)
                    }
                    Some(_) => return Err(NotAllowed::UnsupportedShape),
                }
            }
        }

        Ok(ParsedQuery {
            agg_fn,
            agg_target,
            filters,
        })
    }
}

/// Parse an aggregate query string into its typed form, or reject it.
pub fn parse(sql: &str) -> Result<ParsedQuery, NotAllowed> {
    let canonical = canonicalize(sql)?;
    let tokens = tokenize(&canonical)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_query()
}
