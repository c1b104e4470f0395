//! Parsing of the condition strings found in EXPLAIN output (`Filter`, `Index Cond`, `Hash Cond`
//! and friends) and in the subplan logs.
//!
//! Conditions are first tokenized and parsed into a small syntax tree (`Cond`), which is then
//! resolved against a table into a `BoolExpr` of structured predicates. Anything that does not
//! resolve stays as an opaque `ArbitraryPredicate` so the SQL can still be reproduced.
use crate::pred::{normal_form_predicates, BoolExpr, Dnf, PredAtom, Predicate, Value};
use crate::schema::{
    derived_operator, AttributeId, CompOp, DataType, Schema, Table, TableId, DATETIME_FORMAT,
    DATE_FORMAT,
};
use crate::utils::{self, is_ident_char};
use chrono::{NaiveDate, NaiveDateTime};
use log::debug;
use regex::Regex;
use std::sync::OnceLock;

/// Words that may follow the first word of a multi-word type name in a cast.
const TYPE_CONTINUATIONS: &[&str] = &["varying", "precision", "without", "with", "time", "zone"];

const RESERVED: &[&str] = &[
    "AND", "OR", "NOT", "IS", "LIKE", "ILIKE", "IN", "ANY", "ALL", "NULL",
];

static CAST_WRAPPER: OnceLock<Regex> = OnceLock::new();

/// One side of a join condition such as `mc.movie_id = t.id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinColumn {
    pub alias: Option<String>,
    pub column: String,
}

/// Splits a planner condition into its top-level conjuncts, each wrapped in parentheses.
pub fn split_condition(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return vec![];
    }
    utils::split_top_level(utils::strip_outer_parens(text), " AND ")
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            if utils::is_parenthesized(part) {
                part.to_string()
            } else {
                format!("({})", part)
            }
        })
        .collect()
}

/// Splits a scan filter and prefixes every bare column of `table` with `alias`.
pub fn split_filter(text: &str, alias: &str, table: &Table) -> Vec<String> {
    split_condition(text)
        .iter()
        .map(|part| qualify_columns(part, alias, table))
        .collect()
}

fn cast_end(text: &str, start: usize) -> usize {
    let bytes = text.as_bytes();
    let word_end = |from: usize| {
        let mut end = from;
        while end < bytes.len() && is_ident_char(bytes[end] as char) {
            end += 1;
        }
        end
    };
    let mut end = word_end(start);
    loop {
        if bytes.get(end) != Some(&b' ') {
            break;
        }
        let next = word_end(end + 1);
        if next > end + 1 && TYPE_CONTINUATIONS.contains(&&text[end + 1..next]) {
            end = next;
        } else {
            break;
        }
    }
    if text[end..].starts_with("[]") {
        end += 2;
    }
    end
}

fn quoted_end(text: &str, start: usize) -> usize {
    let bytes = text.as_bytes();
    let quote = bytes[start];
    let mut idx = start + 1;
    while idx < bytes.len() {
        if bytes[idx] == quote {
            if bytes.get(idx + 1) == Some(&quote) {
                idx += 2;
                continue;
            }
            return idx + 1;
        }
        idx += 1;
    }
    bytes.len()
}

/// Applies `rewrite` to every identifier that starts a (possibly dotted) name outside of quotes
/// and cast types. `rewrite` receives the text from the identifier onwards and returns the
/// replacement prefix and the number of bytes it consumed.
fn rewrite_identifiers<F>(text: &str, mut rewrite: F) -> String
where
    F: FnMut(&str) -> Option<(String, usize)>,
{
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len() + 16);
    let mut idx = 0;
    while idx < bytes.len() {
        let byte = bytes[idx];
        if byte == b'\'' || byte == b'"' {
            let end = quoted_end(text, idx);
            out.push_str(&text[idx..end]);
            idx = end;
        } else if text[idx..].starts_with("::") {
            let end = cast_end(text, idx + 2);
            out.push_str(&text[idx..end]);
            idx = end;
        } else if (byte.is_ascii_alphabetic() || byte == b'_')
            && (idx == 0 || !(is_ident_char(bytes[idx - 1] as char) || bytes[idx - 1] == b'.'))
        {
            match rewrite(&text[idx..]) {
                Some((replacement, consumed)) => {
                    out.push_str(&replacement);
                    idx += consumed;
                }
                None => {
                    let mut end = idx;
                    while end < bytes.len() && is_ident_char(bytes[end] as char) {
                        end += 1;
                    }
                    out.push_str(&text[idx..end]);
                    idx = end;
                }
            }
        } else {
            let ch = text[idx..].chars().next().unwrap_or(' ');
            out.push(ch);
            idx += ch.len_utf8();
        }
    }
    out
}

/// Prefixes every unqualified column of `table` with `alias`.
pub fn qualify_columns(text: &str, alias: &str, table: &Table) -> String {
    rewrite_identifiers(text, |rest| {
        let end = rest
            .find(|ch: char| !is_ident_char(ch))
            .unwrap_or(rest.len());
        let word = &rest[..end];
        if rest[end..].starts_with('.') || !table.has_column(word) {
            return None;
        }
        Some((format!("{}.{}", alias, word), end))
    })
}

/// Replaces the qualifier `from.` with `to.`.
pub fn requalify(text: &str, from: &str, to: &str) -> String {
    rewrite_identifiers(text, |rest| {
        let qualifier = rest.strip_prefix(from)?.strip_prefix('.')?;
        qualifier
            .starts_with(|ch: char| is_ident_char(ch))
            .then(|| (format!("{}.", to), from.len() + 1))
    })
}

fn parse_join_column(side: &str) -> Option<JoinColumn> {
    let wrapper = CAST_WRAPPER.get_or_init(|| {
        Regex::new(r"^\(([\w.]+)\)::[\w ]+(?:\[\])?$").expect("cast wrapper pattern is valid")
    });
    let side = side.trim();
    let side = match wrapper.captures(side) {
        Some(captures) => captures.get(1).map_or(side, |m| m.as_str()),
        None => side.split("::").next().unwrap_or(side),
    };
    if side.is_empty()
        || !side.chars().all(|ch| is_ident_char(ch) || ch == '.')
        || side.starts_with(|ch: char| ch.is_ascii_digit())
    {
        return None;
    }
    Some(match side.split_once('.') {
        Some((alias, column)) => JoinColumn {
            alias: Some(alias.to_string()),
            column: column.to_string(),
        },
        None => JoinColumn {
            alias: None,
            column: side.to_string(),
        },
    })
}

/// Parses `(a.x = b.y)` into its two sides. Returns `None` for anything other than a single
/// equality between two columns.
pub fn parse_join_condition(text: &str) -> Option<(JoinColumn, JoinColumn)> {
    let inner = utils::strip_outer_parens(text);
    let sides: Vec<_> = inner.split(" = ").collect();
    if sides.len() != 2 {
        return None;
    }
    Some((parse_join_column(sides[0])?, parse_join_column(sides[1])?))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Word(String),
    Str(String),
    Number(String),
    Op(String),
    Cast(String),
    /// Unparsed contents of the parentheses after ANY or ALL.
    Raw(String),
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Word(word) if word.eq_ignore_ascii_case(keyword))
    }
}

fn tokenize(text: &str) -> Option<Vec<Token>> {
    let bytes = text.as_bytes();
    let mut tokens: Vec<Token> = vec![];
    let mut idx = 0;
    while idx < bytes.len() {
        let byte = bytes[idx];
        match byte {
            _ if byte.is_ascii_whitespace() => idx += 1,
            b'(' => {
                let quantified = tokens
                    .last()
                    .map_or(false, |token| token.is_keyword("ANY") || token.is_keyword("ALL"));
                if quantified {
                    let close = utils::matching_paren(text, idx)?;
                    tokens.push(Token::Raw(text[idx + 1..close].trim().to_string()));
                    idx = close + 1;
                } else {
                    tokens.push(Token::LParen);
                    idx += 1;
                }
            }
            b')' => {
                tokens.push(Token::RParen);
                idx += 1;
            }
            b',' => {
                tokens.push(Token::Comma);
                idx += 1;
            }
            b'\'' | b'"' => {
                let end = quoted_end(text, idx);
                if end < idx + 2 || bytes[end - 1] != byte {
                    return None;
                }
                let quote = byte as char;
                let content = text[idx + 1..end - 1]
                    .replace(&format!("{}{}", quote, quote), &quote.to_string());
                tokens.push(if byte == b'\'' {
                    Token::Str(content)
                } else {
                    Token::Word(content)
                });
                idx = end;
            }
            b':' if bytes.get(idx + 1) == Some(&b':') => {
                let end = cast_end(text, idx + 2);
                if end == idx + 2 {
                    return None;
                }
                tokens.push(Token::Cast(text[idx + 2..end].to_string()));
                idx = end;
            }
            _ if byte.is_ascii_digit()
                || (byte == b'-'
                    && bytes.get(idx + 1).map_or(false, u8::is_ascii_digit)
                    && matches!(
                        tokens.last(),
                        None | Some(Token::Op(_) | Token::LParen | Token::Comma)
                    )) =>
            {
                let mut end = idx + 1;
                while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
                    end += 1;
                }
                tokens.push(Token::Number(text[idx..end].to_string()));
                idx = end;
            }
            _ if byte.is_ascii_alphabetic() || byte == b'_' || byte >= 0x80 => {
                let mut end = idx;
                while end < bytes.len()
                    && (is_ident_char(bytes[end] as char) || bytes[end] == b'.' || bytes[end] >= 0x80)
                {
                    end += 1;
                }
                tokens.push(Token::Word(text[idx..end].to_string()));
                idx = end;
            }
            b'=' | b'<' | b'>' | b'!' | b'~' | b'*' => {
                let mut end = idx;
                while end < bytes.len() && b"=<>!~*".contains(&bytes[end]) {
                    end += 1;
                }
                tokens.push(Token::Op(text[idx..end].to_string()));
                idx = end;
            }
            b'+' | b'-' | b'/' | b'%' | b'|' | b'&' | b'^' | b'#' | b'@' => {
                tokens.push(Token::Op((byte as char).to_string()));
                idx += 1;
            }
            _ => return None,
        }
    }
    Some(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Column(String),
    Literal(String),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
struct Term {
    operand: Operand,
    cast: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Cond {
    And(Vec<Cond>),
    Or(Vec<Cond>),
    Not(Box<Cond>),
    Compare {
        left: Term,
        op: String,
        right: Term,
    },
    NullTest {
        term: Term,
        negated: bool,
    },
    Quantified {
        left: Term,
        op: String,
        all: bool,
        list: String,
    },
    InList {
        term: Term,
        list: Vec<Term>,
        negated: bool,
    },
}

struct CondParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl CondParser {
    fn parse(text: &str) -> Option<Cond> {
        let mut parser = Self {
            tokens: tokenize(text)?,
            pos: 0,
        };
        let cond = parser.parse_or()?;
        (parser.pos == parser.tokens.len()).then_some(cond)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().map_or(false, |token| token.is_keyword(keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Option<Cond> {
        let mut items = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            items.push(self.parse_and()?);
        }
        Some(if items.len() == 1 {
            items.pop()?
        } else {
            Cond::Or(items)
        })
    }

    fn parse_and(&mut self) -> Option<Cond> {
        let mut items = vec![self.parse_unary()?];
        while self.eat_keyword("AND") {
            items.push(self.parse_unary()?);
        }
        Some(if items.len() == 1 {
            items.pop()?
        } else {
            Cond::And(items)
        })
    }

    fn parse_unary(&mut self) -> Option<Cond> {
        if self.eat_keyword("NOT") {
            return Some(Cond::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Option<Cond> {
        if self.peek() == Some(&Token::LParen) {
            let start = self.pos;
            if let Some(cond) = self.parse_comparison() {
                return Some(cond);
            }
            self.pos = start + 1;
            let cond = self.parse_or()?;
            return self.eat(&Token::RParen).then_some(cond);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Option<Cond> {
        let left = self.parse_term()?;
        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            return self
                .eat_keyword("NULL")
                .then_some(Cond::NullTest { term: left, negated });
        }
        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("IN") {
            let list = self.parse_list()?;
            return Some(Cond::InList {
                term: left,
                list,
                negated,
            });
        }
        let op = if self.eat_keyword("LIKE") {
            "~~".to_string()
        } else if self.eat_keyword("ILIKE") {
            "~~*".to_string()
        } else if negated {
            return None;
        } else {
            match self.next()? {
                Token::Op(op) => op,
                _ => return None,
            }
        };
        let op = if negated { format!("!{}", op) } else { op };

        let all = self.peek().map_or(false, |token| token.is_keyword("ALL"));
        if all || self.peek().map_or(false, |token| token.is_keyword("ANY")) {
            self.pos += 1;
            return match self.next()? {
                Token::Raw(list) => Some(Cond::Quantified {
                    left,
                    op,
                    all,
                    list,
                }),
                _ => None,
            };
        }
        let right = self.parse_term()?;
        Some(Cond::Compare { left, op, right })
    }

    fn parse_list(&mut self) -> Option<Vec<Term>> {
        if !self.eat(&Token::LParen) {
            return None;
        }
        let mut list = vec![self.parse_term()?];
        while self.eat(&Token::Comma) {
            list.push(self.parse_term()?);
        }
        self.eat(&Token::RParen).then_some(list)
    }

    fn parse_term(&mut self) -> Option<Term> {
        let mut term = match self.next()? {
            Token::LParen => {
                let inner = self.parse_term()?;
                if !self.eat(&Token::RParen) {
                    return None;
                }
                inner
            }
            Token::Word(word) if word.eq_ignore_ascii_case("NULL") => Term {
                operand: Operand::Null,
                cast: None,
            },
            Token::Word(word) if RESERVED.iter().any(|kw| word.eq_ignore_ascii_case(kw)) => {
                return None
            }
            Token::Word(word) => Term {
                operand: Operand::Column(word),
                cast: None,
            },
            Token::Str(text) | Token::Number(text) => Term {
                operand: Operand::Literal(text),
                cast: None,
            },
            _ => return None,
        };
        while let Some(Token::Cast(cast)) = self.peek() {
            term.cast = Some(cast.clone());
            self.pos += 1;
        }
        Some(term)
    }
}

/// Flips an operator so that `lit OP col` can be read as `col OP' lit`.
fn flip_operator(op: &str) -> Option<&'static str> {
    Some(match op {
        "=" => "=",
        "<>" => "<>",
        "!=" => "!=",
        "<" => ">",
        ">" => "<",
        "<=" => ">=",
        ">=" => "<=",
        _ => return None,
    })
}

/// Splits the body of a Postgres array literal, honoring double-quoted elements.
fn split_array(body: &str) -> Option<Vec<String>> {
    let mut elements = vec![];
    if body.trim().is_empty() {
        return Some(elements);
    }
    let mut chars = body.chars().peekable();
    loop {
        let mut element = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next()? {
                    '\\' => element.push(chars.next()?),
                    '"' => break,
                    ch => element.push(ch),
                }
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch == ',' {
                    break;
                }
                element.push(ch);
                chars.next();
            }
        }
        elements.push(element);
        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(_) => return None,
        }
    }
    Some(elements)
}

struct PredicateResolver<'a> {
    schema: &'a Schema,
    table: TableId,
    alias: &'a str,
    injection_mode: bool,
}

impl<'a> PredicateResolver<'a> {
    fn column(&self, term: &Term) -> Option<AttributeId> {
        let Operand::Column(name) = &term.operand else {
            return None;
        };
        let column = match name.split_once('.') {
            Some((alias, column)) if alias == self.alias => column,
            Some(_) => return None,
            None => name.as_str(),
        };
        self.schema.attribute_by_name(self.table, column)
    }

    fn data_type(&self, attr: AttributeId) -> DataType {
        self.schema.attribute(attr).data_type
    }

    fn value(&self, attr: AttributeId, term: &Term) -> Option<Value> {
        let Operand::Literal(text) = &term.operand else {
            return None;
        };
        let data_type = self.data_type(attr);
        match term.cast.as_deref() {
            Some(
                "numeric" | "bpchar" | "text" | "integer" | "bigint" | "smallint"
                | "character varying" | "double precision",
            ) => data_type.parse_value(text),
            Some("timestamp without time zone") => {
                let datetime = NaiveDateTime::parse_from_str(text, DATETIME_FORMAT).ok()?;
                Some(if data_type == DataType::Date {
                    Value::Date(datetime.date())
                } else {
                    Value::DateTime(datetime)
                })
            }
            Some("date") => NaiveDate::parse_from_str(text, DATE_FORMAT)
                .ok()
                .map(Value::Date),
            Some(cast) => {
                debug!("Unknown cast {} in predicate", cast);
                None
            }
            None if data_type == DataType::Date => {
                NaiveDate::parse_from_str(text.get(..10).unwrap_or(text.as_str()), DATE_FORMAT)
                    .ok()
                    .map(Value::Date)
            }
            None => data_type.parse_value(text),
        }
    }

    fn array_values(&self, attr: AttributeId, list: &str) -> Option<Vec<Value>> {
        let data_type = self.data_type(attr);
        if let Some((options, cast)) = list.rsplit_once("::") {
            let body = options.trim().strip_prefix("'{")?.strip_suffix("}'")?;
            let elements = split_array(body)?;
            match cast.trim() {
                "bpchar[]" | "text[]" | "integer[]" | "bigint[]" | "numeric[]"
                | "character varying[]" => elements
                    .iter()
                    .map(|element| data_type.parse_value(element))
                    .collect(),
                "date[]" => elements
                    .iter()
                    .map(|element| {
                        NaiveDate::parse_from_str(element, DATE_FORMAT)
                            .ok()
                            .map(Value::Date)
                    })
                    .collect(),
                cast => {
                    debug!("Unknown array cast {}", cast);
                    None
                }
            }
        } else if self.injection_mode {
            let options: Vec<_> = utils::split_top_level(list, ",")
                .into_iter()
                .map(str::trim)
                .collect();
            let quoted = |option: &str| option.len() >= 2 && option.starts_with('\'') && option.ends_with('\'');
            let all_quoted = options.iter().all(|option| quoted(option));
            if !all_quoted && options.iter().any(|option| quoted(option)) {
                return None;
            }
            options
                .iter()
                .map(|option| {
                    let option = if all_quoted {
                        option[1..option.len() - 1].replace("''", "'")
                    } else {
                        option.to_string()
                    };
                    if data_type == DataType::Date {
                        NaiveDate::parse_from_str(&option, DATE_FORMAT)
                            .ok()
                            .map(Value::Date)
                    } else {
                        data_type.parse_value(&option)
                    }
                })
                .collect()
        } else {
            None
        }
    }

    fn predicate(&self, attr: AttributeId, op: CompOp, value: Value, positive: bool) -> Option<BoolExpr> {
        Predicate::new(self.schema, attr, op, value, positive)
            .ok()
            .map(BoolExpr::atom)
    }

    /// `col = v1 OR col = v2 ...`, or its negation.
    fn membership(&self, attr: AttributeId, values: Vec<Value>, positive: bool) -> Option<BoolExpr> {
        if values.is_empty() {
            return None;
        }
        let atoms = values
            .into_iter()
            .map(|value| self.predicate(attr, CompOp::Eq, value, positive))
            .collect::<Option<Vec<_>>>()?;
        Some(if positive {
            BoolExpr::Or(atoms)
        } else {
            BoolExpr::And(atoms)
        })
    }

    fn resolve(&self, cond: &Cond) -> Option<BoolExpr> {
        match cond {
            Cond::And(items) => Some(BoolExpr::And(
                items.iter().map(|item| self.resolve(item)).collect::<Option<_>>()?,
            )),
            Cond::Or(items) => Some(BoolExpr::Or(
                items.iter().map(|item| self.resolve(item)).collect::<Option<_>>()?,
            )),
            Cond::Not(inner) => Some(self.resolve(inner)?.negate()),
            Cond::NullTest { term, negated } => {
                self.predicate(self.column(term)?, CompOp::Is, Value::Null, !negated)
            }
            Cond::Compare { left, op, right } => {
                let (attr, op, literal) = match (self.column(left), self.column(right)) {
                    (Some(attr), None) => (attr, op.as_str(), right),
                    (None, Some(attr)) => (attr, flip_operator(op)?, left),
                    _ => return None,
                };
                let (op, positive) = derived_operator(op)?;
                let value = self.value(attr, literal)?;
                self.predicate(attr, op, value, positive)
            }
            Cond::Quantified { left, op, all, list } => {
                let attr = self.column(left)?;
                let positive = match (op.as_str(), *all) {
                    ("=", false) => true,
                    ("<>" | "!=", true) => false,
                    _ => return None,
                };
                self.membership(attr, self.array_values(attr, list)?, positive)
            }
            Cond::InList {
                term,
                list,
                negated,
            } => {
                let attr = self.column(term)?;
                let values = list
                    .iter()
                    .map(|item| self.value(attr, item))
                    .collect::<Option<Vec<_>>>()?;
                self.membership(attr, values, !negated)
            }
        }
    }
}

/// Turns condition text on the table aliased `alias` into structured predicates. Returns `None`
/// if any part of it cannot be expressed that way.
pub fn parse_arbitrary_predicate(
    schema: &Schema,
    table: TableId,
    alias: &str,
    text: &str,
    injection_mode: bool,
) -> Option<BoolExpr> {
    let cond = CondParser::parse(text)?;
    PredicateResolver {
        schema,
        table,
        alias,
        injection_mode,
    }
    .resolve(&cond)
}

/// Parses a conjunction of condition texts. Conjuncts that do not parse are kept verbatim.
pub fn parse_arbitrary_predicates<S: AsRef<str>>(
    schema: &Schema,
    table: TableId,
    alias: &str,
    predicates: &[S],
    injection_mode: bool,
) -> Dnf {
    let conjunction = predicates
        .iter()
        .map(|text| {
            let text = text.as_ref();
            parse_arbitrary_predicate(schema, table, alias, text, injection_mode).unwrap_or_else(
                || {
                    debug!("Keeping {} as an arbitrary predicate", text);
                    BoolExpr::atom(PredAtom::arbitrary(text))
                },
            )
        })
        .collect();
    normal_form_predicates(BoolExpr::And(conjunction))
}
