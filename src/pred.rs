/// Contains the structs for predicates attached to table instances. A predicate is either a
/// structured `attribute OP value` comparison or an opaque piece of SQL text that could not be
/// parsed into one.
///
/// Table instances store their predicates as a conjunction of disjunctions (`Dnf`): the outer
/// list is ANDed, every inner list is ORed and never empty. `BoolExpr` is the arbitrary
/// AND/OR/atom tree predicates are parsed into before being normalized into that shape.
use crate::schema::{AttributeId, CompOp, DataType, Schema, DATETIME_FORMAT, DATE_FORMAT};
use chrono::{NaiveDate, NaiveDateTime};
use either::Either;
use itertools::Itertools;
use std::fmt;
use thiserror::Error;
use traversal::DftPre;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PredicateError {
    #[error("operator {op} is not supported by {column} ({data_type})")]
    UnsupportedOperator {
        op: CompOp,
        column: String,
        data_type: DataType,
    },
}

pub type Result<T> = std::result::Result<T, PredicateError>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    attribute: AttributeId,
    column: String,
    data_type: DataType,
    op: CompOp,
    value: Value,
    positive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArbitraryPredicate {
    text: String,
    positive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PredAtom {
    Simple(Predicate),
    Arbitrary(ArbitraryPredicate),
}

/// Conjunction of disjunctions.
pub type Dnf = Vec<Vec<PredAtom>>;

#[derive(Debug, Clone, PartialEq)]
pub enum BoolExpr {
    And(Vec<BoolExpr>),
    Or(Vec<BoolExpr>),
    Atom(PredAtom),
}

impl Value {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }
}

/// Renders a value as a SQL literal.
pub fn wrap_value(value: &Value) -> String {
    value.to_string()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Int(val) => write!(f, "{}", val),
            Self::Float(val) => write!(f, "{:?}", val),
            Self::Str(val) => write!(f, "'{}'", val.replace('\'', "''")),
            Self::Date(val) => write!(f, "'{}'", val.format(DATE_FORMAT)),
            Self::DateTime(val) => write!(f, "'{}'", val.format(DATETIME_FORMAT)),
        }
    }
}

impl Predicate {
    /// Fails if the column's data type does not support `op`.
    pub fn new(
        schema: &Schema,
        attribute: AttributeId,
        op: CompOp,
        value: Value,
        positive: bool,
    ) -> Result<Self> {
        let column = schema.attribute(attribute);
        if !column.data_type.supports(op) {
            return Err(PredicateError::UnsupportedOperator {
                op,
                column: schema.attribute_name(attribute),
                data_type: column.data_type,
            });
        }
        Ok(Self {
            attribute,
            column: column.name.clone(),
            data_type: column.data_type,
            op,
            value,
            positive,
        })
    }

    pub fn attribute(&self) -> AttributeId {
        self.attribute
    }

    pub fn op(&self) -> CompOp {
        self.op
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn positive(&self) -> bool {
        self.positive
    }

    pub fn complement(&self) -> Self {
        Self {
            positive: !self.positive,
            ..self.clone()
        }
    }

    /// Renders the predicate against the table aliased `alias`. A text column compared with a
    /// number is guarded so only numeric-looking values are cast.
    pub fn query_string(&self, alias: &str) -> String {
        let negation = if self.positive { "" } else { "NOT " };
        if self.data_type.is_text() && self.value.is_numeric() {
            format!(
                "({alias}.{col} ~ '^(?:[1-9]\\d*|0)?(?:\\.\\d+)?$' AND {negation}{alias}.{col}::float {op} {value})",
                alias = alias,
                col = self.column,
                negation = negation,
                op = self.op,
                value = wrap_value(&self.value)
            )
        } else {
            format!(
                "{}{}.{} {} {}",
                negation,
                alias,
                self.column,
                self.op,
                wrap_value(&self.value)
            )
        }
    }
}

impl ArbitraryPredicate {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            positive: true,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn positive(&self) -> bool {
        self.positive
    }

    pub fn complement(&self) -> Self {
        Self {
            text: self.text.clone(),
            positive: !self.positive,
        }
    }

    pub fn query_string(&self) -> String {
        if self.positive {
            self.text.clone()
        } else {
            format!("NOT ({})", self.text)
        }
    }
}

impl PredAtom {
    pub fn arbitrary(text: impl Into<String>) -> Self {
        Self::Arbitrary(ArbitraryPredicate::new(text))
    }

    pub fn complement(&self) -> Self {
        match self {
            Self::Simple(pred) => Self::Simple(pred.complement()),
            Self::Arbitrary(pred) => Self::Arbitrary(pred.complement()),
        }
    }

    pub fn query_string(&self, alias: &str) -> String {
        match self {
            Self::Simple(pred) => pred.query_string(alias),
            Self::Arbitrary(pred) => pred.query_string(),
        }
    }

    pub fn is_arbitrary(&self) -> bool {
        matches!(self, Self::Arbitrary(_))
    }
}

impl From<Predicate> for PredAtom {
    fn from(pred: Predicate) -> Self {
        Self::Simple(pred)
    }
}

impl BoolExpr {
    pub fn atom(atom: impl Into<PredAtom>) -> Self {
        Self::Atom(atom.into())
    }

    /// Pushes a negation down to the atoms.
    pub fn negate(self) -> Self {
        match self {
            Self::And(children) => Self::Or(children.into_iter().map(Self::negate).collect()),
            Self::Or(children) => Self::And(children.into_iter().map(Self::negate).collect()),
            Self::Atom(atom) => Self::Atom(atom.complement()),
        }
    }

    fn children(&self) -> impl Iterator<Item = &Self> {
        match self {
            Self::And(children) | Self::Or(children) => Either::Left(children.iter()),
            Self::Atom(_) => Either::Right(std::iter::empty()),
        }
    }

    pub fn iter_atoms(&self) -> impl Iterator<Item = &PredAtom> {
        DftPre::new(self, |expr| expr.children()).filter_map(|(_, expr)| match expr {
            Self::Atom(atom) => Some(atom),
            _ => None,
        })
    }

    /// Rebuilds the tree of an already normalized predicate list.
    pub fn from_dnf(dnf: Dnf) -> Self {
        Self::And(
            dnf.into_iter()
                .map(|disjunction| Self::Or(disjunction.into_iter().map(Self::Atom).collect()))
                .collect(),
        )
    }

    /// Converts the tree into a conjunction of disjunctions by applying the distributive law,
    /// flattening nested ANDs and ORs along the way.
    pub fn into_dnf(self) -> Dnf {
        match self {
            Self::Atom(atom) => vec![vec![atom]],
            Self::And(children) => children.into_iter().flat_map(Self::into_dnf).collect(),
            Self::Or(children) => {
                let mut clauses: Dnf = vec![vec![]];
                for child in children {
                    let child_clauses = child.into_dnf();
                    clauses = clauses
                        .iter()
                        .cartesian_product(child_clauses.iter())
                        .map(|(clause, child_clause)| {
                            clause.iter().chain(child_clause).cloned().collect()
                        })
                        .collect();
                }
                clauses.retain(|clause| !clause.is_empty());
                clauses
            }
        }
    }
}

impl From<PredAtom> for BoolExpr {
    fn from(atom: PredAtom) -> Self {
        Self::Atom(atom)
    }
}

pub fn normal_form_predicates(expr: BoolExpr) -> Dnf {
    expr.into_dnf()
}

/// Renders `(p1 OR p2)\n\tAND p3` for the table aliased `alias`.
pub fn predicates_to_string(alias: &str, predicates: &[Vec<PredAtom>]) -> String {
    predicates
        .iter()
        .map(|disjunction| {
            let joined = disjunction
                .iter()
                .map(|atom| atom.query_string(alias))
                .join(" OR ");
            if disjunction.len() > 1 {
                format!("({})", joined)
            } else {
                joined
            }
        })
        .join("\n\tAND ")
}

impl fmt::Display for BoolExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(children) => write!(f, "({})", children.iter().join(" AND ")),
            Self::Or(children) => write!(f, "({})", children.iter().join(" OR ")),
            Self::Atom(atom) => write!(f, "{}", atom.query_string("_")),
        }
    }
}
