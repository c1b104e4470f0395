use crate::pred::Value;
use chrono::{NaiveDate, NaiveDateTime};
use phf::phf_map;

/// Column types the planner reports, collapsed to the classes predicates care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DataType {
    Integer,
    Numeric,
    Text,
    Date,
    DateTime,
}

/// Comparison operators a `Predicate` can carry. Everything else the planner prints is expressed
/// through one of these plus a negation flag (see `derived_operator`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString,
)]
pub enum CompOp {
    #[strum(to_string = "=")]
    Eq,
    #[strum(to_string = "<")]
    Lt,
    #[strum(to_string = ">")]
    Gt,
    #[strum(to_string = "LIKE")]
    Like,
    #[strum(to_string = "ILIKE")]
    ILike,
    #[strum(to_string = "IS")]
    Is,
}

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static DATA_TYPES: phf::Map<&'static str, DataType> = phf_map! {
    "integer" => DataType::Integer,
    "bigint" => DataType::Integer,
    "smallint" => DataType::Integer,
    "Long" => DataType::Integer,
    "numeric" => DataType::Numeric,
    "double precision" => DataType::Numeric,
    "real" => DataType::Numeric,
    "character" => DataType::Text,
    "character varying" => DataType::Text,
    "text" => DataType::Text,
    "String" => DataType::Text,
    "date" => DataType::Date,
    "Date" => DataType::Date,
    "datetime" => DataType::DateTime,
    "DateTime" => DataType::DateTime,
    "timestamp without time zone" => DataType::DateTime,
};

static DERIVED_OPERATORS: phf::Map<&'static str, (CompOp, bool)> = phf_map! {
    "=" => (CompOp::Eq, true),
    "<>" => (CompOp::Eq, false),
    "!=" => (CompOp::Eq, false),
    "<" => (CompOp::Lt, true),
    ">=" => (CompOp::Lt, false),
    ">" => (CompOp::Gt, true),
    "<=" => (CompOp::Gt, false),
    "LIKE" => (CompOp::Like, true),
    "~~" => (CompOp::Like, true),
    "!~~" => (CompOp::Like, false),
    "ILIKE" => (CompOp::ILike, true),
    "~~*" => (CompOp::ILike, true),
    "!~~*" => (CompOp::ILike, false),
    "IS" => (CompOp::Is, true),
};

const ORDERED_OPERATORS: &[CompOp] = &[CompOp::Eq, CompOp::Lt, CompOp::Gt, CompOp::Is];
const STRING_OPERATORS: &[CompOp] = &[
    CompOp::Eq,
    CompOp::Lt,
    CompOp::Gt,
    CompOp::Like,
    CompOp::ILike,
    CompOp::Is,
];

/// Maps an operator symbol as printed by the planner to the base operator and whether the
/// comparison is positive. `>=` for instance is `NOT <`.
pub fn derived_operator(symbol: &str) -> Option<(CompOp, bool)> {
    DERIVED_OPERATORS.get(symbol).copied()
}

impl DataType {
    pub fn from_sql_name(name: &str) -> Option<Self> {
        DATA_TYPES.get(name).copied()
    }

    pub fn operators(&self) -> &'static [CompOp] {
        match self {
            Self::Text => STRING_OPERATORS,
            _ => ORDERED_OPERATORS,
        }
    }

    pub fn supports(&self, op: CompOp) -> bool {
        self.operators().contains(&op)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text)
    }

    /// Converts unquoted literal text into a value of this type. Returns `None` when the text
    /// does not parse.
    pub fn parse_value(&self, text: &str) -> Option<Value> {
        match self {
            Self::Integer => text.trim().parse().ok().map(Value::Int),
            Self::Numeric => text.trim().parse().ok().map(Value::Float),
            Self::Text => Some(Value::Str(text.to_string())),
            Self::Date => NaiveDate::parse_from_str(text.trim(), DATE_FORMAT)
                .ok()
                .map(Value::Date),
            Self::DateTime => NaiveDateTime::parse_from_str(text.trim(), DATETIME_FORMAT)
                .ok()
                .map(Value::DateTime),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_sql_names() {
        assert_eq!(
            DataType::from_sql_name("character varying"),
            Some(DataType::Text)
        );
        assert_eq!(
            DataType::from_sql_name("timestamp without time zone"),
            Some(DataType::DateTime)
        );
        assert_eq!(DataType::from_sql_name("smallint"), Some(DataType::Integer));
        assert_eq!(DataType::from_sql_name("jsonb"), None);
    }

    #[test]
    fn test_operators() {
        assert!(DataType::Text.supports(CompOp::Like));
        assert!(!DataType::Integer.supports(CompOp::ILike));
        assert!(DataType::Date.supports(CompOp::Is));
        assert_eq!(derived_operator(">="), Some((CompOp::Lt, false)));
        assert_eq!(derived_operator("!~~"), Some((CompOp::Like, false)));
        assert_eq!(derived_operator("~"), None);
        assert_eq!(CompOp::from_str("ILIKE").unwrap(), CompOp::ILike);
        assert_eq!(CompOp::Gt.to_string(), ">");
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(DataType::Integer.parse_value("42"), Some(Value::Int(42)));
        assert_eq!(DataType::Integer.parse_value("4.2"), None);
        assert_eq!(DataType::Numeric.parse_value("4.5"), Some(Value::Float(4.5)));
        assert_eq!(
            DataType::Date.parse_value("2001-02-03"),
            Some(Value::Date(NaiveDate::from_ymd_opt(2001, 2, 3).unwrap()))
        );
        assert_eq!(DataType::Date.parse_value("yesterday"), None);
    }
}
