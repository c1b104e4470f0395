//! Turns SQL text into query graphs.
//!
//! Only conjunctive SELECT-FROM-WHERE queries are understood: a FROM list of tables joined by
//! commas, `CROSS JOIN` or `JOIN ... ON`, and a WHERE clause whose conjuncts are either
//! conditions on a single table or equalities between columns of two tables. Equalities are
//! grouped into classes of equal columns; a class becomes foreign-key edges between its tables
//! where a key connects them directly, and a virtual node for the referenced table where several
//! tables only share the key they reference.
use crate::backend::{Backend, BackendError};
use crate::expr;
use crate::query::{NodeId, QueryGraph, TableInstance};
use crate::schema::{AttributeId, ForeignKeyId, Schema, TableId};
use log::{debug, warn};
use sqlparser::ast::{self, visit_expressions};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::{Parser as RawParser, ParserError as RawParseError};
use std::ops::ControlFlow;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid SQL: {0}")]
    Raw(#[from] RawParseError),
    #[error("not a SELECT statement: {0}")]
    NonSelect(String),
    #[error("unknown table: {0}")]
    NoTable(String),
    #[error("unknown alias: {0}")]
    UnknownAlias(String),
    #[error("no table in the query has column {0}")]
    UnknownColumn(String),
    #[error("column {0} is ambiguous")]
    AmbiguousColumn(String),
    #[error("alias {0} is used twice")]
    DuplicateAlias(String),
    #[error("unsupported join: {0}")]
    UnsupportedJoin(String),
    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// A column of a table of the FROM list.
type Slot = (usize, AttributeId);

struct FromTable {
    alias: String,
    table: TableId,
}

pub struct Parser<'a> {
    schema: &'a Schema,
    backend: &'a dyn Backend,
}

impl<'a> Parser<'a> {
    pub fn new(schema: &'a Schema, backend: &'a dyn Backend) -> Self {
        Self { schema, backend }
    }

    /// One query graph per statement.
    pub fn parse(&self, sql: &str) -> Result<Vec<QueryGraph>> {
        let stmts = RawParser::parse_sql(&PostgreSqlDialect {}, sql)?;

        stmts
            .into_iter()
            .map(|stmt| {
                let stmt_str = stmt.to_string();
                let ast::Statement::Query(query) = stmt else {
                    return Err(ParseError::NonSelect(stmt_str));
                };
                let ast::SetExpr::Select(select) = *query.body else {
                    return Err(ParseError::NonSelect(stmt_str));
                };
                let select = *select;

                let mut conjuncts = vec![];
                let tables = self.parse_from(select.from, &mut conjuncts)?;
                if let Some(selection) = select.selection {
                    split_conjuncts(selection, &mut conjuncts);
                }
                self.build_query(&tables, conjuncts)
            })
            .collect()
    }

    /// The tables of the FROM list in order. `ON` conditions are added to `conjuncts`.
    fn parse_from(
        &self,
        from: Vec<ast::TableWithJoins>,
        conjuncts: &mut Vec<ast::Expr>,
    ) -> Result<Vec<FromTable>> {
        let mut tables: Vec<FromTable> = vec![];
        let mut add = |factor: ast::TableFactor| -> Result<()> {
            let table = self.parse_table(factor)?;
            if tables.iter().any(|other| other.alias == table.alias) {
                return Err(ParseError::DuplicateAlias(table.alias));
            }
            tables.push(table);
            Ok(())
        };

        for table in from {
            add(table.relation)?;
            for join in table.joins {
                match join.join_operator {
                    ast::JoinOperator::Inner(ast::JoinConstraint::On(cond)) => {
                        split_conjuncts(cond, conjuncts)
                    }
                    ast::JoinOperator::Inner(ast::JoinConstraint::None)
                    | ast::JoinOperator::CrossJoin => {}
                    other => return Err(ParseError::UnsupportedJoin(format!("{:?}", other))),
                }
                add(join.relation)?;
            }
        }
        if tables.is_empty() {
            return Err(ParseError::NoTable(String::new()));
        }
        Ok(tables)
    }

    fn parse_table(&self, factor: ast::TableFactor) -> Result<FromTable> {
        let (name, alias) = match factor {
            ast::TableFactor::Table { name, alias, .. } => (name, alias),
            other => return Err(ParseError::UnsupportedJoin(other.to_string())),
        };
        let table_name = name
            .0
            .last()
            .map(|ident| ident.value.to_lowercase())
            .unwrap_or_default();
        let table = self
            .schema
            .table_by_name(&table_name)
            .ok_or_else(|| ParseError::NoTable(name.to_string()))?;
        let alias = match alias {
            Some(alias) => alias.name.value.to_lowercase(),
            None => table_name,
        };
        Ok(FromTable { alias, table })
    }

    fn build_query(&self, tables: &[FromTable], conjuncts: Vec<ast::Expr>) -> Result<QueryGraph> {
        let mut predicates: Vec<Vec<String>> = vec![vec![]; tables.len()];
        let mut classes: Vec<Vec<Slot>> = vec![];

        for conjunct in conjuncts {
            if let Some((left, right)) = self.column_equality(tables, &conjunct)? {
                if left.0 != right.0 {
                    add_equality(&mut classes, left, right);
                    continue;
                }
            }

            let mut referenced = self.referenced_tables(tables, &conjunct)?;
            referenced.sort_unstable();
            referenced.dedup();
            match referenced[..] {
                [idx] => predicates[idx].extend(predicate_texts(conjunct)),
                [] => warn!("Dropping condition on no table: {}", conjunct),
                _ => warn!("Dropping condition across tables: {}", conjunct),
            }
        }

        let mut query = QueryGraph::new();
        let mut nodes: Vec<NodeId> = vec![];
        for (from_table, texts) in tables.iter().zip(predicates) {
            let table = self.schema.table(from_table.table);
            let texts: Vec<String> = texts
                .iter()
                .map(|text| expr::qualify_columns(&format!("({})", text), &from_table.alias, table))
                .collect();
            let predicates = expr::parse_arbitrary_predicates(
                self.schema,
                from_table.table,
                &from_table.alias,
                &texts,
                false,
            );
            let instance = TableInstance::build(
                self.schema,
                self.backend,
                from_table.table,
                predicates,
                &from_table.alias,
            )?;
            nodes.push(query.add_node_with_alias(instance, from_table.alias.clone()));
        }

        for class in classes {
            self.join_class(tables, &nodes, class, &mut query)?;
        }
        debug!(
            "Parsed query over {} tables with {} joins",
            query.node_count(),
            query.edge_count()
        );
        Ok(query)
    }

    /// Adds the joins of one class of equal columns. Every column with a foreign key into
    /// another column of the class is joined to it directly. The columns left over must all
    /// reference the same key, which then becomes a virtual node.
    fn join_class(
        &self,
        tables: &[FromTable],
        nodes: &[NodeId],
        class: Vec<Slot>,
        query: &mut QueryGraph,
    ) -> Result<()> {
        let mut remaining = class.clone();
        for slot in &class {
            let target = remaining.iter().copied().find(|other| {
                other != slot && self.schema.find_foreign_key(slot.1, other.1).is_some()
            });
            if let Some(target) = target {
                if let Some(foreign_key) = self.schema.find_foreign_key(slot.1, target.1) {
                    query.add_edge(nodes[slot.0], foreign_key, nodes[target.0]);
                    remaining.retain(|other| other != slot);
                }
            }
        }
        if remaining.len() < 2 {
            return Ok(());
        }

        let mut shared: Vec<(Slot, ForeignKeyId)> = vec![];
        for slot in remaining {
            let describe = || {
                format!(
                    "{}.{}",
                    tables[slot.0].alias,
                    self.schema.attribute(slot.1).name
                )
            };
            let [foreign_key] = self.schema.foreign_keys_from_column(slot.1)[..] else {
                return Err(ParseError::UnsupportedJoin(format!(
                    "{} is not a single foreign key",
                    describe()
                )));
            };
            if let Some((_, first)) = shared.first() {
                if self.schema.foreign_key(*first).to != self.schema.foreign_key(foreign_key).to {
                    return Err(ParseError::UnsupportedJoin(format!(
                        "{} references a different table",
                        describe()
                    )));
                }
            }
            shared.push((slot, foreign_key));
        }

        let referenced = self.schema.foreign_key(shared[0].1).to;
        let virtual_node = query.add_node(TableInstance::new_virtual(self.schema, referenced));
        for (slot, foreign_key) in shared {
            query.add_edge(nodes[slot.0], foreign_key, virtual_node);
        }
        Ok(())
    }

    /// `a.x = b.y` as two slots.
    fn column_equality(
        &self,
        tables: &[FromTable],
        conjunct: &ast::Expr,
    ) -> Result<Option<(Slot, Slot)>> {
        let ast::Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } = strip_nesting(conjunct)
        else {
            return Ok(None);
        };
        match (
            self.column_slot(tables, strip_nesting(left))?,
            self.column_slot(tables, strip_nesting(right))?,
        ) {
            (Some(left), Some(right)) => Ok(Some((left, right))),
            _ => Ok(None),
        }
    }

    fn column_slot(&self, tables: &[FromTable], expr: &ast::Expr) -> Result<Option<Slot>> {
        let (alias, column) = match expr {
            ast::Expr::Identifier(ident) => (None, ident.value.to_lowercase()),
            ast::Expr::CompoundIdentifier(idents) => match &idents[..] {
                [alias, column] => (
                    Some(alias.value.to_lowercase()),
                    column.value.to_lowercase(),
                ),
                _ => return Err(ParseError::UnknownColumn(expr.to_string())),
            },
            _ => return Ok(None),
        };
        let idx = match alias {
            Some(alias) => tables
                .iter()
                .position(|table| table.alias == alias)
                .ok_or(ParseError::UnknownAlias(alias))?,
            None => {
                let mut owners = tables.iter().enumerate().filter(|(_, table)| {
                    self.schema.table(table.table).has_column(&column)
                });
                match (owners.next(), owners.next()) {
                    (Some((idx, _)), None) => idx,
                    (None, _) => return Err(ParseError::UnknownColumn(column)),
                    (Some(_), Some(_)) => return Err(ParseError::AmbiguousColumn(column)),
                }
            }
        };
        let attribute = self
            .schema
            .attribute_by_name(tables[idx].table, &column)
            .ok_or_else(|| {
                ParseError::UnknownColumn(format!("{}.{}", tables[idx].alias, column))
            })?;
        Ok(Some((idx, attribute)))
    }

    /// Positions of the tables whose columns `conjunct` refers to.
    fn referenced_tables(&self, tables: &[FromTable], conjunct: &ast::Expr) -> Result<Vec<usize>> {
        let mut referenced = vec![];
        let flow = visit_expressions(conjunct, |expr| match self.column_slot(tables, expr) {
            Ok(Some((idx, _))) => {
                referenced.push(idx);
                ControlFlow::Continue(())
            }
            Ok(None) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err),
        });
        match flow {
            ControlFlow::Break(err) => Err(err),
            ControlFlow::Continue(()) => Ok(referenced),
        }
    }
}

fn split_conjuncts(expr: ast::Expr, conjuncts: &mut Vec<ast::Expr>) {
    match expr {
        ast::Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            split_conjuncts(*left, conjuncts);
            split_conjuncts(*right, conjuncts);
        }
        ast::Expr::Nested(inner)
            if matches!(
                *inner,
                ast::Expr::BinaryOp {
                    op: ast::BinaryOperator::And,
                    ..
                }
            ) =>
        {
            split_conjuncts(*inner, conjuncts)
        }
        other => conjuncts.push(other),
    }
}

fn strip_nesting(mut expr: &ast::Expr) -> &ast::Expr {
    while let ast::Expr::Nested(inner) = expr {
        expr = inner;
    }
    expr
}

/// Condition texts of a single-table conjunct. `BETWEEN` becomes two bounds, `NOT BETWEEN` the
/// disjunction of the two strict comparisons.
fn predicate_texts(conjunct: ast::Expr) -> Vec<String> {
    match conjunct {
        ast::Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } => vec![
            format!("{} >= {}", expr, low),
            format!("{} <= {}", expr, high),
        ],
        ast::Expr::Between {
            expr,
            negated: true,
            low,
            high,
        } => vec![format!("{} < {} OR {} > {}", expr, low, expr, high)],
        other => vec![other.to_string()],
    }
}

/// Merges the classes of `left` and `right`, keeping classes in order of first appearance.
fn add_equality(classes: &mut Vec<Vec<Slot>>, left: Slot, right: Slot) {
    let find = |classes: &Vec<Vec<Slot>>, slot: Slot| classes.iter().position(|c| c.contains(&slot));
    match (find(classes, left), find(classes, right)) {
        (Some(l), Some(r)) if l == r => {}
        (Some(l), Some(r)) => {
            let (keep, merge) = (l.min(r), l.max(r));
            let merged = classes.remove(merge);
            classes[keep].extend(merged);
        }
        (Some(l), None) => classes[l].push(right),
        (None, Some(r)) => classes[r].push(left),
        (None, None) => classes.push(vec![left, right]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pred::PredAtom;
    use crate::test_utils::{fk, imdb_schema, ScriptedBackend};
    use pretty_assertions::assert_eq;

    fn parse_one(schema: &Schema, backend: &ScriptedBackend, sql: &str) -> QueryGraph {
        let mut parsed = Parser::new(schema, backend).parse(sql).unwrap();
        assert_eq!(parsed.len(), 1);
        parsed.remove(0)
    }

    fn edges(query: &QueryGraph) -> Vec<(String, ForeignKeyId, String)> {
        query
            .edges()
            .map(|(_, edge)| {
                (
                    query.alias(edge.from).to_string(),
                    edge.join.foreign_key,
                    query.alias(edge.to).to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn test_comma_join() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new().with_rows("production_year", 50.0);
        let query = parse_one(
            &schema,
            &backend,
            "SELECT COUNT(*) FROM title t, movie_companies AS mc \
             WHERE t.id = mc.movie_id AND t.production_year > 2000 \
             AND mc.note LIKE '%co-production%'",
        );
        assert_eq!(query.node_count(), 2);
        assert_eq!(
            edges(&query),
            vec![(
                "mc".to_string(),
                fk(&schema, "movie_companies_movie_id_fkey"),
                "t".to_string()
            )]
        );
        let t = query.node(query.node_by_alias("t").unwrap());
        assert_eq!(t.cardinality(), 50.0);
        assert_eq!(t.predicates().len(), 1);
        assert!(matches!(t.predicates()[0][0], PredAtom::Simple(_)));
        let mc = query.node(query.node_by_alias("mc").unwrap());
        assert_eq!(mc.predicates().len(), 1);
    }

    #[test]
    fn test_shared_key_becomes_virtual_node() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new();
        let query = parse_one(
            &schema,
            &backend,
            "SELECT * FROM movie_companies mc, movie_keyword mk WHERE mc.movie_id = mk.movie_id",
        );
        assert_eq!(query.node_count(), 3);
        let title = query
            .nodes()
            .find(|&node| query.node(node).is_virtual())
            .unwrap();
        let title = query.alias(title).to_string();
        assert_eq!(
            edges(&query),
            vec![
                (
                    "mc".to_string(),
                    fk(&schema, "movie_companies_movie_id_fkey"),
                    title.clone()
                ),
                (
                    "mk".to_string(),
                    fk(&schema, "movie_keyword_movie_id_fkey"),
                    title
                ),
            ]
        );
        assert_eq!(backend.calls().len(), 0);
    }

    #[test]
    fn test_join_on_and_between() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new();
        let query = parse_one(
            &schema,
            &backend,
            "SELECT * FROM movie_info AS mi JOIN movie_companies AS mc ON mi.movie_id = mc.movie_id \
             JOIN title AS t ON mc.movie_id = t.id \
             WHERE t.production_year BETWEEN 1990 AND 2000 \
             AND mi.info_type_id NOT BETWEEN 3 AND 5",
        );
        assert_eq!(
            edges(&query),
            vec![
                (
                    "mi".to_string(),
                    fk(&schema, "movie_info_movie_id_fkey"),
                    "t".to_string()
                ),
                (
                    "mc".to_string(),
                    fk(&schema, "movie_companies_movie_id_fkey"),
                    "t".to_string()
                ),
            ]
        );
        let t = query.node(query.node_by_alias("t").unwrap());
        assert_eq!(t.predicates().len(), 2);
        let mi = query.node(query.node_by_alias("mi").unwrap());
        assert_eq!(mi.predicates().len(), 1);
        assert_eq!(mi.predicates()[0].len(), 2);
    }

    #[test]
    fn test_unqualified_columns() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new();
        let query = parse_one(
            &schema,
            &backend,
            "SELECT * FROM title t CROSS JOIN kind_type kt WHERE kind_id = kt.id AND production_year = 2001",
        );
        assert_eq!(
            edges(&query),
            vec![(
                "t".to_string(),
                fk(&schema, "title_kind_id_fkey"),
                "kt".to_string()
            )]
        );
        assert_eq!(
            query.node(query.node_by_alias("t").unwrap()).predicates().len(),
            1
        );

        let err = Parser::new(&schema, &backend)
            .parse("SELECT * FROM title t, kind_type kt WHERE id = 1")
            .unwrap_err();
        assert!(matches!(err, ParseError::AmbiguousColumn(column) if column == "id"));
    }

    #[test]
    fn test_errors() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new();
        let parser = Parser::new(&schema, &backend);
        assert!(matches!(
            parser.parse("UPDATE title SET kind_id = 1"),
            Err(ParseError::NonSelect(_))
        ));
        assert!(matches!(
            parser.parse("SELECT * FROM nope"),
            Err(ParseError::NoTable(_))
        ));
        assert!(matches!(
            parser.parse("SELECT * FROM title t WHERE x.id = 1"),
            Err(ParseError::UnknownAlias(alias)) if alias == "x"
        ));
        assert!(matches!(
            parser.parse("SELECT * FROM title t LEFT JOIN movie_companies mc ON mc.movie_id = t.id"),
            Err(ParseError::UnsupportedJoin(_))
        ));
        assert!(matches!(
            parser.parse("SELECT * FROM title t, title t"),
            Err(ParseError::DuplicateAlias(alias)) if alias == "t"
        ));
        assert!(matches!(parser.parse("SELEC 1"), Err(ParseError::Raw(_))));
    }

    #[test]
    fn test_multiple_statements() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new();
        let parsed = Parser::new(&schema, &backend)
            .parse("SELECT * FROM title; SELECT * FROM keyword k WHERE k.keyword = 'love';")
            .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].alias(parsed[0].nodes().next().unwrap()), "title");
        assert_eq!(parsed[1].node_count(), 1);
    }
}
