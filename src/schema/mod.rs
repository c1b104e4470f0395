//! Tables, columns and foreign keys of the database together with the column equivalence classes
//! the foreign keys induce.
//!
//! Two columns are in the same equivalence class if some chain of foreign keys forces them to be
//! equal when all of the keys are joined. For each such pair the schema also stores the chain
//! itself (`Schema::equivalence_connection`) so a join between the two columns can be rewritten
//! into real foreign-key joins, with the tables in between inserted as virtual nodes.
mod data_type;
mod spec;

pub use data_type::{derived_operator, CompOp, DataType, DATETIME_FORMAT, DATE_FORMAT};
pub use spec::{ColumnSpec, ForeignKeySpec, SchemaSpec, TableSpec};

use crate::pred::Value;
use log::debug;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid schema description: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown data type {data_type} for column {table}.{column}")]
    UnknownDataType {
        table: String,
        column: String,
        data_type: String,
    },
    #[error("table {0} is defined more than once")]
    DuplicateTable(String),
    #[error("unknown table {0}")]
    NoTable(String),
    #[error("unknown column {table}.{column}")]
    NoColumn { table: String, column: String },
    #[error("foreign key {0} has mismatched column lists")]
    MalformedForeignKey(String),
}

pub type Result<T> = std::result::Result<T, SchemaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId {
    pub table: TableId,
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignKeyId(pub usize);

#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    cardinality: f64,
    is_leaf: bool,
    columns: Vec<Column>,
    key_columns: Vec<usize>,
    indexes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub indexed: bool,
    pub nullable: bool,
    pub null_ratio: f64,
    /// Observed bounds, only kept for numeric and date columns.
    pub min: Option<Value>,
    pub max: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub name: String,
    pub from: TableId,
    pub to: TableId,
    /// (referencing column, referenced column) pairs, in key order.
    pub pairs: Vec<(AttributeId, AttributeId)>,
}

/// One element of an equivalence connection. A walk alternates joins and the intermediate tables
/// the joins pass through; `natural` is true when the join is traversed from the referencing
/// table towards the referenced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStep {
    Table(TableId),
    Join { fk: ForeignKeyId, natural: bool },
}

#[derive(Debug)]
pub struct Schema {
    name: String,
    tables: Vec<Table>,
    foreign_keys: Vec<ForeignKey>,
    table_index: FxHashMap<String, TableId>,
    edges_from: Vec<Vec<ForeignKeyId>>,
    index_to_table: FxHashMap<String, TableId>,
    equivalence_classes: FxHashMap<AttributeId, BTreeSet<AttributeId>>,
    connections: FxHashMap<(AttributeId, AttributeId), Vec<ConnectionStep>>,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Row count of the whole table.
    pub fn cardinality(&self) -> f64 {
        self.cardinality
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &Column> {
        self.key_columns.iter().map(|&idx| &self.columns[idx])
    }

    pub fn indexes(&self) -> &[String] {
        &self.indexes
    }
}

impl Schema {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_spec(serde_json::from_str(text)?)
    }

    pub fn from_spec(spec: SchemaSpec) -> Result<Self> {
        let mut tables = Vec::with_capacity(spec.tables.len());
        let mut table_index = FxHashMap::default();
        for table_spec in spec.tables {
            if table_index.contains_key(&table_spec.name) {
                return Err(SchemaError::DuplicateTable(table_spec.name));
            }
            table_index.insert(table_spec.name.clone(), TableId(tables.len()));
            tables.push(Self::build_table(table_spec)?);
        }

        let lookup = |table: &str, column: &str| -> Result<AttributeId> {
            let table_id = *table_index
                .get(table)
                .ok_or_else(|| SchemaError::NoTable(table.to_string()))?;
            let column_idx = tables[table_id.0].column_index(column).ok_or_else(|| {
                SchemaError::NoColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                }
            })?;
            Ok(AttributeId {
                table: table_id,
                column: column_idx,
            })
        };

        let mut foreign_keys = Vec::with_capacity(spec.foreign_keys.len());
        for fk_spec in spec.foreign_keys {
            if fk_spec.from_columns.len() != fk_spec.to_columns.len()
                || fk_spec.from_columns.is_empty()
            {
                return Err(SchemaError::MalformedForeignKey(fk_spec.name));
            }
            let pairs = fk_spec
                .from_columns
                .iter()
                .zip(&fk_spec.to_columns)
                .map(|(from, to)| {
                    Ok((
                        lookup(&fk_spec.from_table, from)?,
                        lookup(&fk_spec.to_table, to)?,
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            foreign_keys.push(ForeignKey {
                name: fk_spec.name,
                from: pairs[0].0.table,
                to: pairs[0].1.table,
                pairs,
            });
        }

        Ok(Self::new(spec.name, tables, foreign_keys))
    }

    fn build_table(spec: TableSpec) -> Result<Table> {
        let columns = spec
            .columns
            .into_iter()
            .map(|col| {
                let data_type = DataType::from_sql_name(&col.data_type).ok_or_else(|| {
                    SchemaError::UnknownDataType {
                        table: spec.name.clone(),
                        column: col.name.clone(),
                        data_type: col.data_type.clone(),
                    }
                })?;
                let bound = |text: Option<String>| {
                    text.filter(|_| !data_type.is_text())
                        .and_then(|text| data_type.parse_value(&text))
                };
                Ok(Column {
                    min: bound(col.min),
                    max: bound(col.max),
                    name: col.name,
                    data_type,
                    indexed: col.indexed,
                    nullable: col.nullable,
                    null_ratio: col.null_ratio,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let key_columns = spec
            .key_columns
            .iter()
            .map(|key| {
                columns
                    .iter()
                    .position(|col| &col.name == key)
                    .ok_or_else(|| SchemaError::NoColumn {
                        table: spec.name.clone(),
                        column: key.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Table {
            name: spec.name,
            cardinality: spec.cardinality,
            is_leaf: spec.is_leaf,
            columns,
            key_columns,
            indexes: spec.indexes,
        })
    }

    /// Builds the schema and eagerly computes equivalence classes and connections.
    pub fn new(name: String, tables: Vec<Table>, foreign_keys: Vec<ForeignKey>) -> Self {
        let table_index = tables
            .iter()
            .enumerate()
            .map(|(idx, table)| (table.name.clone(), TableId(idx)))
            .collect();

        let mut edges_from = vec![vec![]; tables.len()];
        for (idx, fk) in foreign_keys.iter().enumerate() {
            edges_from[fk.from.0].push(ForeignKeyId(idx));
        }

        let index_to_table = tables
            .iter()
            .enumerate()
            .flat_map(|(idx, table)| {
                table
                    .indexes
                    .iter()
                    .map(move |index| (index.clone(), TableId(idx)))
            })
            .collect();

        let mut schema = Self {
            name,
            tables,
            foreign_keys,
            table_index,
            edges_from,
            index_to_table,
            equivalence_classes: FxHashMap::default(),
            connections: FxHashMap::default(),
        };
        schema.compute_equivalences();
        schema
    }

    fn compute_equivalences(&mut self) {
        for (table_idx, table) in self.tables.iter().enumerate() {
            for column in 0..table.columns.len() {
                let attr = AttributeId {
                    table: TableId(table_idx),
                    column,
                };
                self.equivalence_classes
                    .insert(attr, BTreeSet::from_iter([attr]));
            }
        }

        let foreign_keys = std::mem::take(&mut self.foreign_keys);
        for (fk_idx, fk) in foreign_keys.iter().enumerate() {
            let fk_id = ForeignKeyId(fk_idx);
            for &(fk_attr, pk_attr) in &fk.pairs {
                let fk_class = self.equivalence_classes[&fk_attr].clone();
                let pk_class = self.equivalence_classes[&pk_attr].clone();
                for &fk_equ in &fk_class {
                    let mut fk_seq = if fk_equ == fk_attr {
                        vec![]
                    } else {
                        let mut seq = self.connections[&(fk_equ, fk_attr)].clone();
                        seq.push(ConnectionStep::Table(fk.from));
                        seq
                    };
                    fk_seq.push(ConnectionStep::Join {
                        fk: fk_id,
                        natural: true,
                    });
                    for &pk_equ in &pk_class {
                        if pk_equ == fk_equ {
                            continue;
                        }
                        let mut path = fk_seq.clone();
                        if pk_equ != pk_attr {
                            path.push(ConnectionStep::Table(fk.to));
                            path.extend_from_slice(&self.connections[&(pk_attr, pk_equ)]);
                        }
                        let reversed = path
                            .iter()
                            .rev()
                            .map(|step| match *step {
                                ConnectionStep::Join { fk, natural } => ConnectionStep::Join {
                                    fk,
                                    natural: !natural,
                                },
                                table => table,
                            })
                            .collect();
                        self.insert_connection((fk_equ, pk_equ), path);
                        self.insert_connection((pk_equ, fk_equ), reversed);
                    }
                }

                let merged: BTreeSet<_> = fk_class.union(&pk_class).copied().collect();
                for attr in &merged {
                    self.equivalence_classes.insert(*attr, merged.clone());
                }
            }
        }
        self.foreign_keys = foreign_keys;

        debug!(
            "Schema {} has {} equivalence connections",
            self.name,
            self.connections.len()
        );
    }

    /// Keeps the shorter of an existing and a new connection between the same columns.
    fn insert_connection(&mut self, key: (AttributeId, AttributeId), path: Vec<ConnectionStep>) {
        match self.connections.entry(key) {
            Entry::Occupied(mut entry) => {
                if path.len() < entry.get().len() {
                    entry.insert(path);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(path);
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tables(&self) -> impl Iterator<Item = (TableId, &Table)> {
        self.tables
            .iter()
            .enumerate()
            .map(|(idx, table)| (TableId(idx), table))
    }

    pub fn table(&self, id: TableId) -> &Table {
        &self.tables[id.0]
    }

    pub fn table_by_name(&self, name: &str) -> Option<TableId> {
        self.table_index.get(name).copied()
    }

    pub fn attribute(&self, id: AttributeId) -> &Column {
        &self.tables[id.table.0].columns[id.column]
    }

    pub fn attribute_by_name(&self, table: TableId, column: &str) -> Option<AttributeId> {
        self.table(table)
            .column_index(column)
            .map(|column| AttributeId { table, column })
    }

    /// `table.column`, for messages.
    pub fn attribute_name(&self, id: AttributeId) -> String {
        format!("{}.{}", self.table(id.table).name, self.attribute(id).name)
    }

    pub fn foreign_key(&self, id: ForeignKeyId) -> &ForeignKey {
        &self.foreign_keys[id.0]
    }

    pub fn foreign_keys(&self) -> impl Iterator<Item = (ForeignKeyId, &ForeignKey)> {
        self.foreign_keys
            .iter()
            .enumerate()
            .map(|(idx, fk)| (ForeignKeyId(idx), fk))
    }

    pub fn foreign_key_by_name(&self, name: &str) -> Option<ForeignKeyId> {
        self.foreign_keys().find(|(_, fk)| fk.name == name).map(|(id, _)| id)
    }

    pub fn foreign_keys_from(&self, table: TableId) -> &[ForeignKeyId] {
        &self.edges_from[table.0]
    }

    /// Exact lookup of a single-column foreign key from `fk` to `pk`.
    pub fn find_foreign_key(&self, fk: AttributeId, pk: AttributeId) -> Option<ForeignKeyId> {
        self.edges_from[fk.table.0].iter().copied().find(|&id| {
            let candidate = self.foreign_key(id);
            candidate.to == pk.table && candidate.pairs == [(fk, pk)]
        })
    }

    /// All foreign keys whose referencing columns include `fk`.
    pub fn foreign_keys_from_column(&self, fk: AttributeId) -> Vec<ForeignKeyId> {
        self.edges_from[fk.table.0]
            .iter()
            .copied()
            .filter(|&id| self.foreign_key(id).pairs.iter().any(|(from, _)| *from == fk))
            .collect()
    }

    pub fn index_to_table(&self, index: &str) -> Option<TableId> {
        self.index_to_table.get(index).copied()
    }

    /// Every column `attr` can be forced equal to through foreign keys, `attr` included.
    pub fn possible_equivalence_class(&self, attr: AttributeId) -> &BTreeSet<AttributeId> {
        &self.equivalence_classes[&attr]
    }

    pub fn are_equivalent(&self, a: AttributeId, b: AttributeId) -> bool {
        self.possible_equivalence_class(a).contains(&b)
    }

    /// The chain of joins and intermediate tables linking `from` to `to`. `None` when the two
    /// columns are not equivalent or are the same column.
    pub fn equivalence_connection(
        &self,
        from: AttributeId,
        to: AttributeId,
    ) -> Option<&[ConnectionStep]> {
        self.connections.get(&(from, to)).map(|path| path.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::imdb_schema;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn attr(schema: &Schema, table: &str, column: &str) -> AttributeId {
        let table = schema.table_by_name(table).unwrap();
        schema.attribute_by_name(table, column).unwrap()
    }

    /// Column reached by joining along `path` starting at `from`.
    fn walk_connection(schema: &Schema, from: AttributeId, path: &[ConnectionStep]) -> AttributeId {
        let mut current = from;
        for step in path {
            if let ConnectionStep::Join { fk, natural } = *step {
                let fk = schema.foreign_key(fk);
                let &(fk_attr, pk_attr) = fk
                    .pairs
                    .iter()
                    .find(|(fk_attr, pk_attr)| {
                        if natural {
                            *fk_attr == current
                        } else {
                            *pk_attr == current
                        }
                    })
                    .unwrap();
                current = if natural { pk_attr } else { fk_attr };
            }
        }
        current
    }

    #[test]
    fn test_direct_foreign_key() {
        let schema = imdb_schema();
        let mc_movie = attr(&schema, "movie_companies", "movie_id");
        let title_id = attr(&schema, "title", "id");
        assert!(schema.are_equivalent(mc_movie, title_id));
        assert!(schema.are_equivalent(title_id, mc_movie));

        let fk = schema.find_foreign_key(mc_movie, title_id).unwrap();
        assert_eq!(schema.foreign_key(fk).name, "movie_companies_movie_id_fkey");
        assert_eq!(
            schema.equivalence_connection(mc_movie, title_id).unwrap(),
            &[ConnectionStep::Join {
                fk,
                natural: true
            }]
        );
        assert_eq!(
            schema.equivalence_connection(title_id, mc_movie).unwrap(),
            &[ConnectionStep::Join {
                fk,
                natural: false
            }]
        );
        assert!(schema.find_foreign_key(title_id, mc_movie).is_none());
    }

    #[test]
    fn test_connection_through_shared_key() {
        let schema = imdb_schema();
        let mc_movie = attr(&schema, "movie_companies", "movie_id");
        let mi_movie = attr(&schema, "movie_info", "movie_id");
        let title = schema.table_by_name("title").unwrap();
        assert!(schema.are_equivalent(mc_movie, mi_movie));

        let path = schema.equivalence_connection(mc_movie, mi_movie).unwrap();
        assert_eq!(path.len(), 3);
        assert!(matches!(path[0], ConnectionStep::Join { natural: true, .. }));
        assert_eq!(path[1], ConnectionStep::Table(title));
        assert!(matches!(path[2], ConnectionStep::Join { natural: false, .. }));
    }

    #[test]
    fn test_unrelated_columns() {
        let schema = imdb_schema();
        let note = attr(&schema, "movie_companies", "note");
        let info = attr(&schema, "movie_info", "info");
        assert!(!schema.are_equivalent(note, info));
        assert!(schema.equivalence_connection(note, info).is_none());
        assert_eq!(schema.possible_equivalence_class(note).len(), 1);
    }

    #[test]
    fn test_lookups() {
        let schema = imdb_schema();
        assert_eq!(
            schema.index_to_table("movie_id_movie_companies"),
            schema.table_by_name("movie_companies")
        );
        assert_eq!(schema.index_to_table("missing"), None);
        let mc_company = attr(&schema, "movie_companies", "company_id");
        assert_eq!(schema.foreign_keys_from_column(mc_company).len(), 1);
        let title = schema.table(schema.table_by_name("title").unwrap());
        assert_eq!(title.key_columns().map(|c| c.name.as_str()).collect::<Vec<_>>(), ["id"]);
        assert_eq!(
            title.columns()[title.column_index("production_year").unwrap()].min,
            Some(Value::Int(1880))
        );
    }

    #[test]
    fn test_bad_descriptions() {
        let unknown_type = r#"{"name": "x", "tables": [{"name": "a", "cardinality": 1,
            "columns": [{"name": "id", "data_type": "jsonb"}]}]}"#;
        assert!(matches!(
            Schema::from_json(unknown_type),
            Err(SchemaError::UnknownDataType { .. })
        ));

        let bad_fk = r#"{"name": "x", "tables": [{"name": "a", "cardinality": 1,
            "columns": [{"name": "id", "data_type": "integer"}]}],
            "foreign_keys": [{"name": "f", "from_table": "a", "from_columns": ["id"],
            "to_table": "b", "to_columns": ["id"]}]}"#;
        assert!(matches!(
            Schema::from_json(bad_fk),
            Err(SchemaError::NoTable(name)) if name == "b"
        ));
    }

    #[test]
    fn test_foreign_key_cycle() {
        let triangle = r#"{"name": "x", "tables": [
            {"name": "a", "cardinality": 1, "columns": [{"name": "id", "data_type": "integer"}]},
            {"name": "b", "cardinality": 1, "columns": [{"name": "a_id", "data_type": "integer"}]},
            {"name": "c", "cardinality": 1, "columns": [{"name": "a_id", "data_type": "integer"}]}],
            "foreign_keys": [
            {"name": "b_a", "from_table": "b", "from_columns": ["a_id"],
             "to_table": "a", "to_columns": ["id"]},
            {"name": "c_a", "from_table": "c", "from_columns": ["a_id"],
             "to_table": "a", "to_columns": ["id"]},
            {"name": "c_b", "from_table": "c", "from_columns": ["a_id"],
             "to_table": "b", "to_columns": ["a_id"]}]}"#;
        let schema = Schema::from_json(triangle).unwrap();
        let a_id = attr(&schema, "a", "id");
        let b_a_id = attr(&schema, "b", "a_id");
        let c_a_id = attr(&schema, "c", "a_id");
        let c_b = schema.foreign_key_by_name("c_b").unwrap();

        for col in [a_id, b_a_id, c_a_id] {
            assert_eq!(schema.equivalence_connection(col, col), None);
        }
        assert_eq!(
            schema.equivalence_connection(c_a_id, b_a_id).unwrap(),
            &[ConnectionStep::Join {
                fk: c_b,
                natural: true
            }]
        );
        assert_eq!(
            schema.equivalence_connection(b_a_id, c_a_id).unwrap(),
            &[ConnectionStep::Join {
                fk: c_b,
                natural: false
            }]
        );
        let b_a = schema.foreign_key_by_name("b_a").unwrap();
        assert_eq!(
            schema.equivalence_connection(b_a_id, a_id).unwrap(),
            &[ConnectionStep::Join {
                fk: b_a,
                natural: true
            }]
        );
        for (from, to) in [(a_id, c_a_id), (b_a_id, c_a_id), (c_a_id, a_id)] {
            let path = schema.equivalence_connection(from, to).unwrap();
            assert_eq!(walk_connection(&schema, from, path), to);
        }
    }

    proptest! {
        #[test]
        fn connections_walk_to_their_target(a in 0usize..64, b in 0usize..64) {
            let schema = imdb_schema();
            let attrs: Vec<_> = schema
                .tables()
                .flat_map(|(table, t)| {
                    (0..t.columns().len()).map(move |column| AttributeId { table, column })
                })
                .collect();
            let from = attrs[a % attrs.len()];
            let to = attrs[b % attrs.len()];
            if from != to && schema.are_equivalent(from, to) {
                let path = schema.equivalence_connection(from, to).unwrap();
                prop_assert_eq!(walk_connection(&schema, from, path), to);
            }
        }
    }
}
