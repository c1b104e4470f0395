//! Storage for query graphs and the cardinalities estimators produce for them, keyed by integer
//! query ids.
//!
//! Predicates are stored rendered against their node's alias and come back as arbitrary
//! predicates: the SQL of a loaded query is that of the saved one, its structured predicates are
//! not.
use crate::pred::PredAtom;
use crate::query::{NodeId, QueryGraph, TableInstance};
use crate::schema::Schema;
use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("no query with id {0}")]
    NotFound(u64),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown foreign key: {0}")]
    UnknownForeignKey(String),
    #[error("edge references unknown alias {0}")]
    UnknownAlias(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid record: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

pub type CardinalityMap = BTreeMap<u64, f64>;

pub trait QueryRepository {
    fn save_query(&self, schema: &Schema, id: u64, query: &QueryGraph) -> Result<()>;

    fn load_query(&self, schema: &Schema, id: u64) -> Result<QueryGraph>;

    /// Ids of all stored queries, ascending.
    fn query_ids(&self) -> Result<Vec<u64>>;

    /// Replaces everything stored for `estimator` by `cardinalities`.
    fn save_cardinalities(&self, estimator: &str, cardinalities: &CardinalityMap) -> Result<()>;

    /// Cardinalities stored for `estimator`, empty if there are none.
    fn load_cardinalities(&self, estimator: &str) -> Result<CardinalityMap>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NodeRecord {
    alias: String,
    table: String,
    cardinality: f64,
    #[serde(default)]
    is_virtual: bool,
    #[serde(default)]
    predicates: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EdgeRecord {
    from: String,
    foreign_key: String,
    to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct QueryRecord {
    id: u64,
    nodes: Vec<NodeRecord>,
    edges: Vec<EdgeRecord>,
}

impl QueryRecord {
    fn from_query(schema: &Schema, id: u64, query: &QueryGraph) -> Self {
        let nodes = query
            .nodes()
            .map(|node| {
                let instance = query.node(node);
                let alias = query.alias(node);
                NodeRecord {
                    alias: alias.to_string(),
                    table: schema.table(instance.table()).name().to_string(),
                    cardinality: instance.cardinality(),
                    is_virtual: instance.is_virtual(),
                    predicates: instance
                        .predicates()
                        .iter()
                        .map(|disjunction| {
                            disjunction.iter().map(|atom| atom.query_string(alias)).collect()
                        })
                        .collect(),
                }
            })
            .collect();
        let edges = query
            .edges()
            .map(|(_, edge)| EdgeRecord {
                from: query.alias(edge.from).to_string(),
                foreign_key: schema.foreign_key(edge.join.foreign_key).name.clone(),
                to: query.alias(edge.to).to_string(),
            })
            .collect();
        Self { id, nodes, edges }
    }

    fn into_query(self, schema: &Schema) -> Result<QueryGraph> {
        let mut query = QueryGraph::new();
        let mut ids: FxHashMap<String, NodeId> = FxHashMap::default();
        for node in self.nodes {
            let table = schema
                .table_by_name(&node.table)
                .ok_or_else(|| RepositoryError::UnknownTable(node.table.clone()))?;
            let instance = if node.is_virtual {
                TableInstance::new_virtual(schema, table)
            } else {
                let predicates = node
                    .predicates
                    .into_iter()
                    .map(|disjunction| disjunction.into_iter().map(PredAtom::arbitrary).collect())
                    .collect();
                TableInstance::new(table, node.cardinality, predicates)
            };
            let id = query.add_node_with_alias(instance, node.alias.clone());
            ids.insert(node.alias, id);
        }
        for edge in self.edges {
            let lookup = |alias: &String| {
                ids.get(alias)
                    .copied()
                    .ok_or_else(|| RepositoryError::UnknownAlias(alias.clone()))
            };
            let from = lookup(&edge.from)?;
            let to = lookup(&edge.to)?;
            let foreign_key = schema
                .foreign_key_by_name(&edge.foreign_key)
                .ok_or_else(|| RepositoryError::UnknownForeignKey(edge.foreign_key.clone()))?;
            query.add_edge(from, foreign_key, to);
        }
        Ok(query)
    }
}

/// Keeps every query in `queries/<id>.json` and the cardinalities of every estimator in
/// `cardinalities/<estimator>.json` below a root directory.
pub struct JsonDirRepository {
    root: PathBuf,
}

impl JsonDirRepository {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("queries"))?;
        fs::create_dir_all(root.join("cardinalities"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn query_path(&self, id: u64) -> PathBuf {
        self.root.join("queries").join(format!("{}.json", id))
    }

    fn cardinality_path(&self, estimator: &str) -> PathBuf {
        self.root
            .join("cardinalities")
            .join(format!("{}.json", estimator))
    }
}

impl QueryRepository for JsonDirRepository {
    fn save_query(&self, schema: &Schema, id: u64, query: &QueryGraph) -> Result<()> {
        let record = QueryRecord::from_query(schema, id, query);
        fs::write(self.query_path(id), serde_json::to_string_pretty(&record)?)?;
        debug!("Saved query {} with {} nodes", id, record.nodes.len());
        Ok(())
    }

    fn load_query(&self, schema: &Schema, id: u64) -> Result<QueryGraph> {
        let text = match fs::read_to_string(self.query_path(id)) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(RepositoryError::NotFound(id))
            }
            Err(err) => return Err(err.into()),
        };
        let record: QueryRecord = serde_json::from_str(&text)?;
        record.into_query(schema)
    }

    fn query_ids(&self) -> Result<Vec<u64>> {
        let mut ids = vec![];
        for entry in fs::read_dir(self.root.join("queries"))? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn save_cardinalities(&self, estimator: &str, cardinalities: &CardinalityMap) -> Result<()> {
        fs::write(
            self.cardinality_path(estimator),
            serde_json::to_string_pretty(cardinalities)?,
        )?;
        Ok(())
    }

    fn load_cardinalities(&self, estimator: &str) -> Result<CardinalityMap> {
        match fs::read_to_string(self.cardinality_path(estimator)) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(CardinalityMap::new()),
            Err(err) => Err(err.into()),
        }
    }
}
