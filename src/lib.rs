mod backend;
pub mod bin_utils;
mod config;
mod engine;
mod estimator;
mod expr;
mod inject;
mod parse;
mod plan;
mod pred;
mod query;
mod reconstruct;
mod repository;
mod schema;
pub mod test_utils;
mod utils;

pub use backend::{Backend, BackendError, PsqlBackend};
pub use config::{Config, ConfigError, ConnectionConfig, EngineSettings, InjectionSettings};
pub use engine::{cardinalities, Cardinalities, ExecStats, ExecutionReport, PlanEngine};
pub use estimator::{
    CluelessEstimator, Estimator, EstimatorKind, ParallelEstimator, PlannerEstimator,
    Remembering, TrueCardinalityEstimator, UNKNOWN,
};
pub use expr::{parse_arbitrary_predicate, parse_arbitrary_predicates, split_filter};
pub use inject::{
    correct_estimate, correct_join_estimates, estimate_and_save, extract_subplan_order,
    extract_subplan_queries, save_estimations, CardinalityInjector, EstimationFiles, InjectError,
    JoinInfo, JoinType, ParsedSubplans, SubplanRef,
};
pub use parse::{ParseError, Parser};
pub use plan::{Explain, NodeCategory, NodeKind, PlanNode};
pub use pred::{ArbitraryPredicate, BoolExpr, Dnf, PredAtom, Predicate, PredicateError, Value};
pub use query::{Edge, EdgeId, NodeId, QueryGraph, TableInstance};
pub use reconstruct::{
    merge_queries, merge_virtual_nodes, EquivalenceJoin, PlanReconstructor, ReconstructError,
    SubplanResult,
};
pub use repository::{CardinalityMap, JsonDirRepository, QueryRepository, RepositoryError};
pub use schema::{
    AttributeId, CompOp, ConnectionStep, DataType, ForeignKey, ForeignKeyId, Schema, SchemaError,
    SchemaSpec, Table, TableId,
};
