//! Rebuilds a query graph for every sub-join of an EXPLAIN plan.
//!
//! The plan is walked bottom up. Scans become single-node graphs whose predicates were each
//! checked against the backend, inner joins merge the graphs of their two inputs along the
//! foreign keys behind the join condition, and operators that only move rows around pass their
//! input through. Every graph that could be built completely is reported as a subplan.
//!
//! Failures are mostly soft: a subtree that cannot be rebuilt has no graph, and conditions that
//! cannot be placed yet are handed to the parent as orphans. Only plan operators nobody knows
//! about, malformed plans and lost connections are errors.
mod merge;

pub use merge::{
    find_alias, merge_queries, merge_virtual_nodes, real_node, resolve_join, EquivalenceJoin,
    JoinResolution,
};

use crate::backend::{Backend, BackendError};
use crate::expr::{self, parse_join_condition};
use crate::plan::{Explain, NodeCategory, NodeKind, PlanNode};
use crate::pred::{Dnf, PredAtom};
use crate::query::{QueryGraph, TableInstance};
use crate::schema::{Schema, TableId};
use crate::utils;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_MAX_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("unknown plan operator: {0}")]
    UnknownPlanOperator(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("no table has index {0}")]
    UnknownIndex(String),
    #[error("malformed plan: {0}")]
    MalformedPlan(String),
    #[error("plan is nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, ReconstructError>;

/// What a plan subtree rebuilds to.
#[derive(Debug, Clone, Default)]
pub struct SubplanResult {
    /// Completely rebuilt sub-joins of the subtree, inputs before the joins using them.
    pub subplans: Vec<QueryGraph>,
    /// The graph of the subtree itself, `None` if it cannot be rebuilt.
    pub query: Option<QueryGraph>,
    /// Conditions no node of the subtree could place.
    pub orphaned: Vec<String>,
    pub instances: BTreeMap<String, TableInstance>,
}

impl SubplanResult {
    fn unresolved(subplans: Vec<QueryGraph>, instances: BTreeMap<String, TableInstance>) -> Self {
        Self {
            subplans,
            query: None,
            orphaned: vec![],
            instances,
        }
    }
}

pub struct PlanReconstructor<'a> {
    schema: &'a Schema,
    backend: &'a dyn Backend,
    parse_predicates: bool,
    max_depth: usize,
}

impl<'a> PlanReconstructor<'a> {
    pub fn new(schema: &'a Schema, backend: &'a dyn Backend) -> Self {
        Self {
            schema,
            backend,
            parse_predicates: true,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Keep scan predicates as the planner printed them instead of parsing them.
    pub fn with_parse_predicates(mut self, parse_predicates: bool) -> Self {
        self.parse_predicates = parse_predicates;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Asks the backend for the plan of `sql` and rebuilds its subplans.
    pub fn explain_subplans(&self, sql: &str) -> Result<Vec<QueryGraph>> {
        let explain = self.backend.explain(sql, &[])?;
        self.build_subplan_queries(&explain)
    }

    pub fn build_subplan_queries(&self, explain: &Explain) -> Result<Vec<QueryGraph>> {
        let result = self.reconstruct(&explain.plan)?;
        if !result.orphaned.is_empty() {
            warn!(
                "{} conditions could not be placed anywhere in the plan: {}",
                result.orphaned.len(),
                result.orphaned.join(", ")
            );
        }
        Ok(result.subplans)
    }

    pub fn reconstruct(&self, node: &PlanNode) -> Result<SubplanResult> {
        self.recurse(node, 0)
    }

    fn recurse(&self, node: &PlanNode, depth: usize) -> Result<SubplanResult> {
        if depth > self.max_depth {
            return Err(ReconstructError::TooDeep(self.max_depth));
        }
        let kind = node
            .kind()
            .ok_or_else(|| ReconstructError::UnknownPlanOperator(node.node_type.clone()))?;
        if kind == NodeKind::BitmapHeapScan {
            return self.bitmap_heap_scan(node);
        }
        if kind.category() == NodeCategory::BitmapOperand {
            return Err(ReconstructError::UnknownPlanOperator(node.node_type.clone()));
        }

        let mut subplans = vec![];
        let mut children = vec![];
        let mut orphaned = vec![];
        let mut instances = BTreeMap::new();
        let mut preferred_child = FxHashMap::default();
        let mut possible = true;
        for (idx, child) in node.plans.iter().enumerate() {
            let result = self.recurse(child, depth + 1)?;
            subplans.extend(result.subplans);
            instances.extend(result.instances);
            for cond in &result.orphaned {
                preferred_child.insert(cond.clone(), idx);
            }
            orphaned.extend(result.orphaned);
            match result.query {
                Some(query) => children.push(query),
                None => possible = false,
            }
        }
        if !possible {
            return Ok(SubplanResult::unresolved(subplans, instances));
        }

        match kind.category() {
            NodeCategory::BitmapOperand => {
                Err(ReconstructError::UnknownPlanOperator(node.node_type.clone()))
            }
            NodeCategory::Unsupported => {
                debug!("{} cannot be rebuilt", kind);
                Ok(SubplanResult::unresolved(subplans, instances))
            }
            NodeCategory::Physical => {
                let query = children.into_iter().next().ok_or_else(|| {
                    ReconstructError::MalformedPlan(format!("{} without input", kind))
                })?;
                Ok(SubplanResult {
                    subplans,
                    query: Some(query),
                    orphaned,
                    instances,
                })
            }
            NodeCategory::Join => {
                self.join(node, kind, children, orphaned, &preferred_child, subplans, instances)
            }
            NodeCategory::Scan => {
                let (table, alias) = self.scan_target(node, kind)?;
                let candidates = self.scan_conditions(node, table, &alias);
                let mut result = self.scan_table(table, alias, candidates)?;
                result.orphaned.extend(orphaned);
                if !result.orphaned.is_empty() {
                    result.subplans.clear();
                }
                Ok(result)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn join(
        &self,
        node: &PlanNode,
        kind: NodeKind,
        children: Vec<QueryGraph>,
        orphaned: Vec<String>,
        preferred_child: &FxHashMap<String, usize>,
        mut subplans: Vec<QueryGraph>,
        instances: BTreeMap<String, TableInstance>,
    ) -> Result<SubplanResult> {
        let join_type = node
            .join_type
            .as_deref()
            .ok_or_else(|| ReconstructError::MalformedPlan(format!("{} without join type", kind)))?;
        if join_type != "Inner" {
            debug!("Not rebuilding {} join", join_type);
            return Ok(SubplanResult::unresolved(subplans, instances));
        }
        let [first, second]: [QueryGraph; 2] = children.try_into().map_err(|children: Vec<_>| {
            ReconstructError::MalformedPlan(format!("{} with {} inputs", kind, children.len()))
        })?;

        let conditions: Vec<String> = orphaned
            .into_iter()
            .chain(node.join_conditions().flat_map(expr::split_condition))
            .collect();
        let mut joins: Vec<EquivalenceJoin> = vec![];
        let mut still_orphaned = vec![];
        for cond in conditions {
            let Some((left, right)) = parse_join_condition(&cond) else {
                if is_equality(&cond) {
                    still_orphaned.push(cond);
                    continue;
                }
                debug!("Join condition {} is not an equality of columns", cond);
                return Ok(SubplanResult::unresolved(subplans, instances));
            };
            let preferred = preferred_child.get(&cond).copied();
            let locate = |side: &expr::JoinColumn| {
                side.alias.clone().or_else(|| {
                    find_alias(self.schema, &first, &second, &side.column, preferred)
                })
            };
            let (Some(left_alias), Some(right_alias)) = (locate(&left), locate(&right)) else {
                still_orphaned.push(cond);
                continue;
            };
            match resolve_join(
                self.schema,
                &first,
                &second,
                (&left_alias, &left.column),
                (&right_alias, &right.column),
            ) {
                JoinResolution::Join(join) => {
                    if !joins.contains(&join) {
                        joins.push(join);
                    }
                }
                JoinResolution::Orphaned => still_orphaned.push(cond),
                JoinResolution::Rejected => {
                    info!("Rejecting join on {}", cond);
                    return Ok(SubplanResult::unresolved(subplans, instances));
                }
            }
        }

        let query = merge_queries(self.schema, &first, &second, &joins);
        if still_orphaned.is_empty() {
            subplans.push(query.clone());
        }
        Ok(SubplanResult {
            subplans,
            query: Some(query),
            orphaned: still_orphaned,
            instances,
        })
    }

    fn scan_target(&self, node: &PlanNode, kind: NodeKind) -> Result<(TableId, String)> {
        if kind == NodeKind::BitmapIndexScan {
            let index = node.index_name.as_deref().ok_or_else(|| {
                ReconstructError::MalformedPlan(format!("{} without index name", kind))
            })?;
            let table = self
                .schema
                .index_to_table(index)
                .ok_or_else(|| ReconstructError::UnknownIndex(index.to_string()))?;
            return Ok((table, self.schema.table(table).name().to_string()));
        }
        let relation = node.relation_name.as_deref().ok_or_else(|| {
            ReconstructError::MalformedPlan(format!("{} without relation name", kind))
        })?;
        let table = self
            .schema
            .table_by_name(relation)
            .ok_or_else(|| ReconstructError::UnknownTable(relation.to_string()))?;
        let alias = node.alias.clone().unwrap_or_else(|| relation.to_string());
        Ok((table, alias))
    }

    fn scan_conditions(&self, node: &PlanNode, table: TableId, alias: &str) -> Vec<String> {
        [&node.filter, &node.index_cond]
            .into_iter()
            .flatten()
            .flat_map(|cond| expr::split_filter(cond, alias, self.schema.table(table)))
            .collect()
    }

    /// A heap scan takes its table from the index scans below it. Their conditions are
    /// reported against the table name and are moved over to the heap scan's alias.
    fn bitmap_heap_scan(&self, node: &PlanNode) -> Result<SubplanResult> {
        let mut index_scans = vec![];
        for child in &node.plans {
            match child.kind() {
                Some(NodeKind::BitmapIndexScan) => index_scans.push(child),
                Some(NodeKind::BitmapAnd) => {
                    for grandchild in &child.plans {
                        if grandchild.kind() != Some(NodeKind::BitmapIndexScan) {
                            return Ok(SubplanResult::default());
                        }
                        index_scans.push(grandchild);
                    }
                }
                Some(_) => return Ok(SubplanResult::default()),
                None => {
                    return Err(ReconstructError::UnknownPlanOperator(child.node_type.clone()))
                }
            }
        }
        if index_scans.is_empty() {
            return Err(ReconstructError::MalformedPlan(
                "Bitmap Heap Scan without index scan".to_string(),
            ));
        }

        let (table, alias) = self.scan_target(node, NodeKind::BitmapHeapScan)?;
        let table_name = self.schema.table(table).name();
        let mut candidates = vec![];
        for scan in index_scans {
            let (index_table, index_alias) = self.scan_target(scan, NodeKind::BitmapIndexScan)?;
            if index_table != table {
                return Err(ReconstructError::MalformedPlan(format!(
                    "index {} is not on {}",
                    scan.index_name.as_deref().unwrap_or_default(),
                    table_name
                )));
            }
            candidates.extend(
                self.scan_conditions(scan, table, &index_alias)
                    .into_iter()
                    .map(|cond| expr::requalify(&cond, &index_alias, &alias)),
            );
        }
        candidates.extend(self.scan_conditions(node, table, &alias));
        let result = self.scan_table(table, alias, candidates)?;
        Ok(result)
    }

    /// Checks every candidate predicate on its own. The ones the backend refuses, typically
    /// because they reference another table, are handed up as orphans.
    fn scan_table(
        &self,
        table: TableId,
        alias: String,
        candidates: Vec<String>,
    ) -> Result<SubplanResult> {
        let mut accepted = vec![];
        let mut orphaned = vec![];
        for cond in candidates {
            let sql = TableInstance::sql(
                self.schema,
                table,
                &[vec![PredAtom::arbitrary(cond.clone())]],
                &alias,
            );
            match self.backend.explain(&sql, &[]) {
                Ok(_) => accepted.push(cond),
                Err(BackendError::Rejected(message)) => {
                    info!("Orphaning {} on {}: {}", cond, alias, message);
                    orphaned.push(cond);
                }
                Err(BackendError::Timeout) => {
                    info!("Orphaning {} on {}: timed out", cond, alias);
                    orphaned.push(cond);
                }
                Err(err) => return Err(err.into()),
            }
        }

        let arbitrary: Dnf = accepted
            .iter()
            .map(|cond| vec![PredAtom::arbitrary(cond.clone())])
            .collect();
        let estimated = TableInstance::build(self.schema, self.backend, table, arbitrary, &alias)?;
        let predicates = if self.parse_predicates {
            expr::parse_arbitrary_predicates(self.schema, table, &alias, &accepted, false)
        } else {
            estimated.predicates().clone()
        };
        let instance = TableInstance::new(table, estimated.cardinality(), predicates);

        let mut query = QueryGraph::new();
        query.add_node_with_alias(instance.clone(), alias.clone());
        let subplans = if orphaned.is_empty() {
            vec![query.clone()]
        } else {
            vec![]
        };
        Ok(SubplanResult {
            subplans,
            query: Some(query),
            orphaned,
            instances: BTreeMap::from([(alias, instance)]),
        })
    }
}

fn is_equality(cond: &str) -> bool {
    utils::split_top_level(utils::strip_outer_parens(cond), " = ").len() == 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fk, imdb_schema, table, ScriptedBackend};
    use pretty_assertions::assert_eq;

    fn scan(relation: &str, alias: &str) -> PlanNode {
        PlanNode {
            relation_name: Some(relation.to_string()),
            alias: Some(alias.to_string()),
            ..PlanNode::new("Seq Scan")
        }
    }

    fn filtered(mut node: PlanNode, filter: &str) -> PlanNode {
        node.filter = Some(filter.to_string());
        node
    }

    fn hash_join(cond: &str, outer: PlanNode, inner: PlanNode) -> PlanNode {
        PlanNode {
            join_type: Some("Inner".to_string()),
            hash_cond: Some(cond.to_string()),
            ..PlanNode::new("Hash Join")
        }
        .with_plans(vec![outer, PlanNode::new("Hash").with_plans(vec![inner])])
    }

    fn aliases(query: &QueryGraph) -> Vec<String> {
        query.real_aliases().into_iter().collect()
    }

    #[test]
    fn test_foreign_key_join() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new().with_rows("production_year", 50.0);
        let plan = hash_join(
            "(mc.movie_id = t.id)",
            scan("movie_companies", "mc"),
            filtered(scan("title", "t"), "(production_year > 2000)"),
        );
        let result = PlanReconstructor::new(&schema, &backend)
            .reconstruct(&plan)
            .unwrap();

        assert_eq!(
            result.subplans.iter().map(aliases).collect::<Vec<_>>(),
            vec![vec!["mc"], vec!["t"], vec!["mc", "t"]]
        );
        let joined = result.query.unwrap();
        assert_eq!(joined.node_count(), 2);
        assert_eq!(joined.edge_count(), 1);
        assert!(joined.nodes().all(|node| !joined.node(node).is_virtual()));
        let (_, edge) = joined.edges().next().unwrap();
        assert_eq!(edge.join.foreign_key, fk(&schema, "movie_companies_movie_id_fkey"));

        let t = joined.node(joined.node_by_alias("t").unwrap());
        assert_eq!(t.cardinality(), 50.0);
        assert!(matches!(t.predicates()[0][0], PredAtom::Simple(_)));
        assert_eq!(result.instances.len(), 2);
        assert!(result.orphaned.is_empty());
    }

    #[test]
    fn test_join_without_foreign_key_is_rejected() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new();
        let plan = hash_join(
            "(mc.note = mi.info)",
            scan("movie_companies", "mc"),
            scan("movie_info", "mi"),
        );
        let result = PlanReconstructor::new(&schema, &backend)
            .reconstruct(&plan)
            .unwrap();
        assert!(result.query.is_none());
        assert_eq!(
            result.subplans.iter().map(aliases).collect::<Vec<_>>(),
            vec![vec!["mc"], vec!["mi"]]
        );
    }

    #[test]
    fn test_shared_lookup_table_becomes_one_virtual_node() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new();
        let plan = hash_join(
            "(mk.movie_id = mi.movie_id)",
            hash_join(
                "(mc.movie_id = mi.movie_id)",
                scan("movie_companies", "mc"),
                scan("movie_info", "mi"),
            ),
            scan("movie_keyword", "mk"),
        );
        let result = PlanReconstructor::new(&schema, &backend)
            .reconstruct(&plan)
            .unwrap();
        let query = result.query.unwrap();
        let virtual_nodes: Vec<_> = query
            .nodes()
            .filter(|&node| query.node(node).is_virtual())
            .collect();
        assert_eq!(virtual_nodes.len(), 1);
        assert_eq!(query.node(virtual_nodes[0]).table(), table(&schema, "title"));
        assert_eq!(query.edges_to(virtual_nodes[0]).count(), 3);
        assert_eq!(result.subplans.len(), 5);
        assert_eq!(aliases(&result.subplans[2]), vec!["mc", "mi"]);
        assert_eq!(aliases(&result.subplans[3]), vec!["mk"]);
    }

    #[test]
    fn test_rejected_predicate_is_orphaned() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new()
            .with_rows("production_year", 40.0)
            .rejecting("weird_fn");
        let title = filtered(
            scan("title", "t"),
            "((production_year > 2000) AND (weird_fn(title) = 1))",
        );
        let reconstructor = PlanReconstructor::new(&schema, &backend);

        let result = reconstructor.reconstruct(&title).unwrap();
        assert!(result.subplans.is_empty());
        assert_eq!(result.orphaned, vec!["(weird_fn(t.title) = 1)"]);
        let query = result.query.unwrap();
        let t = query.node(query.node_by_alias("t").unwrap());
        assert_eq!(t.cardinality(), 40.0);
        assert_eq!(t.predicates().len(), 1);

        let plan = hash_join("(mc.movie_id = t.id)", scan("movie_companies", "mc"), title);
        let result = reconstructor.reconstruct(&plan).unwrap();
        assert_eq!(
            result.subplans.iter().map(aliases).collect::<Vec<_>>(),
            vec![vec!["mc"]]
        );
        assert_eq!(aliases(result.query.as_ref().unwrap()), vec!["mc", "t"]);
        assert_eq!(result.orphaned, vec!["(weird_fn(t.title) = 1)"]);
    }

    #[test]
    fn test_parameterized_index_scan() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new().rejecting("mc.movie_id");
        let inner = PlanNode {
            relation_name: Some("title".to_string()),
            alias: Some("t".to_string()),
            index_name: Some("title_pkey".to_string()),
            index_cond: Some("(id = mc.movie_id)".to_string()),
            ..PlanNode::new("Index Scan")
        };
        let plan = PlanNode {
            join_type: Some("Inner".to_string()),
            ..PlanNode::new("Nested Loop")
        }
        .with_plans(vec![scan("movie_companies", "mc"), inner]);
        let result = PlanReconstructor::new(&schema, &backend)
            .reconstruct(&plan)
            .unwrap();
        assert_eq!(
            result.subplans.iter().map(aliases).collect::<Vec<_>>(),
            vec![vec!["mc"], vec!["mc", "t"]]
        );
        assert!(result.orphaned.is_empty());
    }

    #[test]
    fn test_bitmap_heap_scan() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new().with_rows("mc.movie_id < 10", 7.0);
        let plan = PlanNode {
            relation_name: Some("movie_companies".to_string()),
            alias: Some("mc".to_string()),
            ..PlanNode::new("Bitmap Heap Scan")
        }
        .with_plans(vec![PlanNode {
            index_name: Some("movie_id_movie_companies".to_string()),
            index_cond: Some("(movie_id < 10)".to_string()),
            ..PlanNode::new("Bitmap Index Scan")
        }]);
        let result = PlanReconstructor::new(&schema, &backend)
            .reconstruct(&plan)
            .unwrap();
        assert_eq!(result.subplans.len(), 1);
        let query = result.query.unwrap();
        let mc = query.node(query.node_by_alias("mc").unwrap());
        assert_eq!(mc.cardinality(), 7.0);
        assert_eq!(
            query.sql(&schema, false),
            "SELECT *\nFROM movie_companies AS mc\nWHERE mc.movie_id < 10;"
        );
    }

    #[test]
    fn test_unsupported_and_outer_joins() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new();
        let mut left = hash_join(
            "(mc.movie_id = t.id)",
            scan("movie_companies", "mc"),
            scan("title", "t"),
        );
        left.join_type = Some("Left".to_string());
        let result = PlanReconstructor::new(&schema, &backend)
            .reconstruct(&left)
            .unwrap();
        assert!(result.query.is_none());
        assert_eq!(result.subplans.len(), 2);

        let aggregate = PlanNode::new("Aggregate").with_plans(vec![hash_join(
            "(mc.movie_id = t.id)",
            scan("movie_companies", "mc"),
            scan("title", "t"),
        )]);
        let result = PlanReconstructor::new(&schema, &backend)
            .reconstruct(&aggregate)
            .unwrap();
        assert!(result.query.is_none());
        assert_eq!(result.subplans.len(), 3);
    }

    #[test]
    fn test_operator_support() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new();
        let reconstructor = PlanReconstructor::new(&schema, &backend);
        for op in [
            "Aggregate",
            "Append",
            "SetOp",
            "Unique",
            "WindowAgg",
            "Limit",
            "Subquery Scan",
            "CTE Scan",
        ] {
            let plan = PlanNode::new(op).with_plans(vec![scan("title", "t")]);
            let result = reconstructor.reconstruct(&plan).unwrap();
            assert!(result.query.is_none(), "{}", op);
            assert_eq!(result.subplans.len(), 1, "{}", op);
        }

        for op in ["Function Scan", "Values Scan", "BitmapAnd", "BitmapOr"] {
            assert!(
                matches!(
                    reconstructor.reconstruct(&PlanNode::new(op)),
                    Err(ReconstructError::UnknownPlanOperator(name)) if name == op
                ),
                "{}",
                op
            );
        }
        let bare_and = PlanNode::new("BitmapAnd").with_plans(vec![PlanNode {
            index_name: Some("title_pkey".to_string()),
            ..PlanNode::new("Bitmap Index Scan")
        }]);
        assert!(matches!(
            reconstructor.reconstruct(&PlanNode::new("Sort").with_plans(vec![bare_and])),
            Err(ReconstructError::UnknownPlanOperator(name)) if name == "BitmapAnd"
        ));
    }

    #[test]
    fn test_hard_errors() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new();
        let reconstructor = PlanReconstructor::new(&schema, &backend);
        assert!(matches!(
            reconstructor.reconstruct(&PlanNode::new("ProjectSet")),
            Err(ReconstructError::UnknownPlanOperator(op)) if op == "ProjectSet"
        ));
        assert!(matches!(
            reconstructor.reconstruct(&scan("nope", "n")),
            Err(ReconstructError::UnknownTable(_))
        ));

        let mut deep = scan("title", "t");
        for _ in 0..5 {
            deep = PlanNode::new("Sort").with_plans(vec![deep]);
        }
        assert!(matches!(
            PlanReconstructor::new(&schema, &backend)
                .with_max_depth(3)
                .reconstruct(&deep),
            Err(ReconstructError::TooDeep(3))
        ));

        let broken = ScriptedBackend::new().disconnected();
        let filtered_scan = filtered(scan("title", "t"), "(production_year > 2000)");
        assert!(matches!(
            PlanReconstructor::new(&schema, &broken).reconstruct(&filtered_scan),
            Err(ReconstructError::Backend(BackendError::Connection(_)))
        ));
    }

    #[test]
    fn test_unparsed_predicates() {
        let schema = imdb_schema();
        let backend = ScriptedBackend::new();
        let plan = filtered(scan("title", "t"), "(production_year > 2000)");
        let result = PlanReconstructor::new(&schema, &backend)
            .with_parse_predicates(false)
            .reconstruct(&plan)
            .unwrap();
        let query = result.query.unwrap();
        let t = query.node(query.node_by_alias("t").unwrap());
        assert_eq!(t.predicates(), &vec![vec![PredAtom::arbitrary("(t.production_year > 2000)")]]);
    }
}
