//! The plan tree printed by `EXPLAIN (FORMAT JSON)`. Only the fields the reconstruction and the
//! plan engine look at are kept; everything else in the document is ignored.
mod kind;

pub use kind::{NodeCategory, NodeKind};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use traversal::DftPre;

/// One element of the array `EXPLAIN (FORMAT JSON)` returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Explain {
    #[serde(rename = "Plan")]
    pub plan: PlanNode,
    #[serde(rename = "Planning Time", default, skip_serializing_if = "Option::is_none")]
    pub planning_time: Option<f64>,
    #[serde(rename = "Execution Time", default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    #[serde(rename = "Node Type")]
    pub node_type: String,
    #[serde(rename = "Plans", default, skip_serializing_if = "Vec::is_empty")]
    pub plans: Vec<PlanNode>,
    #[serde(rename = "Relation Name", default, skip_serializing_if = "Option::is_none")]
    pub relation_name: Option<String>,
    #[serde(rename = "Alias", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(rename = "Index Name", default, skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    #[serde(rename = "Join Type", default, skip_serializing_if = "Option::is_none")]
    pub join_type: Option<String>,
    #[serde(rename = "Filter", default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(rename = "Index Cond", default, skip_serializing_if = "Option::is_none")]
    pub index_cond: Option<String>,
    #[serde(rename = "Recheck Cond", default, skip_serializing_if = "Option::is_none")]
    pub recheck_cond: Option<String>,
    #[serde(rename = "Join Filter", default, skip_serializing_if = "Option::is_none")]
    pub join_filter: Option<String>,
    #[serde(rename = "Hash Cond", default, skip_serializing_if = "Option::is_none")]
    pub hash_cond: Option<String>,
    #[serde(rename = "Merge Cond", default, skip_serializing_if = "Option::is_none")]
    pub merge_cond: Option<String>,
    #[serde(rename = "Plan Rows", default)]
    pub plan_rows: f64,
    #[serde(rename = "Actual Rows", default, skip_serializing_if = "Option::is_none")]
    pub actual_rows: Option<f64>,
    #[serde(rename = "Actual Loops", default, skip_serializing_if = "Option::is_none")]
    pub actual_loops: Option<f64>,
    #[serde(
        rename = "Rows Removed by Filter",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub rows_removed_by_filter: Option<f64>,
}

impl Explain {
    /// Parses the output of `EXPLAIN (FORMAT JSON)`, which wraps the plan in a one element array.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        let mut explains: Vec<Explain> = serde_json::from_str(text)?;
        if explains.is_empty() {
            return Err(<serde_json::Error as serde::de::Error>::custom(
                "empty EXPLAIN output",
            ));
        }
        Ok(explains.swap_remove(0))
    }

    pub fn contains_gather(&self) -> bool {
        self.plan.contains_gather()
    }
}

impl PlanNode {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            ..Self::default()
        }
    }

    pub fn with_plans(mut self, plans: Vec<PlanNode>) -> Self {
        self.plans = plans;
        self
    }

    pub fn kind(&self) -> Option<NodeKind> {
        NodeKind::parse(&self.node_type)
    }

    /// This node and all nodes below it, parents first.
    pub fn iter(&self) -> impl Iterator<Item = &PlanNode> {
        DftPre::new(self, |node: &PlanNode| node.plans.iter()).map(|(_, node)| node)
    }

    pub fn contains_gather(&self) -> bool {
        self.iter().any(|node| node.kind() == Some(NodeKind::Gather))
    }

    /// Aliases of every relation scanned below this node.
    pub fn table_aliases(&self) -> BTreeSet<String> {
        self.iter().filter_map(|node| node.alias.clone()).collect()
    }

    /// Join conditions in the order they are checked: join filter, hash then merge condition.
    pub fn join_conditions(&self) -> impl Iterator<Item = &str> {
        [&self.join_filter, &self.hash_cond, &self.merge_cond]
            .into_iter()
            .filter_map(|cond| cond.as_deref())
    }
}

impl From<&PlanNode> for termtree::Tree<String> {
    fn from(node: &PlanNode) -> Self {
        let mut label = node.node_type.clone();
        if let Some(join_type) = &node.join_type {
            label = format!("{}({})", label, join_type);
        }
        if let Some(relation) = &node.relation_name {
            label = format!("{} on {}", label, relation);
        }
        if let Some(alias) = &node.alias {
            label = format!("{} {}", label, alias);
        }
        for cond in node.join_conditions().chain(node.filter.as_deref()) {
            label = format!("{} [{}]", label, cond);
        }
        Self::new(format!("{} rows={}", label, node.plan_rows)).with_leaves(&node.plans)
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", termtree::Tree::<String>::from(self))
    }
}
