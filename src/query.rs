use crate::backend::{Backend, BackendError};
use crate::pred::{predicates_to_string, Dnf, PredAtom};
use crate::schema::{AttributeId, ForeignKeyId, Schema, TableId};
use itertools::Itertools;
use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(usize);

/// One occurrence of a table in a query. The cardinality is the filtered estimate for this
/// occurrence, not the size of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableInstance {
    table: TableId,
    cardinality: f64,
    predicates: Dnf,
    is_virtual: bool,
}

/// A foreign-key join. The edge carrying it always points from the referencing instance to the
/// referenced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Join {
    pub foreign_key: ForeignKeyId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from: NodeId,
    pub join: Join,
    pub to: NodeId,
}

/// Table instances and the joins between them, stored in an arena. Node and edge ids stay valid
/// for the lifetime of the graph; removed slots are left empty.
///
/// Every node has an alias (`n1`, `n2`, ...) handed out in insertion order, which is what the
/// generated SQL refers to. Replacing a node keeps its alias and its edges.
#[derive(Debug, Clone, Default)]
pub struct QueryGraph {
    nodes: Vec<Option<TableInstance>>,
    order: Vec<NodeId>,
    edges: Vec<Option<Edge>>,
    edges_from: Vec<Vec<EdgeId>>,
    edges_to: Vec<Vec<EdgeId>>,
    node_aliases: Vec<String>,
    edge_aliases: Vec<String>,
    alias_index: FxHashMap<String, NodeId>,
    next_node_alias: usize,
    next_edge_alias: usize,
}

type Slot = (NodeId, AttributeId);

/// Partition of (node, column) slots into classes, used while generating join conditions.
#[derive(Default)]
struct SlotClasses {
    class_of: FxHashMap<Slot, usize>,
    members: Vec<Vec<Slot>>,
}

impl SlotClasses {
    fn ensure(&mut self, slot: Slot) {
        if !self.class_of.contains_key(&slot) {
            self.class_of.insert(slot, self.members.len());
            self.members.push(vec![slot]);
        }
    }

    fn same(&self, a: Slot, b: Slot) -> bool {
        self.class_of[&a] == self.class_of[&b]
    }

    fn union(&mut self, a: Slot, b: Slot) {
        let (keep, merge) = (self.class_of[&a], self.class_of[&b]);
        if keep == merge {
            return;
        }
        let moved = std::mem::take(&mut self.members[merge]);
        for slot in &moved {
            self.class_of.insert(*slot, keep);
        }
        self.members[keep].extend(moved);
    }

    fn members(&self, slot: Slot) -> &[Slot] {
        &self.members[self.class_of[&slot]]
    }
}

impl TableInstance {
    pub fn new(table: TableId, cardinality: f64, predicates: Dnf) -> Self {
        Self {
            table,
            cardinality,
            predicates,
            is_virtual: false,
        }
    }

    /// An unfiltered stand-in for `table` that only exists to complete a join chain.
    pub fn new_virtual(schema: &Schema, table: TableId) -> Self {
        Self {
            table,
            cardinality: schema.table(table).cardinality(),
            predicates: vec![],
            is_virtual: true,
        }
    }

    /// Creates an instance whose cardinality is the backend's estimate for the filtered table.
    /// A timed out estimate is recorded as `-1`.
    pub fn build(
        schema: &Schema,
        backend: &dyn Backend,
        table: TableId,
        predicates: Dnf,
        alias: &str,
    ) -> Result<Self, BackendError> {
        let cardinality = if predicates.is_empty() {
            schema.table(table).cardinality()
        } else {
            match backend.explain(&Self::sql(schema, table, &predicates, alias), &[]) {
                Ok(explain) => explain.plan.plan_rows,
                Err(BackendError::Timeout) => -1.0,
                Err(err) => return Err(err),
            }
        };
        Ok(Self::new(table, cardinality, predicates))
    }

    /// `SELECT *` over the single table with the given predicates.
    pub fn sql(schema: &Schema, table: TableId, predicates: &[Vec<PredAtom>], alias: &str) -> String {
        let predicate_string = predicates_to_string(alias, predicates);
        let predicate_string = if predicate_string.is_empty() {
            predicate_string
        } else {
            format!("\nWHERE {}", predicate_string)
        };
        format!(
            "SELECT *\nFROM {} AS {}{};",
            schema.table(table).name(),
            alias,
            predicate_string
        )
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn cardinality(&self) -> f64 {
        self.cardinality
    }

    pub fn predicates(&self) -> &Dnf {
        &self.predicates
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }
}

impl QueryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_node_alias(&mut self) -> String {
        loop {
            self.next_node_alias += 1;
            let alias = format!("n{}", self.next_node_alias);
            if !self.alias_index.contains_key(&alias) {
                return alias;
            }
        }
    }

    pub fn add_node(&mut self, instance: TableInstance) -> NodeId {
        let alias = self.fresh_node_alias();
        self.add_node_with_alias(instance, alias)
    }

    /// Adds a node under an alias chosen by the caller. The alias must not be in use.
    pub fn add_node_with_alias(&mut self, instance: TableInstance, alias: String) -> NodeId {
        debug_assert!(!self.alias_index.contains_key(&alias));
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(instance));
        self.order.push(id);
        self.edges_from.push(vec![]);
        self.edges_to.push(vec![]);
        self.alias_index.insert(alias.clone(), id);
        self.node_aliases.push(alias);
        id
    }

    pub fn add_edge(&mut self, from: NodeId, foreign_key: ForeignKeyId, to: NodeId) -> EdgeId {
        let id = EdgeId(self.edges.len());
        self.edges.push(Some(Edge {
            from,
            join: Join { foreign_key },
            to,
        }));
        self.edges_from[from.0].push(id);
        self.edges_to[to.0].push(id);
        self.next_edge_alias += 1;
        self.edge_aliases.push(format!("e{}", self.next_edge_alias));
        id
    }

    pub fn remove_edge(&mut self, id: EdgeId) {
        if let Some(edge) = self.edges[id.0].take() {
            self.edges_from[edge.from.0].retain(|&other| other != id);
            self.edges_to[edge.to.0].retain(|&other| other != id);
        }
    }

    /// Removes a node together with every edge touching it.
    pub fn remove_node(&mut self, id: NodeId) {
        let incident: Vec<_> = self.edges_from[id.0]
            .iter()
            .chain(&self.edges_to[id.0])
            .copied()
            .collect();
        for edge in incident {
            self.remove_edge(edge);
        }
        if self.nodes[id.0].take().is_some() {
            self.order.retain(|&node| node != id);
            let alias = &self.node_aliases[id.0];
            if self.alias_index.get(alias) == Some(&id) {
                self.alias_index.remove(alias);
            }
        }
    }

    /// Swaps the instance stored at `id`. Alias, position and edges are untouched.
    pub fn replace_node(&mut self, id: NodeId, instance: TableInstance) {
        self.nodes[id.0] = Some(instance);
    }

    /// Moves every edge endpoint at `old` over to `new` without touching either node.
    pub fn redirect_edges(&mut self, old: NodeId, new: NodeId) {
        for id in std::mem::take(&mut self.edges_from[old.0]) {
            if let Some(edge) = self.edges[id.0].as_mut() {
                edge.from = new;
                self.edges_from[new.0].push(id);
            }
        }
        for id in std::mem::take(&mut self.edges_to[old.0]) {
            if let Some(edge) = self.edges[id.0].as_mut() {
                edge.to = new;
                self.edges_to[new.0].push(id);
            }
        }
    }

    pub fn set_alias(&mut self, id: NodeId, alias: String) {
        let old = std::mem::replace(&mut self.node_aliases[id.0], alias.clone());
        if self.alias_index.get(&old) == Some(&id) {
            self.alias_index.remove(&old);
        }
        self.alias_index.insert(alias, id);
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.get(id.0).map_or(false, Option::is_some)
    }

    /// Panics if the node was removed.
    pub fn node(&self, id: NodeId) -> &TableInstance {
        self.nodes[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("node {:?} was removed", id))
    }

    /// Live nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.order.iter().copied()
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        self.edges[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("edge {:?} was removed", id))
    }

    /// Live edges, grouped by source node in node order.
    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &Edge)> + '_ {
        self.order
            .iter()
            .flat_map(move |node| self.edges_from(*node))
    }

    /// Live edges in insertion order.
    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.edges
            .iter()
            .enumerate()
            .filter_map(|(idx, edge)| edge.as_ref().map(|_| EdgeId(idx)))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.iter().flatten().count()
    }

    pub fn edges_from(&self, id: NodeId) -> impl Iterator<Item = (EdgeId, &Edge)> + '_ {
        self.edges_from[id.0].iter().map(move |&edge| (edge, self.edge(edge)))
    }

    pub fn edges_to(&self, id: NodeId) -> impl Iterator<Item = (EdgeId, &Edge)> + '_ {
        self.edges_to[id.0].iter().map(move |&edge| (edge, self.edge(edge)))
    }

    pub fn edges_incident(&self, id: NodeId) -> impl Iterator<Item = (EdgeId, &Edge)> + '_ {
        self.edges_from(id).chain(self.edges_to(id))
    }

    fn neighbors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.edges_from(id)
            .map(|(_, edge)| edge.to)
            .chain(self.edges_to(id).map(|(_, edge)| edge.from))
    }

    pub fn alias(&self, id: NodeId) -> &str {
        &self.node_aliases[id.0]
    }

    pub fn edge_alias(&self, id: EdgeId) -> &str {
        &self.edge_aliases[id.0]
    }

    pub fn node_by_alias(&self, alias: &str) -> Option<NodeId> {
        self.alias_index.get(alias).copied()
    }

    /// Visits every node once. Each component is walked depth first from its first node in
    /// insertion order; every node is reported with the edges linking it to nodes visited before
    /// it. The first node of each component has no such edges.
    pub fn traverse(&self) -> Vec<(NodeId, Vec<EdgeId>)> {
        let mut visited = FxHashSet::default();
        let mut order = Vec::with_capacity(self.order.len());
        for &start in &self.order {
            if !visited.insert(start) {
                continue;
            }
            order.push((start, vec![]));
            let mut pending: Vec<_> = self.neighbors(start).collect();
            while let Some(next) = pending.pop() {
                if visited.contains(&next) {
                    continue;
                }
                let incident = self
                    .edges_incident(next)
                    .filter(|(_, edge)| visited.contains(&edge.from) || visited.contains(&edge.to))
                    .map(|(id, _)| id)
                    .collect();
                visited.insert(next);
                pending.extend(self.neighbors(next));
                order.push((next, incident));
            }
        }
        order
    }

    pub fn node_order(&self) -> Vec<NodeId> {
        self.traverse().into_iter().map(|(node, _)| node).collect()
    }

    pub fn predicate_string(&self) -> String {
        let parts: Vec<_> = self
            .nodes()
            .filter(|&node| !self.node(node).predicates.is_empty())
            .map(|node| predicates_to_string(self.alias(node), &self.node(node).predicates))
            .collect();
        if parts.is_empty() {
            String::new()
        } else {
            format!("\nWHERE {}", parts.join("\n\tAND "))
        }
    }

    /// Renders the graph as a SQL query. Joins through virtual nodes become equalities between
    /// the real instances on either side; within a chain of equal columns the instance visited
    /// first is the one the others are compared against.
    pub fn sql(&self, schema: &Schema, count: bool) -> String {
        let mut conditions: Vec<(NodeId, Vec<String>)> = vec![];
        let mut condition_index = FxHashMap::default();
        let mut node_order = FxHashMap::default();
        let mut should = SlotClasses::default();
        let mut are = SlotClasses::default();
        let mut source: FxHashMap<Slot, Slot> = FxHashMap::default();

        let column = |slot: Slot| format!("{}.{}", self.alias(slot.0), schema.attribute(slot.1).name);

        for (position, (node, edges)) in self.traverse().into_iter().enumerate() {
            node_order.insert(node, position);
            if !self.node(node).is_virtual() {
                condition_index.insert(node, conditions.len());
                conditions.push((node, vec![]));
            }

            let mut updated: Vec<Slot> = vec![];
            for edge in edges {
                let edge = *self.edge(edge);
                let from_virtual = self.node(edge.from).is_virtual();
                let to_virtual = self.node(edge.to).is_virtual();
                for &(fk_attr, pk_attr) in &schema.foreign_key(edge.join.foreign_key).pairs {
                    let from = (edge.from, fk_attr);
                    let to = (edge.to, pk_attr);
                    for slot in [from, to] {
                        should.ensure(slot);
                        are.ensure(slot);
                    }
                    if should.same(from, to) {
                        continue;
                    }
                    should.union(from, to);
                    if !from_virtual && !to_virtual {
                        are.union(from, to);
                        conditions[condition_index[&node]]
                            .1
                            .push(format!("{} = {}", column(from), column(to)));
                    } else {
                        for slot in [from, to] {
                            if !updated.contains(&slot) {
                                updated.push(slot);
                            }
                        }
                    }
                    if !to_virtual {
                        source.insert(from, to);
                    }
                }
            }

            for start in updated {
                if self.node(start.0).is_virtual() {
                    continue;
                }
                let mut up = start;
                let candidates = should.members(start).to_vec();
                for candidate in candidates {
                    if candidate.0 == up.0
                        || self.node(candidate.0).is_virtual()
                        || are.same(up, candidate)
                    {
                        continue;
                    }
                    let eq = Self::follow_source(&source, &are, candidate);
                    up = Self::follow_source(&source, &are, up);
                    are.union(up, eq);
                    let (cond, other) = if node_order[&up.0] < node_order[&eq.0] {
                        (eq, up)
                    } else {
                        (up, eq)
                    };
                    if !source.contains_key(&cond) && !source.contains_key(&other) {
                        source.insert(cond, other);
                    }
                    conditions[condition_index[&cond.0]]
                        .1
                        .push(format!("{} = {}", column(cond), column(other)));
                }
            }
        }

        let from = conditions
            .iter()
            .enumerate()
            .map(|(position, (node, node_conditions))| {
                let table = format!(
                    "{} AS {}",
                    schema.table(self.node(*node).table).name(),
                    self.alias(*node)
                );
                if position == 0 {
                    table
                } else if node_conditions.is_empty() {
                    format!("{} ON TRUE", table)
                } else {
                    format!("{} ON {}", table, node_conditions.join(" AND "))
                }
            })
            .join("\n\tJOIN ");

        format!(
            "SELECT {}\nFROM {}{};",
            if count { "COUNT(*)" } else { "*" },
            from,
            self.predicate_string()
        )
    }

    /// Follows recorded sources while they stay in the same class.
    fn follow_source(source: &FxHashMap<Slot, Slot>, are: &SlotClasses, mut slot: Slot) -> Slot {
        for _ in 0..=source.len() {
            match source.get(&slot) {
                Some(&next) if are.same(next, slot) => slot = next,
                _ => break,
            }
        }
        slot
    }

    /// The sub-query over `selected`. Joins to excluded nodes are dropped, except that several
    /// selected nodes referencing the same excluded node through the same key still share a
    /// virtual copy of it. Kept nodes keep their aliases.
    pub fn build_subquery(&self, schema: &Schema, selected: &[NodeId]) -> QueryGraph {
        let selected: FxHashSet<_> = selected.iter().copied().collect();
        let mut sub = QueryGraph::new();
        let mut mapping = FxHashMap::default();
        for node in self.nodes().filter(|node| selected.contains(node)) {
            let id = sub.add_node_with_alias(self.node(node).clone(), self.alias(node).to_string());
            mapping.insert(node, id);
        }

        let mut edges = vec![];
        let mut neighboring: Vec<((NodeId, BTreeSet<AttributeId>), Vec<(NodeId, ForeignKeyId)>)> =
            vec![];
        for node in self.nodes().filter(|node| selected.contains(node)) {
            for (_, edge) in self.edges_from(node) {
                if selected.contains(&edge.to) {
                    edges.push((mapping[&node], edge.join.foreign_key, mapping[&edge.to]));
                    continue;
                }
                let key: (NodeId, BTreeSet<AttributeId>) = (
                    edge.to,
                    schema
                        .foreign_key(edge.join.foreign_key)
                        .pairs
                        .iter()
                        .map(|&(_, pk)| pk)
                        .collect(),
                );
                match neighboring.iter_mut().find(|(other, _)| *other == key) {
                    Some((_, members)) => members.push((node, edge.join.foreign_key)),
                    None => neighboring.push((key, vec![(node, edge.join.foreign_key)])),
                }
            }
        }

        for ((excluded, _), members) in neighboring {
            if members.len() < 2 {
                continue;
            }
            let table = self.node(excluded).table;
            let virtual_node = sub.add_node(TableInstance::new_virtual(schema, table));
            for (from, foreign_key) in members {
                edges.push((mapping[&from], foreign_key, virtual_node));
            }
        }

        for (from, foreign_key, to) in edges {
            sub.add_edge(from, foreign_key, to);
        }
        sub
    }

    /// True when the joins cannot connect all nodes.
    pub fn detect_cross_product(&self) -> bool {
        self.node_count().saturating_sub(1) > self.edge_count()
    }

    /// Splits the query into one sub-query per connected component.
    pub fn eliminate_cross_product(&self, schema: &Schema) -> Vec<QueryGraph> {
        let mut components: Vec<Vec<NodeId>> = vec![];
        for (node, edges) in self.traverse() {
            if edges.is_empty() {
                components.push(vec![]);
            }
            if !self.node(node).is_virtual() {
                if let Some(component) = components.last_mut() {
                    component.push(node);
                }
            }
        }
        debug!("Split query into {} factors", components.len());
        components
            .into_iter()
            .filter(|component| !component.is_empty())
            .map(|component| self.build_subquery(schema, &component))
            .collect()
    }

    /// Aliases of the real (non-virtual) nodes.
    pub fn real_aliases(&self) -> BTreeSet<String> {
        self.nodes()
            .filter(|&node| !self.node(node).is_virtual())
            .map(|node| self.alias(node).to_string())
            .collect()
    }

    pub fn tree(&self, schema: &Schema) -> termtree::Tree<String> {
        termtree::Tree::new(format!("Query({} nodes)", self.node_count())).with_leaves(
            self.nodes().map(|node| {
                let instance = self.node(node);
                termtree::Tree::new(format!(
                    "{}: {}{} card={}",
                    self.alias(node),
                    schema.table(instance.table).name(),
                    if instance.is_virtual { " (virtual)" } else { "" },
                    instance.cardinality
                ))
                .with_leaves(self.edges_from(node).map(|(id, edge)| {
                    termtree::Tree::new(format!(
                        "{} -[{}]-> {}",
                        self.edge_alias(id),
                        schema.foreign_key(edge.join.foreign_key).name,
                        self.alias(edge.to)
                    ))
                }))
            }),
        )
    }
}
