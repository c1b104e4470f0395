//! Combining the query graphs of two join inputs.
//!
//! A join condition between two equivalent columns is rewritten into the foreign-key joins of
//! their equivalence connection. Tables the connection passes through become virtual nodes, and
//! virtual nodes that end up standing for the same join target are collapsed into one.
use crate::query::{EdgeId, NodeId, QueryGraph, TableInstance};
use crate::schema::{ConnectionStep, ForeignKeyId, Schema};
use log::debug;
use rustc_hash::FxHashMap;

/// A join between a node of the first input and a node of the second one, expressed as the
/// connection between the two joined columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquivalenceJoin {
    pub first: NodeId,
    pub connection: Vec<ConnectionStep>,
    pub second: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResolution {
    Join(EquivalenceJoin),
    /// Neither orientation puts one column on each side.
    Orphaned,
    /// The columns are unknown, identical or not connected through foreign keys.
    Rejected,
}

/// A live, non-virtual node with the given alias.
pub fn real_node(query: &QueryGraph, alias: &str) -> Option<NodeId> {
    query
        .node_by_alias(alias)
        .filter(|&node| !query.node(node).is_virtual())
}

fn real_nodes_with_column<'a>(
    schema: &'a Schema,
    query: &'a QueryGraph,
    column: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    query
        .nodes()
        .filter(move |&node| {
            let instance = query.node(node);
            !instance.is_virtual() && schema.table(instance.table()).has_column(column)
        })
        .map(move |node| query.alias(node))
}

/// Guesses the alias an unqualified column belongs to. A column owned by exactly one real node
/// of either input is attributed to it. Otherwise the input the condition came up from wins if
/// exactly one of its nodes has the column. This is a heuristic and can pick the wrong side of a
/// self join.
pub fn find_alias(
    schema: &Schema,
    first: &QueryGraph,
    second: &QueryGraph,
    column: &str,
    preferred_child: Option<usize>,
) -> Option<String> {
    let found_first: Vec<_> = real_nodes_with_column(schema, first, column).collect();
    let found_second: Vec<_> = real_nodes_with_column(schema, second, column).collect();
    match (found_first.len() + found_second.len(), preferred_child) {
        (0, _) => None,
        (1, _) => found_first
            .first()
            .or_else(|| found_second.first())
            .map(|alias| alias.to_string()),
        (_, Some(0)) if found_first.len() == 1 => Some(found_first[0].to_string()),
        (_, Some(1)) if found_second.len() == 1 => Some(found_second[0].to_string()),
        _ => None,
    }
}

/// Resolves `left = right`, each side an (alias, column) pair, to a join between `first` and
/// `second`.
pub fn resolve_join(
    schema: &Schema,
    first: &QueryGraph,
    second: &QueryGraph,
    left: (&str, &str),
    right: (&str, &str),
) -> JoinResolution {
    let ((first_node, first_column), (second_node, second_column)) = match (
        real_node(first, left.0),
        real_node(second, right.0),
        real_node(second, left.0),
        real_node(first, right.0),
    ) {
        (Some(a), Some(b), _, _) => ((a, left.1), (b, right.1)),
        (_, _, Some(b), Some(a)) => ((a, right.1), (b, left.1)),
        _ => return JoinResolution::Orphaned,
    };
    let first_attr = schema.attribute_by_name(first.node(first_node).table(), first_column);
    let second_attr = schema.attribute_by_name(second.node(second_node).table(), second_column);
    let (Some(first_attr), Some(second_attr)) = (first_attr, second_attr) else {
        debug!("Join on unknown column {} or {}", first_column, second_column);
        return JoinResolution::Rejected;
    };
    if first_attr == second_attr || !schema.are_equivalent(first_attr, second_attr) {
        debug!(
            "{} = {} is not backed by foreign keys",
            schema.attribute_name(first_attr),
            schema.attribute_name(second_attr)
        );
        return JoinResolution::Rejected;
    }
    match schema.equivalence_connection(first_attr, second_attr) {
        Some(connection) => JoinResolution::Join(EquivalenceJoin {
            first: first_node,
            connection: connection.to_vec(),
            second: second_node,
        }),
        None => JoinResolution::Rejected,
    }
}

/// Copies every node and edge of `source` into `target`. Aliases are kept unless they are
/// already taken.
fn copy_into(target: &mut QueryGraph, source: &QueryGraph) -> FxHashMap<NodeId, NodeId> {
    let mut mapping = FxHashMap::default();
    for node in source.nodes() {
        let instance = source.node(node).clone();
        let alias = source.alias(node);
        let id = if target.node_by_alias(alias).is_some() {
            target.add_node(instance)
        } else {
            target.add_node_with_alias(instance, alias.to_string())
        };
        mapping.insert(node, id);
    }
    for id in source.edge_ids() {
        let edge = source.edge(id);
        target.add_edge(
            mapping[&edge.from],
            edge.join.foreign_key,
            mapping[&edge.to],
        );
    }
    mapping
}

/// The union of both inputs plus the foreign-key joins of every equivalence join, applied in
/// order. `joins` refer to nodes of `first` and `second` respectively.
pub fn merge_queries(
    schema: &Schema,
    first: &QueryGraph,
    second: &QueryGraph,
    joins: &[EquivalenceJoin],
) -> QueryGraph {
    let mut merged = QueryGraph::new();
    let first_mapping = copy_into(&mut merged, first);
    let second_mapping = copy_into(&mut merged, second);

    for join in joins {
        let mut last = first_mapping[&join.first];
        let target = second_mapping[&join.second];
        let mut current: Option<(ForeignKeyId, bool)> = None;
        for step in &join.connection {
            match *step {
                ConnectionStep::Join { fk, natural } => current = Some((fk, natural)),
                ConnectionStep::Table(table) => {
                    let Some((fk, natural)) = current else {
                        continue;
                    };
                    let next = merged.add_node(TableInstance::new_virtual(schema, table));
                    let (from, to) = if natural { (last, next) } else { (next, last) };
                    let edge = merged.add_edge(from, fk, to);
                    let (from, to) = merge_virtual_nodes(&mut merged, from, edge, to);
                    last = if natural { to } else { from };
                }
            }
        }
        if let Some((fk, natural)) = current {
            let (from, to) = if natural { (last, target) } else { (target, last) };
            let edge = merged.add_edge(from, fk, to);
            merge_virtual_nodes(&mut merged, from, edge, to);
        }
    }
    merged
}

/// Looks for another edge with the foreign key of `added` that makes one of the two virtual
/// nodes redundant. Returns (kept, dropped) plus the possibly moved endpoints.
fn find_redundant(
    query: &QueryGraph,
    first: NodeId,
    added: EdgeId,
    second: NodeId,
) -> Option<((NodeId, NodeId), NodeId, NodeId)> {
    let fk = query.edge(added).join.foreign_key;
    let mut candidates: Vec<_> = query
        .edges_from(first)
        .chain(query.edges_to(second))
        .map(|(id, _)| id)
        .filter(|&id| id != added)
        .collect();
    candidates.sort();
    candidates.dedup();

    for id in candidates {
        let edge = query.edge(id);
        if edge.join.foreign_key != fk {
            continue;
        }
        if edge.from == first && query.node(edge.to).is_virtual() {
            return Some(((second, edge.to), first, second));
        }
        if edge.from == first && query.node(second).is_virtual() {
            return Some(((edge.to, second), first, edge.to));
        }
        if edge.to == second && query.node(edge.from).is_virtual() {
            return Some(((first, edge.from), first, second));
        }
        if edge.to == second && query.node(first).is_virtual() {
            return Some(((edge.from, first), edge.from, second));
        }
    }
    None
}

/// Removes later duplicates of (from, foreign key, to). Returns the edge that now stands for
/// `added`.
fn dedupe_edges(query: &mut QueryGraph, mut added: EdgeId) -> EdgeId {
    let mut seen = FxHashMap::default();
    let ids: Vec<_> = query.edge_ids().collect();
    for id in ids {
        let edge = *query.edge(id);
        let key = (edge.from, edge.join.foreign_key, edge.to);
        match seen.get(&key) {
            Some(&kept) => {
                query.remove_edge(id);
                if id == added {
                    added = kept;
                }
            }
            None => {
                seen.insert(key, id);
            }
        }
    }
    added
}

/// Collapses virtual nodes made redundant by the edge `added` between `first` and `second`
/// until none are left. Every step removes a node or an edge. Returns the endpoints of the
/// added join after merging.
pub fn merge_virtual_nodes(
    query: &mut QueryGraph,
    mut first: NodeId,
    mut added: EdgeId,
    mut second: NodeId,
) -> (NodeId, NodeId) {
    while let Some(((keep, drop), new_first, new_second)) =
        find_redundant(query, first, added, second)
    {
        first = new_first;
        second = new_second;
        if keep != drop {
            debug!(
                "Merging virtual node {} into {}",
                query.alias(drop),
                query.alias(keep)
            );
            query.redirect_edges(drop, keep);
            query.remove_node(drop);
        }
        added = dedupe_edges(query, added);
    }
    (first, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fk, imdb_schema, instance, table};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rustc_hash::FxHashSet;

    fn single(schema: &Schema, table_name: &str, alias: &str) -> QueryGraph {
        let mut query = QueryGraph::new();
        query.add_node_with_alias(instance(schema, table_name), alias.to_string());
        query
    }

    fn movie_join(
        schema: &Schema,
        first: &QueryGraph,
        first_alias: &str,
        second: &QueryGraph,
        second_alias: &str,
    ) -> EquivalenceJoin {
        let column = |query: &QueryGraph, alias: &str| {
            let table = query.node(query.node_by_alias(alias).unwrap()).table();
            let name = schema.table(table).name().to_string();
            (alias.to_string(), name)
        };
        let (first_alias, first_table) = column(first, first_alias);
        let (second_alias, second_table) = column(second, second_alias);
        let left_column = if first_table == "title" { "id" } else { "movie_id" };
        let right_column = if second_table == "title" { "id" } else { "movie_id" };
        match resolve_join(
            schema,
            first,
            second,
            (&first_alias, left_column),
            (&second_alias, right_column),
        ) {
            JoinResolution::Join(join) => join,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn virtual_nodes(query: &QueryGraph) -> Vec<NodeId> {
        query
            .nodes()
            .filter(|&node| query.node(node).is_virtual())
            .collect()
    }

    #[test]
    fn test_direct_foreign_key() {
        let schema = imdb_schema();
        let mc = single(&schema, "movie_companies", "mc");
        let t = single(&schema, "title", "t");
        let join = movie_join(&schema, &mc, "mc", &t, "t");
        let merged = merge_queries(&schema, &mc, &t, &[join]);
        assert_eq!(merged.node_count(), 2);
        assert_eq!(merged.edge_count(), 1);
        assert!(virtual_nodes(&merged).is_empty());
        let (_, edge) = merged.edges().next().unwrap();
        assert_eq!(merged.alias(edge.from), "mc");
        assert_eq!(merged.alias(edge.to), "t");
        assert_eq!(
            edge.join.foreign_key,
            fk(&schema, "movie_companies_movie_id_fkey")
        );
    }

    #[test]
    fn test_join_through_virtual_node() {
        let schema = imdb_schema();
        let mc = single(&schema, "movie_companies", "mc");
        let mi = single(&schema, "movie_info", "mi");
        let join = movie_join(&schema, &mc, "mc", &mi, "mi");
        let merged = merge_queries(&schema, &mc, &mi, &[join]);
        let virtual_nodes = virtual_nodes(&merged);
        assert_eq!(virtual_nodes.len(), 1);
        assert_eq!(merged.node(virtual_nodes[0]).table(), table(&schema, "title"));
        assert_eq!(merged.edges_to(virtual_nodes[0]).count(), 2);
        assert_eq!(merged.alias(virtual_nodes[0]), "n1");
        assert_eq!(
            merged.sql(&schema, false),
            "SELECT *\nFROM movie_companies AS mc\n\tJOIN movie_info AS mi ON mi.movie_id = mc.movie_id;"
        );
    }

    #[test]
    fn test_existing_virtual_node_is_reused() {
        let schema = imdb_schema();
        let mut first = single(&schema, "movie_companies", "mc");
        let mc = first.node_by_alias("mc").unwrap();
        let title = first.add_node(TableInstance::new_virtual(&schema, table(&schema, "title")));
        first.add_edge(mc, fk(&schema, "movie_companies_movie_id_fkey"), title);
        let mi = single(&schema, "movie_info", "mi");

        let join = movie_join(&schema, &first, "mc", &mi, "mi");
        let merged = merge_queries(&schema, &first, &mi, &[join]);
        let virtual_nodes = virtual_nodes(&merged);
        assert_eq!(virtual_nodes.len(), 1);
        let sources: Vec<_> = merged
            .edges_to(virtual_nodes[0])
            .map(|(_, edge)| merged.alias(edge.from).to_string())
            .collect();
        assert_eq!(sources, vec!["mc", "mi"]);
        assert_eq!(merged.edge_count(), 2);
    }

    #[test]
    fn test_three_way_join_shares_one_virtual_node() {
        let schema = imdb_schema();
        let mc = single(&schema, "movie_companies", "mc");
        let mi = single(&schema, "movie_info", "mi");
        let join = movie_join(&schema, &mc, "mc", &mi, "mi");
        let first = merge_queries(&schema, &mc, &mi, &[join]);
        let mk = single(&schema, "movie_keyword", "mk");

        let joins = vec![
            movie_join(&schema, &first, "mi", &mk, "mk"),
            movie_join(&schema, &first, "mc", &mk, "mk"),
        ];
        let merged = merge_queries(&schema, &first, &mk, &joins);
        let virtual_nodes = virtual_nodes(&merged);
        assert_eq!(virtual_nodes.len(), 1);
        assert_eq!(merged.edges_to(virtual_nodes[0]).count(), 3);
        assert_eq!(merged.edge_count(), 3);
        assert_eq!(
            merged.real_aliases().into_iter().collect::<Vec<_>>(),
            vec!["mc", "mi", "mk"]
        );
    }

    #[test]
    fn test_resolve_join() {
        let schema = imdb_schema();
        let mc = single(&schema, "movie_companies", "mc");
        let mi = single(&schema, "movie_info", "mi");
        assert!(matches!(
            resolve_join(&schema, &mc, &mi, ("mi", "movie_id"), ("mc", "movie_id")),
            JoinResolution::Join(EquivalenceJoin { .. })
        ));
        assert_eq!(
            resolve_join(&schema, &mc, &mi, ("mc", "note"), ("mi", "info")),
            JoinResolution::Rejected
        );
        assert_eq!(
            resolve_join(&schema, &mc, &mi, ("mc", "missing"), ("mi", "movie_id")),
            JoinResolution::Rejected
        );
        assert_eq!(
            resolve_join(&schema, &mc, &mi, ("t", "id"), ("mi", "movie_id")),
            JoinResolution::Orphaned
        );
    }

    #[test]
    fn test_find_alias() {
        let schema = imdb_schema();
        let mc = single(&schema, "movie_companies", "mc");
        let mi = single(&schema, "movie_info", "mi");
        assert_eq!(find_alias(&schema, &mc, &mi, "company_id", None), Some("mc".to_string()));
        assert_eq!(find_alias(&schema, &mc, &mi, "info", None), Some("mi".to_string()));
        assert_eq!(find_alias(&schema, &mc, &mi, "movie_id", None), None);
        assert_eq!(find_alias(&schema, &mc, &mi, "movie_id", Some(1)), Some("mi".to_string()));
        assert_eq!(find_alias(&schema, &mc, &mi, "missing", Some(0)), None);
    }

    proptest! {
        #[test]
        fn dedup_reaches_fixed_point(picks in prop::collection::vec((0usize..3, 0usize..2), 1..8)) {
            let schema = imdb_schema();
            let mut first = QueryGraph::new();
            for (name, alias) in [("movie_companies", "mc"), ("movie_info", "mi"), ("movie_companies", "mc2")] {
                first.add_node_with_alias(instance(&schema, name), alias.to_string());
            }
            let mut second = QueryGraph::new();
            for (name, alias) in [("movie_keyword", "mk"), ("movie_keyword", "mk2")] {
                second.add_node_with_alias(instance(&schema, name), alias.to_string());
            }
            let first_aliases = ["mc", "mi", "mc2"];
            let second_aliases = ["mk", "mk2"];
            let joins: Vec<_> = picks
                .iter()
                .map(|&(a, b)| movie_join(&schema, &first, first_aliases[a], &second, second_aliases[b]))
                .collect();
            let merged = merge_queries(&schema, &first, &second, &joins);

            let mut targets = FxHashSet::default();
            let mut edges = FxHashSet::default();
            for (_, edge) in merged.edges() {
                prop_assert!(merged.contains(edge.from) && merged.contains(edge.to));
                prop_assert!(edges.insert((edge.from, edge.join.foreign_key, edge.to)));
                if merged.node(edge.to).is_virtual() {
                    prop_assert!(targets.insert((edge.from, edge.join.foreign_key)));
                }
            }
            for node in virtual_nodes(&merged) {
                prop_assert!(merged.edges_to(node).count() >= 2);
            }
            prop_assert_eq!(merged.real_aliases().len(), 5);
        }
    }
}
