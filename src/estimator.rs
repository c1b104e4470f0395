//! Cardinality estimators. An estimator only has to handle connected queries; queries with
//! cross products are split into their factors and the factor estimates multiplied.
//!
//! `-1` is the estimate for anything that cannot be estimated: a missing query, a factor that
//! cannot be estimated or a backend statement that timed out.
use crate::backend::{Backend, BackendError, Result};
use crate::query::QueryGraph;
use crate::schema::Schema;
use log::debug;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const UNKNOWN: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum EstimatorKind {
    Planner,
    True,
    Clueless,
}

pub trait Estimator: Send + Sync {
    fn estimate_connected(&self, schema: &Schema, query: &QueryGraph) -> Result<f64>;

    fn estimate(&self, schema: &Schema, query: Option<&QueryGraph>) -> Result<f64> {
        let Some(query) = query else {
            return Ok(UNKNOWN);
        };
        if !query.detect_cross_product() {
            return self.estimate_connected(schema, query);
        }
        let mut product = 1.0;
        for factor in query.eliminate_cross_product(schema) {
            let estimate = self.estimate_connected(schema, &factor)?;
            if estimate == UNKNOWN {
                return Ok(UNKNOWN);
            }
            product *= estimate;
        }
        Ok(product)
    }

    /// Estimates of every query of every batch, flattened in order.
    fn bulk_estimate(&self, schema: &Schema, queries: &[Vec<Option<QueryGraph>>]) -> Result<Vec<f64>> {
        queries
            .iter()
            .flatten()
            .map(|query| self.estimate(schema, query.as_ref()))
            .collect()
    }

    fn estimate_with_latency(&self, schema: &Schema, query: &QueryGraph) -> Result<(f64, Duration)> {
        let start = Instant::now();
        let estimate = self.estimate(schema, Some(query))?;
        Ok((estimate, start.elapsed()))
    }
}

impl<E: Estimator + ?Sized> Estimator for Box<E> {
    fn estimate_connected(&self, schema: &Schema, query: &QueryGraph) -> Result<f64> {
        (**self).estimate_connected(schema, query)
    }

    fn estimate(&self, schema: &Schema, query: Option<&QueryGraph>) -> Result<f64> {
        (**self).estimate(schema, query)
    }

    fn bulk_estimate(&self, schema: &Schema, queries: &[Vec<Option<QueryGraph>>]) -> Result<Vec<f64>> {
        (**self).bulk_estimate(schema, queries)
    }
}

/// The backend planner's own row estimate for the query.
pub struct PlannerEstimator<'a> {
    backend: &'a dyn Backend,
}

impl<'a> PlannerEstimator<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }
}

impl Estimator for PlannerEstimator<'_> {
    fn estimate_connected(&self, schema: &Schema, query: &QueryGraph) -> Result<f64> {
        match self.backend.explain(&query.sql(schema, false), &[]) {
            Ok(explain) => Ok(explain.plan.plan_rows),
            Err(BackendError::Timeout) => Ok(UNKNOWN),
            Err(err) => Err(err),
        }
    }
}

/// Runs `COUNT(*)` of the query on the backend.
pub struct TrueCardinalityEstimator<'a> {
    backend: &'a dyn Backend,
}

impl<'a> TrueCardinalityEstimator<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }
}

impl Estimator for TrueCardinalityEstimator<'_> {
    fn estimate_connected(&self, schema: &Schema, query: &QueryGraph) -> Result<f64> {
        match self.backend.count(&query.sql(schema, true)) {
            Ok(count) => Ok(count),
            Err(err @ (BackendError::Timeout | BackendError::Rejected(_))) => {
                debug!("No true cardinality for {:?}: {}", query.real_aliases(), err);
                Ok(UNKNOWN)
            }
            Err(err) => Err(err),
        }
    }
}

/// Knows nothing. Every query is left to the backend's own estimate.
pub struct CluelessEstimator;

impl Estimator for CluelessEstimator {
    fn estimate_connected(&self, _schema: &Schema, _query: &QueryGraph) -> Result<f64> {
        Ok(UNKNOWN)
    }
}

/// Remembers the estimate of every connected query by its SQL.
pub struct Remembering<E> {
    inner: E,
    memory: Mutex<FxHashMap<String, f64>>,
}

impl<E: Estimator> Remembering<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            memory: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn reset(&self) {
        if let Ok(mut memory) = self.memory.lock() {
            memory.clear();
        }
    }

    pub fn remembered(&self) -> usize {
        self.memory.lock().map_or(0, |memory| memory.len())
    }
}

impl<E: Estimator> Estimator for Remembering<E> {
    fn estimate_connected(&self, schema: &Schema, query: &QueryGraph) -> Result<f64> {
        let key = query.sql(schema, false);
        let remembered = self
            .memory
            .lock()
            .ok()
            .and_then(|memory| memory.get(&key).copied());
        if let Some(estimate) = remembered {
            return Ok(estimate);
        }
        let estimate = self.inner.estimate_connected(schema, query)?;
        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(key, estimate);
        }
        Ok(estimate)
    }
}

/// Splits bulk estimation over the rayon thread pool. Every worker fills its own slice of the
/// pre-sized output, so the order of the estimates is that of the input.
pub struct ParallelEstimator<E> {
    inner: E,
    chunk_size: usize,
}

impl<E: Estimator> ParallelEstimator<E> {
    pub fn new(inner: E, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl<E: Estimator> Estimator for ParallelEstimator<E> {
    fn estimate_connected(&self, schema: &Schema, query: &QueryGraph) -> Result<f64> {
        self.inner.estimate_connected(schema, query)
    }

    fn estimate(&self, schema: &Schema, query: Option<&QueryGraph>) -> Result<f64> {
        self.inner.estimate(schema, query)
    }

    fn bulk_estimate(&self, schema: &Schema, queries: &[Vec<Option<QueryGraph>>]) -> Result<Vec<f64>> {
        let flat: Vec<Option<&QueryGraph>> = queries.iter().flatten().map(Option::as_ref).collect();
        let mut estimates = vec![UNKNOWN; flat.len()];
        estimates
            .par_chunks_mut(self.chunk_size)
            .zip(flat.par_chunks(self.chunk_size))
            .try_for_each(|(slots, queries)| {
                for (slot, query) in slots.iter_mut().zip(queries) {
                    *slot = self.inner.estimate(schema, *query)?;
                }
                Ok::<_, BackendError>(())
            })?;
        Ok(estimates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::TableInstance;
    use crate::test_utils::{fk, imdb_schema, table, FixedEstimator, ScriptedBackend};
    use pretty_assertions::assert_eq;

    fn joined(schema: &Schema) -> QueryGraph {
        let mut query = QueryGraph::new();
        let t = query.add_node_with_alias(
            TableInstance::new(table(schema, "title"), 10.0, vec![]),
            "t".to_string(),
        );
        let mc = query.add_node_with_alias(
            TableInstance::new(table(schema, "movie_companies"), 20.0, vec![]),
            "mc".to_string(),
        );
        query.add_edge(mc, fk(schema, "movie_companies_movie_id_fkey"), t);
        query
    }

    #[test]
    fn test_cross_product_is_multiplied() {
        let schema = imdb_schema();
        let mut query = QueryGraph::new();
        query.add_node(TableInstance::new(table(&schema, "title"), 10.0, vec![]));
        query.add_node(TableInstance::new(table(&schema, "kind_type"), 7.0, vec![]));
        let estimator = FixedEstimator::new();
        assert_eq!(estimator.estimate(&schema, Some(&query)).unwrap(), 70.0);
        assert_eq!(estimator.estimate(&schema, None).unwrap(), UNKNOWN);

        let estimator = FixedEstimator::new().with_value("kind_type", UNKNOWN);
        assert_eq!(estimator.estimate(&schema, Some(&query)).unwrap(), UNKNOWN);
        assert_eq!(estimator.estimate(&schema, Some(&joined(&schema))).unwrap(), 30.0);
    }

    #[test]
    fn test_backend_estimators() {
        let schema = imdb_schema();
        let query = joined(&schema);
        let backend = ScriptedBackend::new()
            .with_rows("JOIN movie_companies", 42.0)
            .with_count("COUNT(*)", 17.0);
        assert_eq!(
            PlannerEstimator::new(&backend).estimate(&schema, Some(&query)).unwrap(),
            42.0
        );
        assert_eq!(
            TrueCardinalityEstimator::new(&backend)
                .estimate(&schema, Some(&query))
                .unwrap(),
            17.0
        );
        assert!(backend.calls()[1].starts_with("SELECT COUNT(*)"));

        let slow = ScriptedBackend::new().timing_out("movie_companies");
        assert_eq!(
            TrueCardinalityEstimator::new(&slow)
                .estimate(&schema, Some(&query))
                .unwrap(),
            UNKNOWN
        );
        assert_eq!(
            PlannerEstimator::new(&slow).estimate(&schema, Some(&query)).unwrap(),
            UNKNOWN
        );
        let broken = ScriptedBackend::new().disconnected();
        assert!(PlannerEstimator::new(&broken)
            .estimate(&schema, Some(&query))
            .is_err());
        assert_eq!(CluelessEstimator.estimate(&schema, Some(&query)).unwrap(), UNKNOWN);
    }

    #[test]
    fn test_remembering() {
        let schema = imdb_schema();
        let query = joined(&schema);
        let backend = ScriptedBackend::new();
        let estimator = Remembering::new(PlannerEstimator::new(&backend));
        estimator.estimate(&schema, Some(&query)).unwrap();
        estimator.estimate(&schema, Some(&query)).unwrap();
        assert_eq!(backend.calls().len(), 1);
        assert_eq!(estimator.remembered(), 1);
        estimator.reset();
        estimator.estimate(&schema, Some(&query)).unwrap();
        assert_eq!(backend.calls().len(), 2);
    }

    #[test]
    fn test_parallel_bulk_estimate_keeps_order() {
        let schema = imdb_schema();
        let batches: Vec<Vec<Option<QueryGraph>>> = (0..5)
            .map(|batch| {
                (0..7)
                    .map(|idx| {
                        if (batch + idx) % 4 == 0 {
                            return None;
                        }
                        let mut query = QueryGraph::new();
                        query.add_node(TableInstance::new(
                            table(&schema, "title"),
                            (batch * 10 + idx) as f64,
                            vec![],
                        ));
                        Some(query)
                    })
                    .collect()
            })
            .collect();
        let sequential = FixedEstimator::new().bulk_estimate(&schema, &batches).unwrap();
        let parallel = ParallelEstimator::new(FixedEstimator::new(), 3)
            .bulk_estimate(&schema, &batches)
            .unwrap();
        assert_eq!(sequential.len(), 35);
        assert_eq!(parallel, sequential);
        assert_eq!(sequential[0], UNKNOWN);
        assert_eq!(sequential[1], 1.0);
    }
}
