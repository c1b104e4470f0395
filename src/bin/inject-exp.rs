use cardplan::{
    bin_utils, CardinalityInjector, CluelessEstimator, Config, Estimator, EstimatorKind,
    ParallelEstimator, Parser as SqlParser, PlanEngine, PlanReconstructor, PlannerEstimator,
    PsqlBackend, Remembering, Schema, TrueCardinalityEstimator,
};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use serde::Serialize;
use std::error::Error;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
enum Mode {
    /// Rebuild the subplans of each query's plan.
    Reconstruct,
    /// Inject estimates for subplans rebuilt from the subplan order logs.
    Inject,
    /// Inject estimates for subplans rebuilt from the JSON subplan logs.
    ParseInject,
}

#[derive(Parser)]
struct Args {
    #[arg(short = 't', long, default_value_t = 3)]
    num_trials: usize,

    #[arg(long, value_enum, default_value_t = Mode::Inject)]
    mode: Mode,

    #[arg(short, long, value_parser = bin_utils::parse_comma_range_num_list)]
    query: Option<std::vec::Vec<usize>>, // std::vec::Vec keeps clap from expecting several values

    #[arg(short, long, value_parser = bin_utils::parse_comma_estimator_list)]
    estimator: Option<std::vec::Vec<EstimatorKind>>,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    schema: Option<PathBuf>,

    #[arg(long)]
    queries_dir: Option<PathBuf>,

    #[arg(long)]
    output_prefix: Option<String>,

    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    no_output: bool,

    /// Statement timeout in seconds, overriding the config file.
    #[arg(long)]
    timeout: Option<u64>,

    /// Also inject single-table estimates.
    #[arg(long)]
    single_table: bool,

    #[arg(long)]
    only_inner: bool,

    /// Check scan predicates against the backend while rebuilding subplans.
    #[arg(long)]
    parse_predicates: bool,

    /// Estimate in parallel, this many subplans per task.
    #[arg(long)]
    parallel: Option<usize>,

    #[arg(long)]
    remember: bool,

    #[arg(long)]
    print_plan: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Serialize)]
struct Record {
    query: String,
    mode: String,
    estimator: String,
    trial: usize,
    num_subplans: usize,
    estimation_time_ms: u128,
    elapsed_ms: u128,
    runtime_secs: Option<f64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse().with_defaults()?;
    bin_utils::init_logging(args.log_level.parse()?)?;

    let mut config = match args.config.as_ref() {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    if args.timeout.is_some() {
        config.connection.timeout_secs = args.timeout;
    }
    let schema = Schema::from_path(args.schema.as_ref().ok_or("no schema given")?)?;
    let backend = PsqlBackend::new(config.connection.clone());
    let queries = bin_utils::read_queries(
        args.queries_dir.as_ref().ok_or("no queries directory given")?,
        args.query.as_deref(),
    )?;
    info!("Running {} queries", queries.len());

    let mut engine = PlanEngine::new(&schema, &backend, config.engine.clone());
    engine.set_print_plan(args.print_plan);
    let injector = CardinalityInjector::new(&schema, &backend, config.injection.clone())
        .with_only_inner(args.only_inner);
    let reconstructor =
        PlanReconstructor::new(&schema, &backend).with_parse_predicates(args.parse_predicates);
    let parser = SqlParser::new(&schema, &backend);

    let mut records = vec![];
    for (name, sql) in &queries {
        for trial in 0..args.num_trials {
            if args.mode == Mode::Reconstruct {
                let start = Instant::now();
                let subplans = reconstructor.explain_subplans(sql)?;
                records.push(Record {
                    query: name.clone(),
                    mode: args.mode.to_string(),
                    estimator: String::new(),
                    trial,
                    num_subplans: subplans.len(),
                    estimation_time_ms: 0,
                    elapsed_ms: start.elapsed().as_millis(),
                    runtime_secs: None,
                });
                continue;
            }

            for &kind in args.estimator.iter().flatten() {
                info!(
                    "Running query {} trial {} estimator {}",
                    name, trial, kind
                );
                let estimator = make_estimator(kind, &backend, &args);
                let start = Instant::now();
                let (estimation_time, runtime) = if args.mode == Mode::ParseInject {
                    injector.parse_runtime(sql, &*estimator, &engine, args.single_table)?
                } else {
                    let Some(query) = parser.parse(sql)?.into_iter().next() else {
                        warn!("No statement in {}", name);
                        continue;
                    };
                    injector.runtime(&query, &*estimator, &engine, args.single_table)?
                };
                if runtime.is_none() {
                    warn!("Query {} timed out", name);
                }
                records.push(Record {
                    query: name.clone(),
                    mode: args.mode.to_string(),
                    estimator: kind.to_string(),
                    trial,
                    num_subplans: 0,
                    estimation_time_ms: estimation_time.as_millis(),
                    elapsed_ms: start.elapsed().as_millis(),
                    runtime_secs: runtime,
                });
            }
        }
    }

    if !args.no_output {
        if let Some(output) = args.output.as_ref() {
            bin_utils::write_records(output, records)?;
            info!("Wrote {}", output.display());
        }
    }
    Ok(())
}

fn make_estimator<'a>(
    kind: EstimatorKind,
    backend: &'a PsqlBackend,
    args: &Args,
) -> Box<dyn Estimator + 'a> {
    let estimator: Box<dyn Estimator + 'a> = match kind {
        EstimatorKind::Planner => Box::new(PlannerEstimator::new(backend)),
        EstimatorKind::True => Box::new(TrueCardinalityEstimator::new(backend)),
        EstimatorKind::Clueless => Box::new(CluelessEstimator),
    };
    let estimator: Box<dyn Estimator + 'a> = if args.remember {
        Box::new(Remembering::new(estimator))
    } else {
        estimator
    };
    match args.parallel {
        Some(chunk_size) => Box::new(ParallelEstimator::new(estimator, chunk_size)),
        None => estimator,
    }
}

impl Args {
    fn with_defaults(mut self) -> Result<Self, Box<dyn Error>> {
        self.output
            .get_or_insert(bin_utils::default_output_dir().join(format!(
                "{}-{}-{}.csv",
                self.output_prefix.as_deref().unwrap_or("inject-exp"),
                bin_utils::hostname(),
                chrono::Local::now().format("%FT%H%M%S%z")
            )));
        self.queries_dir
            .get_or_insert_with(bin_utils::default_queries_dir);
        self.schema.get_or_insert(
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .join("schemas")
                .join("imdb.json"),
        );
        let default_config = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config.json");
        if self.config.is_none() && default_config.exists() {
            self.config = Some(default_config);
        }
        self.estimator
            .get_or_insert_with(bin_utils::default_estimators);
        if self.parallel == Some(0) {
            return Err("--parallel needs a positive chunk size".into());
        }
        Ok(self)
    }
}
