use std::{fs, path::PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use optimizer::{
    ModelSelector, ObjectiveSet, OptimizerConfig, OptimizerDriver, ProfileStore, SearchStrategy,
    SelectionMode,
};
use planner::report::SweepReport;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt::format::FmtSpan};

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Should the logs be printed in json format or not
    #[arg(long, env = "PLANNER_JSON_LOGS", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Select variants, place them on workers and print the deployment plan
    Optimize {
        /// Directory of profile records, one JSON file each
        #[arg(short, long, env = "PLANNER_PROFILES")]
        profiles: PathBuf,

        #[arg(short, long, env = "PLANNER_CONFIG")]
        config: PathBuf,

        /// Overrides the budget of the config file
        #[arg(long)]
        budget: Option<f64>,

        /// Overrides the accuracy floor of the config file
        #[arg(long)]
        accuracy_floor: Option<f64>,

        #[arg(long)]
        latency_slo: Option<f64>,

        /// `exhaustive` or `knapsack`
        #[arg(long, value_parser = parse_strategy)]
        strategy: Option<SearchStrategy>,

        /// Print the runtime's pipeline spec instead of the full plan
        #[arg(long)]
        pipeline_spec: bool,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load the profiles and check them, including end-to-end agreement
    Validate {
        #[arg(short, long, env = "PLANNER_PROFILES")]
        profiles: PathBuf,
    },
    /// Best assignment for each budget, or the cost/accuracy frontier, as CSV
    Sweep {
        #[arg(short, long, env = "PLANNER_PROFILES")]
        profiles: PathBuf,

        /// Objectives and search settings are taken from this file when given
        #[arg(short, long, env = "PLANNER_CONFIG")]
        config: Option<PathBuf>,

        #[arg(long, value_delimiter = ',', required_unless_present = "frontier")]
        budgets: Vec<f64>,

        #[arg(long)]
        frontier: bool,

        #[arg(short, long, default_value = "sweep.csv")]
        output: PathBuf,
    },
}

fn parse_strategy(s: &str) -> Result<SearchStrategy, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown strategy `{s}`, expected `exhaustive` or `knapsack`"))
}

fn setup_logging(json: bool) {
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
    };
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_target(true)
            .with_env_filter(filter())
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    } else {
        let subscriber = tracing_subscriber::fmt()
            .pretty()
            .compact()
            .with_level(true)
            .with_target(true)
            .with_env_filter(filter())
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    }
}

fn optimize(
    profiles: PathBuf,
    config: PathBuf,
    overrides: (Option<f64>, Option<f64>, Option<f64>),
    strategy: Option<SearchStrategy>,
    pipeline_spec: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut config = OptimizerConfig::from_file(&config)?;
    let (budget, accuracy_floor, latency_slo) = overrides;
    config.budget = budget.or(config.budget);
    config.accuracy_floor = accuracy_floor.or(config.accuracy_floor);
    config.latency_slo = latency_slo.or(config.latency_slo);
    config.search.strategy = strategy.or(config.search.strategy);

    let driver = OptimizerDriver::new(config)?;
    let plan = driver.run(&profiles).context("planning deployment")?;
    info!(
        "plan ready: accuracy {}, cost {}, critical path {}",
        plan.weighted_accuracy,
        plan.total_cost,
        plan.critical_path.join(" -> ")
    );
    let json = if pipeline_spec {
        serde_json::to_string_pretty(&plan.pipeline_spec())?
    } else {
        plan.to_json()?
    };
    match output {
        Some(path) => {
            fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
            info!("plan written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn validate(profiles: PathBuf) -> Result<()> {
    let graph = ProfileStore::load_dir(&profiles).context("loading profiles")?;
    OptimizerDriver::check_end_to_end(&graph)?;
    info!(
        "{} stages ({}), {} end-to-end profiles, {} assignments",
        graph.num_stages(),
        graph.topological_order().join(" -> "),
        graph.end_to_end_profiles().len(),
        graph.search_space()
    );
    Ok(())
}

fn sweep(
    profiles: PathBuf,
    config: Option<PathBuf>,
    budgets: Vec<f64>,
    frontier: bool,
    output: PathBuf,
) -> Result<()> {
    let config = match config {
        Some(path) => OptimizerConfig::from_file(&path)?,
        None => OptimizerConfig::default(),
    };
    let graph = ProfileStore::load_dir(&profiles).context("loading profiles")?;
    OptimizerDriver::check_end_to_end(&graph)?;
    let objectives = ObjectiveSet::resolve(&graph, &config.objectives)?;
    let selector = ModelSelector::new(&graph, &objectives, config.search.clone());

    let mut report = SweepReport::new();
    if frontier {
        let frontier = selector.frontier();
        info!("frontier has {} assignments", frontier.len());
        report.push_frontier(&graph, &frontier);
    }
    for budget in budgets {
        if budget.is_nan() {
            bail!("budget must be a number");
        }
        let result = selector.select(SelectionMode::MaximizeAccuracy { budget });
        if let Err(err) = &result {
            warn!("budget {budget}: {err}");
        }
        report.push_selection(&graph, budget, &result);
    }
    report.write(&output)?;
    info!("{} rows written to {}", report.rows().len(), output.display());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.json_logs);
    match args.command {
        Command::Optimize {
            profiles,
            config,
            budget,
            accuracy_floor,
            latency_slo,
            strategy,
            pipeline_spec,
            output,
        } => optimize(
            profiles,
            config,
            (budget, accuracy_floor, latency_slo),
            strategy,
            pipeline_spec,
            output,
        ),
        Command::Validate { profiles } => validate(profiles),
        Command::Sweep {
            profiles,
            config,
            budgets,
            frontier,
            output,
        } => sweep(profiles, config, budgets, frontier, output),
    }
}
