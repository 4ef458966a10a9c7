use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use emicast::{
    api::{ApiClient, QueryOptions, DEFAULT_BASE_URL},
    diagnose::{sweep, SweepOptions},
    model::{fit, Formula, LinearModel},
    predict::{project, ProjectOptions, ScenarioInput, SimulationOptions},
    table::DataTable,
};
use std::{fs, path::PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "emicast")]
#[command(about = "Emissions regression and scenario projection", long_about = None)]
struct Cli {
    /// Base URL of the emissions data API.
    #[arg(long, default_value = DEFAULT_BASE_URL, global = true)]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check the data service status.
    Health,
    /// Query emissions rows and write them as CSV.
    Query(QueryArgs),
    /// Fit a regression model against a data file.
    Estimate(EstimateArgs),
    /// Project scenarios through a fitted model.
    Project(ProjectArgs),
    /// Fit a grid of candidate formulas and rank them.
    Diagnose(DiagnoseArgs),
}

#[derive(Args)]
struct QueryArgs {
    /// State (2-digit) or county (5-digit) FIPS code.
    #[arg(long)]
    geoid: String,
    /// Pollutant code.
    #[arg(long)]
    pollutant: String,
    /// Aggregation level.
    #[arg(long, default_value = "overall")]
    level: String,
    #[arg(long)]
    sourcetype: Option<String>,
    #[arg(long)]
    regclass: Option<String>,
    #[arg(long)]
    fueltype: Option<String>,
    #[arg(long)]
    roadtype: Option<String>,
    /// Comma-separated activity variables to request.
    #[arg(long, default_value = "vmt,vehicles,starts,sourcehours")]
    vars: String,
    /// Output CSV path; stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct EstimateArgs {
    /// Input data CSV.
    data: PathBuf,
    /// Model formula, e.g. `log(emissions) ~ vmt + poly(year, 2)`.
    #[arg(short, long)]
    formula: String,
    /// Where to save the fitted model as JSON.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct ProjectArgs {
    /// Fitted model JSON from `estimate`.
    model: PathBuf,
    /// Baseline data CSV the scenario is built against.
    data: PathBuf,
    /// Scenario values, `name=v1,v2,...`, repeatable; must include the
    /// stratifying variable.
    #[arg(long = "set", value_name = "NAME=VALUES")]
    set: Vec<String>,
    /// Stratifying variable.
    #[arg(long, default_value = "year")]
    stratify_by: String,
    /// Baseline columns excluded from prediction, comma-separated.
    #[arg(long, default_value = "geoid")]
    exclude: String,
    /// Skip the pre/post benchmark context rows.
    #[arg(long)]
    no_context: bool,
    /// Two-sided confidence level.
    #[arg(long, default_value_t = 0.95)]
    ci: f64,
    /// Back-transform simulation draws.
    #[arg(long, default_value_t = 1000)]
    draws: usize,
    /// Seed for reproducible simulation.
    #[arg(long)]
    seed: Option<u64>,
    /// Output CSV path; stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct DiagnoseArgs {
    /// Input data CSV.
    data: PathBuf,
    /// Outcome column.
    #[arg(long, default_value = "emissions")]
    outcome: String,
    /// Comma-separated predictor columns.
    #[arg(long, default_value = "vmt,year")]
    predictors: String,
    /// Highest polynomial degree to try.
    #[arg(long, default_value_t = 2)]
    max_degree: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder().with_env_filter(env).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Health => health(&cli.base_url).await,
        Command::Query(args) => query(&cli.base_url, args).await,
        Command::Estimate(args) => estimate(args),
        Command::Project(args) => run_project(args),
        Command::Diagnose(args) => diagnose(args),
    }
}

async fn health(base_url: &str) -> Result<()> {
    let client = ApiClient::with_base_url(base_url)?;
    let health = client.health().await?;
    println!(
        "status: {}{}",
        health.status,
        health
            .version
            .map(|v| format!(" (version {v})"))
            .unwrap_or_default()
    );
    Ok(())
}

async fn query(base_url: &str, args: QueryArgs) -> Result<()> {
    let client = ApiClient::with_base_url(base_url)?;
    let mut opts = QueryOptions::new(&args.geoid, &args.pollutant)
        .with_level(&args.level)
        .with_vars(split_list(&args.vars));
    if let Some(v) = &args.sourcetype {
        opts = opts.with_sourcetype(v);
    }
    if let Some(v) = &args.regclass {
        opts = opts.with_regclass(v);
    }
    if let Some(v) = &args.fueltype {
        opts = opts.with_fueltype(v);
    }
    if let Some(v) = &args.roadtype {
        opts = opts.with_roadtype(v);
    }

    let table = client.query(&opts).await?;
    write_csv(&table.to_csv_string()?, args.out.as_deref())
}

fn estimate(args: EstimateArgs) -> Result<()> {
    let table = read_table(&args.data)?;
    let formula = Formula::parse(&args.formula)?;
    let model = fit(&formula, &table)?;

    println!("formula:  {}", model.formula().text());
    println!(
        "n = {}, residual df = {}, R^2 = {:.4}, adj R^2 = {:.4}, BIC = {:.1}",
        model.n_obs(),
        model.df(),
        model.r_squared(),
        model.adj_r_squared(),
        model.bic()
    );
    for (name, value) in model
        .coefficient_names()
        .iter()
        .zip(model.coefficients().iter())
    {
        println!("  {name:<16} {value:>14.6}");
    }

    if let Some(out) = &args.out {
        let json = serde_json::to_string_pretty(&model).context("serializing model")?;
        fs::write(out, json).with_context(|| format!("writing {}", out.display()))?;
        info!(path = %out.display(), "model saved");
    }
    Ok(())
}

fn run_project(args: ProjectArgs) -> Result<()> {
    let json = fs::read_to_string(&args.model)
        .with_context(|| format!("reading {}", args.model.display()))?;
    let model: LinearModel = serde_json::from_str(&json)
        .with_context(|| format!("decoding model from {}", args.model.display()))?;
    let baseline = read_table(&args.data)?;

    let mut input = ScenarioInput::new();
    for assignment in &args.set {
        let (name, values) = parse_set(assignment)?;
        input.insert(name, values);
    }

    let mut opts = ProjectOptions {
        simulation: SimulationOptions {
            confidence: args.ci,
            draws: args.draws,
            seed: args.seed,
        },
        ..Default::default()
    };
    opts.scenario.stratify_by = args.stratify_by.clone();
    opts.scenario.exclude = split_list(&args.exclude);
    opts.scenario.include_context = !args.no_context;

    let table = project(&model, &baseline, &input, &opts)?;
    write_csv(&table.to_csv_string()?, args.out.as_deref())
}

fn diagnose(args: DiagnoseArgs) -> Result<()> {
    let table = read_table(&args.data)?;
    let opts = SweepOptions {
        max_degree: args.max_degree,
        poly_var: None,
    };
    let report = sweep(&table, &args.outcome, &split_list(&args.predictors), &opts)?;

    println!(
        "{} candidates, {} fitted",
        report.entries.len(),
        report.n_fitted()
    );
    for entry in &report.entries {
        match (entry.r_squared, entry.adj_r_squared, entry.bic) {
            (Some(r2), Some(adj), Some(bic)) => println!(
                "{} {:<48} R^2 = {r2:.4}  adj = {adj:.4}  BIC = {bic:.1}",
                if entry.best { "*" } else { " " },
                entry.formula,
            ),
            _ => println!(
                "  {:<48} failed: {}",
                entry.formula,
                entry.error.as_deref().unwrap_or("unknown")
            ),
        }
    }
    Ok(())
}

fn read_table(path: &PathBuf) -> Result<DataTable> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(DataTable::from_csv_str(&text)?)
}

fn write_csv(csv: &str, out: Option<&std::path::Path>) -> Result<()> {
    match out {
        Some(path) => {
            fs::write(path, csv).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "wrote CSV");
        }
        None => print!("{csv}"),
    }
    Ok(())
}

/// Split a comma-separated list, dropping empty items.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse a `name=v1,v2,...` scenario assignment.
fn parse_set(assignment: &str) -> Result<(String, Vec<f64>)> {
    let (name, rest) = assignment
        .split_once('=')
        .with_context(|| format!("`{assignment}` is not of the form name=v1,v2,..."))?;
    let values = rest
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .with_context(|| format!("`{v}` in `{assignment}` is not a number"))
        })
        .collect::<Result<Vec<f64>>>()?;
    if values.is_empty() {
        anyhow::bail!("`{assignment}` supplies no values");
    }
    Ok((name.trim().to_string(), values))
}
