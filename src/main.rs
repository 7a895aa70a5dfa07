use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use prorecon::config::{ApiKeys, Config};
use prorecon::ledger::CostLedger;
use prorecon::oracle::{AskOptions, HttpBackend, RoutedOracle, Router, TruncationMode};
use prorecon::pipeline::{Pipeline, Stage};
use prorecon::report;
use prorecon::store::OutcomeStore;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "prorecon",
    about = "Reconcile patient-reported outcomes across trial registry, ethics submission and publication",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./prorecon.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cost ledger project label
    #[arg(long, global = true)]
    project: Option<String>,

    /// Debug logging and the lower truncation ceiling
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Shorten oversized prompts without asking
    #[arg(short, long, global = true)]
    yes: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify, attach counterparts, match and export
    Run(SheetArgs),
    /// Fetch registry records and classify their outcomes
    Classify(SheetArgs),
    /// Attach ethical and publication outcomes from the sheet
    Attach(SheetArgs),
    /// Match every trial that has all three outcome lists
    Match,
    /// Write the discrepancy report
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the cost ledger figures of the project
    Cost,
    /// Send one prompt through the tiered router
    Ask {
        prompt: String,
        /// Request a JSON object
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug)]
struct SheetArgs {
    /// Workbook with one row per trial (overrides the config)
    #[arg(long)]
    sheet: Option<PathBuf>,

    /// Stop after this many trials have been classified
    #[arg(long)]
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::load(cli.config.as_deref());
    if let Some(project) = &cli.project {
        config.oracle.project = project.clone();
    }
    if cli.verbose {
        config.routing.verbose = true;
    }

    match cli.command {
        Commands::Run(args) => run_stages(config, cli.yes, &Stage::ALL, args).await,
        Commands::Classify(args) => run_stages(config, cli.yes, &[Stage::Classify], args).await,
        Commands::Attach(args) => run_stages(config, cli.yes, &[Stage::Attach], args).await,
        Commands::Match => {
            let args = SheetArgs { sheet: None, limit: None };
            run_stages(config, cli.yes, &[Stage::Match], args).await
        }
        Commands::Export { output } => {
            let store = OutcomeStore::new(&config.paths.store);
            let path = output.unwrap_or(config.paths.report);
            let rows = report::export(&store, &path)?;
            println!("Wrote {} rows to {}", rows, path.display());
            Ok(())
        }
        Commands::Cost => {
            let ledger = CostLedger::new(&config.paths.ledger);
            let project = &config.oracle.project;
            match ledger.project(project) {
                Some(cost) => {
                    println!("{}", ledger.report(project));
                    println!(
                        "Tokens: {} prompt, {} completion, {} total",
                        cost.prompt_tokens, cost.completion_tokens, cost.total_tokens
                    );
                }
                None => println!("No usage recorded for project '{}'", project),
            }
            Ok(())
        }
        Commands::Ask { prompt, json } => {
            let (router, ledger) = build_router(&config, cli.yes)?;
            let project = config.oracle.project.as_str();
            start_run(&ledger, project);
            let options = AskOptions {
                system_role: None,
                tier: None,
                json_mode: json,
            };
            let answer = router.ask(&prompt, options).await;
            finish_run(&ledger, project);
            println!("{}", answer?);
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_router(config: &Config, yes: bool) -> Result<(Router<HttpBackend>, CostLedger)> {
    let keys = ApiKeys::from_env();
    if !keys.any() {
        tracing::warn!("no API keys found; set OPENAI_API_KEY, GEMINI_API_KEY or REPLICATE_API_TOKEN");
    }
    let backend = HttpBackend::new(&config.oracle, keys).context("Failed to create oracle client")?;
    let ledger = CostLedger::new(&config.paths.ledger);
    let truncation = if yes { TruncationMode::Always } else { TruncationMode::Ask };
    let router = Router::new(
        backend,
        ledger.clone(),
        config.oracle.project.clone(),
        config.routing.clone(),
        truncation,
    );
    Ok((router, ledger))
}

async fn run_stages(mut config: Config, yes: bool, stages: &[Stage], args: SheetArgs) -> Result<()> {
    if let Some(sheet) = args.sheet {
        config.sheet.workbook = sheet;
    }
    let (router, ledger) = build_router(&config, yes)?;
    let oracle = RoutedOracle::new(router, config.oracle.task_tier, config.oracle.system_role.clone());
    let project = config.oracle.project.clone();

    start_run(&ledger, &project);
    let mut summary = Pipeline::new(&config, &oracle).run(stages, args.limit).await;
    summary.cost = finish_run(&ledger, &project);

    println!("{}", summary);
    for error in &summary.errors {
        println!("  failed: {}", error);
    }
    Ok(())
}

fn start_run(ledger: &CostLedger, project: &str) {
    if let Err(err) = ledger.start_run(project) {
        tracing::warn!(error = %err, "failed to open run in cost ledger");
    }
}

fn finish_run(ledger: &CostLedger, project: &str) -> Option<prorecon::ledger::RunCost> {
    match ledger.finish_run(project) {
        Ok(cost) => Some(cost),
        Err(err) => {
            tracing::warn!(error = %err, "failed to close run in cost ledger");
            None
        }
    }
}
