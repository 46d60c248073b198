//! Strata CLI - plan a query against a declared environment
//!
//! Usage:
//!   strata plan <environment.json> [--select a,b] [--config strata.toml] [--output tree|json|ctes]
//!
//! Examples:
//!   strata plan shop.json --select customer_name,revenue
//!   strata plan shop.json --output ctes --config strata.toml

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use strata::config::Settings;
use strata::discovery::plan_query;
use strata::model::{qualify, EnvironmentFile};
use strata::optimizer::{lower_plan, optimize_ctes, CtePlan};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata - semantic query planning")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a query and print the result
    Plan {
        /// Path to the environment declaration file (JSON)
        file: PathBuf,

        /// Concepts to select, comma separated (defaults to the file's query)
        #[arg(short, long, value_delimiter = ',')]
        select: Vec<String>,

        /// Path to a TOML settings file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format
        #[arg(short, long, default_value = "tree")]
        output: OutputFormat,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Indented plan tree
    Tree,
    /// Lowered plan before optimization, as JSON
    Json,
    /// Optimized CTE list
    Ctes,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Plan {
            file,
            select,
            config,
            output,
        } => cmd_plan(file, select, config, output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("strata={}", level)))
        .unwrap_or_else(|_| EnvFilter::new("strata=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_plan(
    file: PathBuf,
    select: Vec<String>,
    config: Option<PathBuf>,
    output: OutputFormat,
) -> ExitCode {
    let settings = match &config {
        Some(path) => match Settings::load(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error loading config '{}': {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };
    init_logging(&settings.logging.level);

    let source = match fs::read_to_string(&file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading file '{}': {}", file.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let declared = match EnvironmentFile::from_json(&source) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error parsing '{}': {}", file.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let env = match declared.build() {
        Ok(env) => env,
        Err(e) => {
            eprintln!("Invalid environment: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let query = declared.query.unwrap_or_default();
    let select: Vec<String> = if select.is_empty() {
        query.select
    } else {
        select
    };
    let select: Vec<String> = select.iter().map(|s| qualify(s.trim())).collect();
    if select.is_empty() {
        eprintln!("Nothing to select: pass --select or add a query to the file");
        return ExitCode::FAILURE;
    }

    let planned = match plan_query(&env, &select, query.condition.as_ref(), &settings.planner) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Planning error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match output {
        OutputFormat::Tree => {
            println!("{}", planned.explain());
        }
        OutputFormat::Json => {
            let lowered = match lower_plan(&planned.arena, planned.root) {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("Lowering error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            match serde_json::to_string_pretty(&lowered) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Serialization error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
        OutputFormat::Ctes => {
            let optimized = lower_plan(&planned.arena, planned.root)
                .and_then(|p| optimize_ctes(p, &env, &settings.optimizer));
            match optimized {
                Ok(plan) => print_ctes(&plan),
                Err(e) => {
                    eprintln!("Optimization error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
    }
    ExitCode::SUCCESS
}

fn print_ctes(plan: &CtePlan) {
    for cte in &plan.ctes {
        let marker = if cte.name == plan.root { " (root)" } else { "" };
        println!("{} [{}]{}", cte.name, cte.source_type, marker);
        if !cte.parent_ctes.is_empty() {
            println!("  from: {}", cte.parent_ctes.join(", "));
        }
        let datasources: Vec<&str> = cte.datasources.iter().map(|d| d.identifier.as_str()).collect();
        if !datasources.is_empty() {
            println!("  datasources: {}", datasources.join(", "));
        }
        println!("  columns: {}", cte.usable_outputs().join(", "));
        println!("  grain: {}", cte.grain);
        if cte.group_to_grain {
            println!("  grouped");
        }
        if let Some(condition) = &cte.condition {
            println!("  where: {}", condition);
        }
        for (address, literal) in &cte.inlined_constants {
            println!("  constant: {} = {}", address, literal);
        }
    }
}
